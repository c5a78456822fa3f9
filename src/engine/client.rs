// src/engine/client.rs

//! JSON-RPC 2.0 client for the target engine's UNIX-domain control socket.
//!
//! One client owns one socket and runs one request at a time; concurrent
//! callers serialize through the resource service's RPC lock. The supervisor
//! keeps separate clients for health pings and read-only subsystem listing
//! so those never queue behind mutations.

use crate::core::errors::GwError;
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Delay between connect attempts; the retry budget is `timeout × 5`, i.e.
/// five attempts per configured second.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 16 * 1024;

struct ClientInner {
    stream: UnixStream,
    buf: BytesMut,
}

pub struct EngineClient {
    socket_path: PathBuf,
    timeout: Duration,
    inner: Mutex<ClientInner>,
    next_id: AtomicU64,
}

impl EngineClient {
    /// Connects to the engine control socket with bounded retries; the
    /// engine needs a moment to create the socket after it is spawned.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, GwError> {
        let conn_retries = (timeout.as_secs_f64() * 5.0).max(1.0) as u64;
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..conn_retries {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    if attempt > 0 {
                        debug!(
                            "Connected to engine socket {} after {} attempts",
                            socket_path.display(),
                            attempt + 1
                        );
                    }
                    return Ok(Self {
                        socket_path: socket_path.to_path_buf(),
                        timeout,
                        inner: Mutex::new(ClientInner {
                            stream,
                            buf: BytesMut::with_capacity(READ_CHUNK),
                        }),
                        next_id: AtomicU64::new(1),
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(GwError::Timeout(format!(
            "could not connect to engine socket {}: {}",
            socket_path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Issues one JSON-RPC call and decodes the `result` member. An `error`
    /// member is normalized into `GwError::EngineRpc` with a positive errno.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, GwError> {
        let value = self.call_value(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            GwError::Internal(format!("engine returned malformed {method} response: {e}"))
        })
    }

    /// Same as [`call`] but keeps the raw JSON result.
    pub async fn call_value(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GwError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": id,
        });
        if let Some(p) = params {
            request["params"] = p;
        }

        let mut inner = self.inner.lock().await;
        let response = tokio::time::timeout(self.timeout, Self::round_trip(&mut inner, &request))
            .await
            .map_err(|_| GwError::Timeout(format!("engine call {method} timed out")))??;

        if let Some(resp_id) = response.get("id").and_then(Value::as_u64) {
            if resp_id != id {
                warn!("Engine response id {resp_id} differs from request id {id}");
            }
        }
        if let Some(error) = response.get("error") {
            return Err(Self::normalize_error(method, error));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn round_trip(inner: &mut ClientInner, request: &Value) -> Result<Value, GwError> {
        let payload = serde_json::to_vec(request)?;
        inner.stream.write_all(&payload).await?;

        loop {
            // The engine streams back one JSON object with no explicit
            // framing; parse as soon as a complete value is buffered.
            if !inner.buf.is_empty() {
                let mut iter =
                    serde_json::Deserializer::from_slice(&inner.buf).into_iter::<Value>();
                match iter.next() {
                    Some(Ok(value)) => {
                        let consumed = iter.byte_offset();
                        inner.buf.advance(consumed);
                        return Ok(value);
                    }
                    Some(Err(e)) if e.is_eof() => {}
                    Some(Err(e)) => {
                        return Err(GwError::Internal(format!(
                            "malformed engine response: {e}"
                        )));
                    }
                    None => {}
                }
            }
            let n = inner.stream.read_buf(&mut inner.buf).await?;
            if n == 0 {
                return Err(GwError::Internal(
                    "engine closed the control socket".to_string(),
                ));
            }
        }
    }

    /// The engine reports errors as `{code, message}` with a negative code;
    /// flip it to the positive errno our wire status carries.
    fn normalize_error(method: &str, error: &Value) -> GwError {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0) as i32;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown engine error")
            .to_string();
        let code = if code < 0 { -code } else { code };
        let code = if code == 0 { libc::EINVAL } else { code };
        debug!("Engine call {method} failed with code {code}: {message}");
        GwError::EngineRpc { code, message }
    }
}
