// src/discovery/session.rs

//! Per-connection state of the discovery controller.

use crate::core::model::ListenerEntry;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

/// Keep-alive falls back to this when the initiator asks for zero.
pub const DEFAULT_KATO_MS: u32 = 15000;

/// State private to one connection's handler task.
pub struct Session {
    pub controller_id: u16,
    /// Monotone connection sequence, reported as the log page generation.
    pub gen_cnt: u64,
    /// Submission queue head pointer, wraps at 128.
    pub sq_head_ptr: u16,
    pub host_id: [u8; 16],
    pub host_cntlid: u16,
    pub subnqn: [u8; 256],
    pub host_nqn: String,
    /// Controller Configuration register bytes written by the host.
    pub cc: [u8; 8],
    /// Latched once the host writes the shutdown-notification field.
    pub shutdown_now: bool,
    /// Staged discovery log page served slice by slice.
    pub log_page: Vec<u8>,
    pub unsent_log_page_len: usize,
    /// Listeners this host is allowed to see, cached per log-page cycle.
    pub allow_listeners: Vec<ListenerEntry>,
    pub keep_alive_timeout_ms: u32,
}

impl Session {
    pub fn new(controller_id: u16, gen_cnt: u64) -> Self {
        Self {
            controller_id,
            gen_cnt,
            sq_head_ptr: 0,
            host_id: [0; 16],
            host_cntlid: 0,
            subnqn: [0; 256],
            host_nqn: String::new(),
            cc: [0; 8],
            shutdown_now: false,
            log_page: Vec::new(),
            unsent_log_page_len: 0,
            allow_listeners: Vec::new(),
            keep_alive_timeout_ms: 0,
        }
    }

    /// Advances the SQ head pointer, wrapping at the queue size.
    pub fn bump_sq_head(&mut self) -> u16 {
        self.sq_head_ptr += 1;
        if self.sq_head_ptr > super::pdu::SQ_HEAD_MAX {
            self.sq_head_ptr = 1;
        }
        self.sq_head_ptr
    }
}

/// The slice of session state shared with the keep-alive scanner and the
/// async-event fan-out.
pub struct SessionShared {
    pub last_activity: Instant,
    pub keep_alive_timeout_ms: u32,
    /// Mirror of the connection's current SQ head pointer, so async events
    /// carry the value at send time.
    pub sq_head_ptr: u16,
    /// Command id of a parked async-event request.
    pub pending_async: Option<u16>,
    /// Outbound frames of this connection; replies and async events share it.
    pub tx: UnboundedSender<Bytes>,
    /// Signalled by the scanner to evict the connection.
    pub shutdown: Arc<Notify>,
}
