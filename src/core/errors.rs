// src/core/errors.rs

//! Defines the primary error type for the entire gateway.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the gateway.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum GwError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NoDevice(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Busy(String),

    /// The persistent group state moved past our local version; the caller
    /// must reload and retry.
    #[error("Stored state version is newer than the local one")]
    StaleVersion,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    UnknownKey(String),

    /// The operation must be issued to another peer of the group.
    #[error("Operation must be issued to gateway {peer}")]
    RemoteOwner { peer: String },

    /// A structured error returned by the target engine over its control
    /// socket. `code` is already normalized to a positive errno.
    #[error("Engine RPC error {code}: {message}")]
    EngineRpc { code: i32, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GwError {
    /// Prepends an operation context to the carried message while keeping
    /// the status code intact.
    pub fn with_prefix(self, prefix: &str) -> GwError {
        match self {
            GwError::InvalidArgument(s) => GwError::InvalidArgument(format!("{prefix}: {s}")),
            GwError::NotFound(s) => GwError::NotFound(format!("{prefix}: {s}")),
            GwError::NoDevice(s) => GwError::NoDevice(format!("{prefix}: {s}")),
            GwError::AlreadyExists(s) => GwError::AlreadyExists(format!("{prefix}: {s}")),
            GwError::Busy(s) => GwError::Busy(format!("{prefix}: {s}")),
            GwError::Timeout(s) => GwError::Timeout(format!("{prefix}: {s}")),
            GwError::UnknownKey(s) => GwError::UnknownKey(format!("{prefix}: {s}")),
            GwError::EngineRpc { code, message } => GwError::EngineRpc {
                code,
                message: format!("{prefix}: {message}"),
            },
            GwError::Internal(s) => GwError::Internal(format!("{prefix}: {s}")),
            other => other,
        }
    }

    /// Maps the error to the errno-style status code carried on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            GwError::Io(_) => libc::EIO,
            GwError::InvalidArgument(_) => libc::EINVAL,
            GwError::NotFound(_) => libc::ENOENT,
            GwError::NoDevice(_) => libc::ENODEV,
            GwError::AlreadyExists(_) => libc::EEXIST,
            GwError::Busy(_) => libc::EBUSY,
            GwError::StaleVersion => libc::EAGAIN,
            GwError::Timeout(_) => libc::ETIMEDOUT,
            GwError::UnknownKey(_) => libc::ENOKEY,
            GwError::RemoteOwner { .. } => libc::EREMOTE,
            GwError::EngineRpc { code, .. } => *code,
            GwError::Internal(_) => libc::EINVAL,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for GwError {
    fn clone(&self) -> Self {
        match self {
            GwError::Io(e) => GwError::Io(Arc::clone(e)),
            GwError::InvalidArgument(s) => GwError::InvalidArgument(s.clone()),
            GwError::NotFound(s) => GwError::NotFound(s.clone()),
            GwError::NoDevice(s) => GwError::NoDevice(s.clone()),
            GwError::AlreadyExists(s) => GwError::AlreadyExists(s.clone()),
            GwError::Busy(s) => GwError::Busy(s.clone()),
            GwError::StaleVersion => GwError::StaleVersion,
            GwError::Timeout(s) => GwError::Timeout(s.clone()),
            GwError::UnknownKey(s) => GwError::UnknownKey(s.clone()),
            GwError::RemoteOwner { peer } => GwError::RemoteOwner { peer: peer.clone() },
            GwError::EngineRpc { code, message } => GwError::EngineRpc {
                code: *code,
                message: message.clone(),
            },
            GwError::Internal(s) => GwError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for GwError {
    fn from(e: std::io::Error) -> Self {
        GwError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for GwError {
    fn from(e: serde_json::Error) -> Self {
        GwError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<uuid::Error> for GwError {
    fn from(e: uuid::Error) -> Self {
        GwError::InvalidArgument(format!("Invalid UUID: {e}"))
    }
}

/// The message paired with a zero status on the wire, mirroring strerror(0).
pub const SUCCESS_MESSAGE: &str = "Success";
