use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the RPC runtime core.
///
/// Per-request errors ([`DockRpcError::MethodNotFound`], [`DockRpcError::ArityMismatch`],
/// [`DockRpcError::BadArgument`], [`DockRpcError::HandlerFailed`]) are serialized into an
/// `rpc-response` and never tear down the session. Transport and protocol errors do.
#[derive(Debug, Error)]
pub enum DockRpcError {
    #[error("codec rejected envelope: {0}")]
    BadEnvelope(String),

    #[error("unknown envelope type: {0}")]
    Unknown(String),

    #[error("protocol violation in state {state}: {detail}")]
    ProtocolViolation { state: String, detail: String },

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("arity mismatch for {method}: expected {expected}, got {got}")]
    ArityMismatch {
        method: String,
        expected: usize,
        got: usize,
    },

    #[error("bad argument at index {index}: {reason}")]
    BadArgument { index: usize, reason: String },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("no peer listening after {waited:?}")]
    Unreachable { waited: Duration },

    #[error("peer disconnected")]
    Disconnected,

    #[error("run() called from a non-None status")]
    ErrorStatus,

    #[error("operation attempted against a stopped manager")]
    ErrorManager,

    #[error("write queue is full (capacity {capacity})")]
    WriteBusy { capacity: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DockRpcError {
    /// Stable numeric code for a per-request error.
    pub fn rpc_code(&self) -> i32 {
        match self {
            DockRpcError::MethodNotFound(_) => 404,
            DockRpcError::ArityMismatch { .. } | DockRpcError::BadArgument { .. } => 400,
            DockRpcError::HandlerFailed(_) => 500,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, DockRpcError>;
