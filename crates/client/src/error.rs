//! Client error types.

use std::fmt;

use tus_protocol::{Method, UploadStatus};

/// How a request failed below the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The task was cancelled through [`Transport::cancel`](crate::Transport::cancel).
    Cancelled,
    /// The connection could not be established or was dropped mid-request.
    ConnectionLost,
    Timeout,
    Other,
}

/// Failure reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "request cancelled")
    }

    /// Whether the same request may succeed later without caller action
    /// beyond resuming.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Cancelled
                | TransportErrorKind::ConnectionLost
                | TransportErrorKind::Timeout
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Cancelled => "cancelled",
            TransportErrorKind::ConnectionLost => "connection lost",
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(s)
    }
}

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error("failed to stage upload {id}: {reason}")]
    Staging { id: String, reason: String },

    #[error("cannot {operation} an upload in status {status}")]
    InvalidStatus {
        operation: &'static str,
        status: UploadStatus,
    },

    #[error("server does not support the {0} extension")]
    ExtensionUnsupported(&'static str),

    #[error("response is missing the {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {header} header: {value}")]
    InvalidHeader { header: &'static str, value: String },

    #[error("server responded with {status} to {method}")]
    Rejected { method: Method, status: u16 },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Store(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] tus_transfer::TransferError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown upload: {0}")]
    UnknownUpload(String),

    #[error("server offset went backwards from {previous} to {reported}")]
    OffsetRegression { previous: u64, reported: u64 },

    #[error("server offset {offset} exceeds length {length}")]
    OffsetOverflow { offset: u64, length: u64 },
}

impl TusError {
    /// Whether the upload should be parked as `paused` rather than `error`.
    pub fn is_transient(&self) -> bool {
        matches!(self, TusError::Transport(e) if e.is_transient())
    }
}
