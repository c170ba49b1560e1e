//! Wire-level vocabulary of the TUS resumable upload protocol.
//!
//! Header names, the protocol version, the extension list advertised by a
//! server, upload lifecycle states and the `Upload-Metadata` encoding.
//! Nothing in this crate performs I/O.

pub mod constants;
pub mod metadata;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{Extension, Method, TUS_VERSION, parse_extensions};
pub use metadata::{decode_metadata, encode_metadata};
pub use types::{ClientStatus, UploadStatus};

/// Errors produced while parsing protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid metadata pair: {0}")]
    InvalidMetadata(String),

    #[error("invalid base64 in metadata value for key {key}")]
    InvalidBase64 { key: String },

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}
