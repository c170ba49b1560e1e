//! Chunk boundaries and local chunk storage for resumable uploads.
//!
//! [`ChunkPolicy`] is the single source of truth for how a file splits into
//! chunks; [`FsChunkStore`] stages source files and materializes chunk
//! bytes on disk, one directory per upload.

mod chunked;
mod policy;
mod validation;

pub use chunked::{ChunkStore, FsChunkStore, staged_name};
pub use policy::{ChunkPolicy, ChunkSize, ChunkUnit};
pub use validation::{validate_storage_name, validate_upload_id};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage name: {0}")]
    InvalidPath(String),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("offset {offset} is not a multiple of chunk size {chunk_size}")]
    MisalignedOffset { offset: u64, chunk_size: u64 },

    #[error("read of {length} bytes at offset {offset} exceeds file size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("upload not staged: {0}")]
    NotStaged(String),
}
