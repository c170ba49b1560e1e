use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{TransferError, validate_storage_name, validate_upload_id};

/// Extension of the staged copy of an upload's source.
const STAGED_EXTENSION: &str = "upload";

/// Local storage for staged uploads and their materialized chunks.
///
/// Names passed to [`exists`](ChunkStore::exists) and
/// [`delete`](ChunkStore::delete) are relative to the storage root.
pub trait ChunkStore: Send + Sync {
    /// Copies `source` into storage under `upload_id`. Returns its size.
    fn stage_file(&self, upload_id: &str, source: &Path) -> Result<u64, TransferError>;

    /// Writes `data` into storage under `upload_id`. Returns its size.
    fn stage_bytes(&self, upload_id: &str, data: &[u8]) -> Result<u64, TransferError>;

    /// Size of the staged source.
    fn size(&self, upload_id: &str) -> Result<u64, TransferError>;

    /// Reads `length` bytes of the staged source starting at `offset`.
    fn read(&self, upload_id: &str, offset: u64, length: u64) -> Result<Vec<u8>, TransferError>;

    /// Writes one chunk's bytes to `<upload_id>/<chunk_index>` and returns
    /// the absolute path of the written file.
    fn write(&self, data: &[u8], upload_id: &str, chunk_index: usize)
    -> Result<PathBuf, TransferError>;

    fn exists(&self, name: &str) -> bool;

    /// Whether `upload_id` has a staged source.
    fn is_staged(&self, upload_id: &str) -> bool {
        self.exists(&staged_name(upload_id))
    }

    /// Deletes a file or directory. Returns `false` if nothing was there.
    fn delete(&self, name: &str) -> Result<bool, TransferError>;

    /// Removes the staged source and every chunk of an upload.
    fn remove_upload(&self, upload_id: &str) -> Result<(), TransferError> {
        self.delete(&staged_name(upload_id))?;
        self.delete(upload_id)?;
        Ok(())
    }
}

/// Storage name of the staged source of `upload_id`.
pub fn staged_name(upload_id: &str) -> String {
    format!("{upload_id}.{STAGED_EXTENSION}")
}

/// Filesystem-backed [`ChunkStore`] rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, TransferError> {
        validate_storage_name(name)?;
        Ok(self.root.join(name))
    }

    fn staged_path(&self, upload_id: &str) -> Result<PathBuf, TransferError> {
        validate_upload_id(upload_id)?;
        self.resolve(&staged_name(upload_id))
    }

    fn open_staged(&self, upload_id: &str) -> Result<File, TransferError> {
        let path = self.staged_path(upload_id)?;
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotStaged(upload_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl ChunkStore for FsChunkStore {
    fn stage_file(&self, upload_id: &str, source: &Path) -> Result<u64, TransferError> {
        let dest = self.staged_path(upload_id)?;
        let size = std::fs::copy(source, &dest)?;
        debug!(upload_id, source = %source.display(), size, "staged file");
        Ok(size)
    }

    fn stage_bytes(&self, upload_id: &str, data: &[u8]) -> Result<u64, TransferError> {
        let dest = self.staged_path(upload_id)?;
        let mut file = File::create(&dest)?;
        file.write_all(data)?;
        file.sync_all()?;
        debug!(upload_id, size = data.len(), "staged bytes");
        Ok(data.len() as u64)
    }

    fn size(&self, upload_id: &str) -> Result<u64, TransferError> {
        Ok(self.open_staged(upload_id)?.metadata()?.len())
    }

    fn read(&self, upload_id: &str, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        let mut file = self.open_staged(upload_id)?;
        let size = file.metadata()?.len();
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(TransferError::OutOfRange {
                offset,
                length,
                size,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(
        &self,
        data: &[u8],
        upload_id: &str,
        chunk_index: usize,
    ) -> Result<PathBuf, TransferError> {
        validate_upload_id(upload_id)?;
        let path = self.resolve(&format!("{upload_id}/{chunk_index}"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(data)?;
        Ok(path)
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.exists()).unwrap_or(false)
    }

    fn delete(&self, name: &str) -> Result<bool, TransferError> {
        let path = self.resolve(name)?;
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(name, error = %e, "failed to delete stored file");
                Err(e.into())
            }
        }
    }
}
