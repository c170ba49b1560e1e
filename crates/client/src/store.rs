//! Key-value persistence of the upload collection and client flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;
use tus_protocol::{ClientStatus, Extension};

use crate::TusError;
use crate::record::UploadRecord;

/// Key of the JSON array of upload records.
pub const UPLOADS_KEY: &str = "tus.uploads";
/// Key of the client gate status.
pub const STATUS_KEY: &str = "tus.status";
/// Key of the extension names advertised by the server.
pub const EXTENSIONS_KEY: &str = "tus.extensions";

/// Byte-valued key-value storage with last-write-wins semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TusError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), TusError>;
    fn remove(&self, key: &str) -> Result<(), TusError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TusError> {
        let map = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), TusError> {
        let mut map = self.values.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), TusError> {
        let mut map = self.values.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON file of base64 values.
///
/// The file is read once at construction; every write rewrites it.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Result<Self, TusError> {
        let values = load_values(&path)?;
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &HashMap<String, String>) -> Result<(), TusError> {
        let json = serde_json::to_string_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TusError::Store(e.to_string()))?;
        }
        std::fs::write(&self.path, json).map_err(|e| TusError::Store(e.to_string()))?;
        debug!(keys = map.len(), path = %self.path.display(), "persisted store");
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TusError> {
        let map = self.values.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map_err(|e| TusError::Store(format!("{key}: {e}")))
            })
            .transpose()
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), TusError> {
        let mut map = self.values.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_string(), STANDARD.encode(value));
        self.persist(&map)
    }

    fn remove(&self, key: &str) -> Result<(), TusError> {
        let mut map = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if map.remove(key).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }
}

fn load_values(path: &Path) -> Result<HashMap<String, String>, TusError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| TusError::Store(e.to_string()))?;
    let values: HashMap<String, String> = serde_json::from_str(&data)?;
    debug!(keys = values.len(), path = %path.display(), "loaded store");
    Ok(values)
}

/// Typed view over a [`KeyValueStore`] for the engine's own keys.
#[derive(Clone)]
pub struct Snapshot {
    kv: Arc<dyn KeyValueStore>,
}

impl Snapshot {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn load_uploads(&self) -> Result<Vec<UploadRecord>, TusError> {
        match self.kv.get(UPLOADS_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_uploads(&self, uploads: &[UploadRecord]) -> Result<(), TusError> {
        self.kv.set(UPLOADS_KEY, &serde_json::to_vec(uploads)?)
    }

    pub fn load_status(&self) -> Result<ClientStatus, TusError> {
        match self.kv.get(STATUS_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ClientStatus::default()),
        }
    }

    pub fn save_status(&self, status: ClientStatus) -> Result<(), TusError> {
        self.kv.set(STATUS_KEY, &serde_json::to_vec(&status)?)
    }

    /// `None` until a capability probe has succeeded once.
    pub fn load_extensions(&self) -> Result<Option<Vec<Extension>>, TusError> {
        match self.kv.get(EXTENSIONS_KEY)? {
            Some(bytes) => {
                let mut exts: Vec<Extension> = serde_json::from_slice(&bytes)?;
                exts.retain(|e| *e != Extension::Unknown);
                Ok(Some(exts))
            }
            None => Ok(None),
        }
    }

    pub fn save_extensions(&self, extensions: &[Extension]) -> Result<(), TusError> {
        self.kv.set(EXTENSIONS_KEY, &serde_json::to_vec(extensions)?)
    }
}
