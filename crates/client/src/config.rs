//! Client configuration.
//!
//! A [`TusConfig`] is built once and handed to [`TusClient::new`](crate::TusClient::new).
//! It can be written to and read from TOML:
//!
//! ```toml
//! endpoint = "https://uploads.example.com/files/"
//! strict_protocol = true
//! concat_mode_if_available = true
//! storage_dir = "/var/lib/app/tus"
//!
//! [chunk_size]
//! size = 8
//! unit = "mebibyte"
//!
//! [headers]
//! Authorization = "Bearer abc"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tus_transfer::ChunkSize;
use url::Url;

use crate::TusError;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TusConfig {
    /// Creation endpoint. Relative `Location` headers resolve against it.
    pub endpoint: Url,

    /// Refuse operations whose extension the server did not advertise.
    #[serde(default)]
    pub strict_protocol: bool,

    /// Upload through partial resources when the server supports
    /// `concatenation`.
    #[serde(default)]
    pub concat_mode_if_available: bool,

    /// Root directory of staged files and chunk data.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Per-request timeout of the HTTP transport, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Fixed chunk size used for PATCH bodies and partial resources.
    #[serde(default)]
    pub chunk_size: ChunkSize,

    /// Headers added to every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_storage_dir() -> PathBuf {
    std::env::temp_dir().join("tus-client")
}

fn default_request_timeout() -> u64 {
    30
}

impl TusConfig {
    /// Configuration with defaults for everything but the endpoint.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            chunk_size: ChunkSize::default(),
            strict_protocol: false,
            concat_mode_if_available: false,
            headers: BTreeMap::new(),
            storage_dir: default_storage_dir(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TusError> {
        let config: TusConfig =
            toml::from_str(content).map_err(|e| TusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, TusError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TusError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TusError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TusError::Config(format!("{}: {e}", parent.display())))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TusError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| TusError::Config(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TusError> {
        if self.chunk_size.value() == 0 {
            return Err(TusError::Config("chunk size must be greater than zero".into()));
        }
        if !matches!(self.endpoint.scheme(), "http" | "https") {
            return Err(TusError::Config(format!(
                "endpoint must be http(s): {}",
                self.endpoint
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
