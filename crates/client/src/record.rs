//! Persisted upload records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tus_protocol::UploadStatus;
use url::Url;

use crate::transport::TaskId;

/// How an upload moves its bytes. Decided once, at first dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// One resource, sequential PATCHes.
    Plain,
    /// One partial resource per chunk, merged by a final POST.
    Concatenation,
}

/// Caller stop request waiting for outstanding tasks to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStop {
    /// `Paused` or `Canceled`.
    pub target: UploadStatus,
    /// Re-enter `create_or_resume` once stopped.
    pub then_resume: bool,
}

/// One partial resource of a concatenation-mode upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialUploadState {
    pub chunk_number: usize,
    pub chunk_size: u64,
    pub server_url: Option<Url>,
    #[serde(with = "decimal")]
    pub offset: u64,
    pub status: UploadStatus,
    pub creation_request_id: Option<TaskId>,
    pub offset_request_pending: bool,
}

impl PartialUploadState {
    pub fn new(chunk_number: usize, chunk_size: u64) -> Self {
        Self {
            chunk_number,
            chunk_size,
            server_url: None,
            offset: 0,
            status: UploadStatus::Ready,
            creation_request_id: None,
            offset_request_pending: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == UploadStatus::Finished
    }

    /// A PATCH for this partial is outstanding.
    pub fn is_transferring(&self) -> bool {
        self.status == UploadStatus::Uploading
    }
}

/// One logical file being transferred.
///
/// Build with [`UploadRecord::from_path`] or [`UploadRecord::from_bytes`];
/// everything else is filled in by the engine as protocol steps complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    status: UploadStatus,
    previous_status: Option<UploadStatus>,
    pub mode: Option<TransferMode>,

    #[serde(default, with = "decimal_opt")]
    pub upload_length: Option<u64>,
    #[serde(default, with = "decimal_opt")]
    pub upload_offset: Option<u64>,
    #[serde(default, with = "decimal_opt")]
    pub content_length: Option<u64>,

    pub upload_location: Option<Url>,
    #[serde(default)]
    pub partial_upload_locations: Vec<PartialUploadState>,
    pub merging_request_id: Option<TaskId>,
    #[serde(default)]
    pub current_session_tasks_id: BTreeSet<TaskId>,

    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub source_path: Option<PathBuf>,
    #[serde(skip)]
    pub source_bytes: Option<Vec<u8>>,

    pub pending_stop: Option<PendingStop>,
}

impl UploadRecord {
    fn with_source(source_path: Option<PathBuf>, source_bytes: Option<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: UploadStatus::New,
            previous_status: None,
            mode: None,
            upload_length: None,
            upload_offset: None,
            content_length: None,
            upload_location: None,
            partial_upload_locations: Vec::new(),
            merging_request_id: None,
            current_session_tasks_id: BTreeSet::new(),
            custom_headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
            source_path,
            source_bytes,
            pending_stop: None,
        }
    }

    /// Upload of a file on disk. The file is copied into local storage
    /// on first `create_or_resume`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Some(path.into()), None)
    }

    /// Upload of an in-memory buffer.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::with_source(None, Some(data.into()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn previous_status(&self) -> Option<UploadStatus> {
        self.previous_status
    }

    /// Moves to `status`, remembering the old one unless it was an
    /// interruption or terminal state.
    pub fn set_status(&mut self, status: UploadStatus) {
        if self.status == status {
            return;
        }
        debug!(upload = %self.id, from = %self.status, to = %status, "status change");
        if self.status.is_resumable_history() {
            self.previous_status = Some(self.status);
        }
        self.status = status;
    }

    pub fn has_outstanding_tasks(&self) -> bool {
        !self.current_session_tasks_id.is_empty()
    }

    pub fn owns_task(&self, task: &TaskId) -> bool {
        self.current_session_tasks_id.contains(task)
    }

    pub fn is_concatenation(&self) -> bool {
        self.mode == Some(TransferMode::Concatenation)
    }

    /// Whether a server resource already exists for this upload.
    pub fn is_created(&self) -> bool {
        if self.is_concatenation() {
            self.partial_upload_locations
                .iter()
                .any(|p| p.server_url.is_some())
        } else {
            self.upload_location.is_some()
        }
    }

    pub fn partial_for_url(&self, url: &Url) -> Option<usize> {
        self.partial_upload_locations
            .iter()
            .position(|p| p.server_url.as_ref() == Some(url))
    }

    pub fn partial_for_creation(&self, task: &TaskId) -> Option<usize> {
        self.partial_upload_locations
            .iter()
            .position(|p| p.creation_request_id.as_ref() == Some(task))
    }

    pub fn all_partials_created(&self) -> bool {
        !self.partial_upload_locations.is_empty()
            && self
                .partial_upload_locations
                .iter()
                .all(|p| p.server_url.is_some())
    }

    pub fn all_partials_finished(&self) -> bool {
        !self.partial_upload_locations.is_empty()
            && self
                .partial_upload_locations
                .iter()
                .all(PartialUploadState::is_finished)
    }

    /// Bytes the server has confirmed.
    pub fn confirmed_bytes(&self) -> u64 {
        if self.is_concatenation() {
            self.partial_upload_locations.iter().map(|p| p.offset).sum()
        } else {
            self.upload_offset.unwrap_or(0)
        }
    }

    /// Forgets per-session request bookkeeping after the session's tasks
    /// are gone. Offsets and server URLs are kept.
    pub fn reset_session(&mut self) {
        self.current_session_tasks_id.clear();
        self.merging_request_id = None;
        self.pending_stop = None;
        for partial in &mut self.partial_upload_locations {
            partial.creation_request_id = None;
            partial.offset_request_pending = false;
            if partial.is_transferring() {
                partial.status = UploadStatus::Created;
            }
        }
    }
}

/// `u64` as a decimal string.
mod decimal {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `Option<u64>` as an optional decimal string.
mod decimal_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}
