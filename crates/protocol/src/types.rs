use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Lifecycle state of a single upload.
///
/// Partial (per-chunk) uploads use the subset `Ready`, `Created`,
/// `Uploading` and `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "enqueued")]
    Enqueued,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "auth_required")]
    AuthRequired,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "finished")]
    Finished,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::New => "new",
            UploadStatus::Created => "created",
            UploadStatus::Enqueued => "enqueued",
            UploadStatus::Ready => "ready",
            UploadStatus::Uploading => "uploading",
            UploadStatus::AuthRequired => "auth_required",
            UploadStatus::Error => "error",
            UploadStatus::Paused => "paused",
            UploadStatus::Canceled => "canceled",
            UploadStatus::Finished => "finished",
        }
    }

    /// Whether this status is worth remembering as `previous_status` when
    /// it is replaced. Interruptions and terminal states are not.
    pub fn is_resumable_history(&self) -> bool {
        !matches!(
            self,
            UploadStatus::Canceled
                | UploadStatus::Paused
                | UploadStatus::Error
                | UploadStatus::AuthRequired
                | UploadStatus::Finished
                | UploadStatus::Ready
        )
    }

    /// Stopped by the caller, the server or the network; can be resumed.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            UploadStatus::Paused
                | UploadStatus::Error
                | UploadStatus::AuthRequired
                | UploadStatus::Canceled
        )
    }

    /// Statuses in which requests may be outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UploadStatus::Created | UploadStatus::Enqueued | UploadStatus::Uploading
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => UploadStatus::New,
            "created" => UploadStatus::Created,
            "enqueued" => UploadStatus::Enqueued,
            "ready" => UploadStatus::Ready,
            "uploading" => UploadStatus::Uploading,
            "auth_required" => UploadStatus::AuthRequired,
            "error" => UploadStatus::Error,
            "paused" => UploadStatus::Paused,
            "canceled" => UploadStatus::Canceled,
            "finished" => UploadStatus::Finished,
            other => return Err(ProtocolError::UnknownStatus(other.to_string())),
        })
    }
}

/// Global single-flight gate of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientStatus {
    /// Nothing in progress; the next upload may start.
    #[default]
    #[serde(rename = "ready")]
    Ready,
    /// One upload is being serviced.
    #[serde(rename = "uploading")]
    Uploading,
    /// An OPTIONS capability probe is outstanding.
    #[serde(rename = "retrieveCapabilities")]
    RetrieveCapabilities,
}
