//! Transport capability: issues requests and reports their lifecycle.
//!
//! A [`Transport`] never blocks the caller. Everything it learns about a
//! request comes back as [`TransportEvent`]s on the channel handed out at
//! construction, in order per task: optional `ResponseHeaders`, any number
//! of `Progress`, then exactly one `Completed`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tus_protocol::Method;
use url::Url;

use crate::error::TransportError;

/// Identifier of one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// Contents of a materialized chunk file.
    File { path: PathBuf, len: u64 },
}

/// A fully built protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TusRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl TusRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Final result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task: TaskId,
    pub method: Method,
    pub url: Url,
    /// HTTP status, if a response arrived.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub error: Option<TransportError>,
}

impl Completion {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind == crate::TransportErrorKind::Cancelled)
    }
}

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Response status line and headers arrived.
    ResponseHeaders { task: TaskId, status: u16 },
    /// Body bytes sent so far for an upload request.
    Progress {
        task: TaskId,
        bytes_sent: u64,
        total_bytes: u64,
    },
    Completed(Completion),
}

impl TransportEvent {
    pub fn task(&self) -> &TaskId {
        match self {
            TransportEvent::ResponseHeaders { task, .. } => task,
            TransportEvent::Progress { task, .. } => task,
            TransportEvent::Completed(c) => &c.task,
        }
    }
}

/// Issues protocol requests.
///
/// Implemented on top of an HTTP client by [`HttpTransport`](crate::HttpTransport);
/// tests use in-memory fakes.
pub trait Transport: Send + Sync {
    /// Starts `request` under `task` and returns immediately.
    fn start(&self, task: TaskId, request: TusRequest) -> Result<(), TransportError>;

    /// Signals a running task to stop. Returns `true` if a running task was
    /// signalled; its `Completed` event (with a cancelled error) follows.
    fn cancel(&self, task: &TaskId) -> bool;

    fn is_running(&self, task: &TaskId) -> bool;
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
