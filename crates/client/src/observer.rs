//! Caller notifications.

use tokio::sync::mpsc;
use url::Url;

use crate::TusError;
use crate::record::UploadRecord;

/// Receives upload outcomes. One observer per client.
///
/// Called with the client's state lock held: implementations must not call
/// back into the client synchronously.
pub trait TusObserver: Send + Sync {
    /// Bytes known to be on the server plus bytes sent in flight.
    fn on_progress(&self, _upload: &UploadRecord, _uploaded: u64, _total: u64) {}

    fn on_success(&self, upload: &UploadRecord);

    /// `upload` is `None` when the failure is not tied to one upload
    /// (capability probe, unmatched completion).
    fn on_failure(&self, upload: Option<&UploadRecord>, response: &str, error: Option<&TusError>);

    /// The server answered 401/403. The upload stays parked until retried.
    fn on_auth_required(&self, _upload: Option<&UploadRecord>) {}
}

/// Observer events forwarded by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Progress {
        id: String,
        uploaded: u64,
        total: u64,
    },
    Success {
        id: String,
        location: Option<Url>,
    },
    Failure {
        id: Option<String>,
        message: String,
    },
    AuthRequired {
        id: Option<String>,
    },
}

/// Forwards every notification as an [`UploadEvent`] on a channel.
pub struct ChannelObserver {
    events_tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self { events_tx }, events_rx)
    }

    fn emit(&self, event: UploadEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.events_tx.send(event);
    }
}

impl TusObserver for ChannelObserver {
    fn on_progress(&self, upload: &UploadRecord, uploaded: u64, total: u64) {
        self.emit(UploadEvent::Progress {
            id: upload.id.clone(),
            uploaded,
            total,
        });
    }

    fn on_success(&self, upload: &UploadRecord) {
        self.emit(UploadEvent::Success {
            id: upload.id.clone(),
            location: upload.upload_location.clone(),
        });
    }

    fn on_failure(&self, upload: Option<&UploadRecord>, response: &str, error: Option<&TusError>) {
        let message = match error {
            Some(e) => format!("{response}: {e}"),
            None => response.to_string(),
        };
        self.emit(UploadEvent::Failure {
            id: upload.map(|u| u.id.clone()),
            message,
        });
    }

    fn on_auth_required(&self, upload: Option<&UploadRecord>) {
        self.emit(UploadEvent::AuthRequired {
            id: upload.map(|u| u.id.clone()),
        });
    }
}
