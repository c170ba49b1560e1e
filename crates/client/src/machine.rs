//! Pure upload state transitions.
//!
//! [`transition`] maps the current record and one classified protocol
//! event to the next record and the effects the orchestrator must apply.
//! It performs no I/O.

use tus_protocol::constants::HEADER_UPLOAD_OFFSET;
use tus_protocol::{Method, UploadStatus};
use tus_transfer::ChunkPolicy;
use url::Url;

use crate::error::{TransportError, TusError};
use crate::record::UploadRecord;
use crate::transport::TaskId;

/// Upload-specific result of a completed request.
#[derive(Debug)]
pub enum Event {
    /// Plain-mode creation POST returned 201.
    Created { location: Url },
    /// Plain-mode HEAD reported the server offset.
    OffsetRetrieved { offset: u64 },
    /// Plain-mode PATCH accepted, server now at `offset`.
    ChunkAccepted { offset: u64 },
    PartialCreated { chunk: usize, location: Url },
    PartialOffsetRetrieved { chunk: usize, offset: u64 },
    PartialChunkAccepted { chunk: usize, offset: u64 },
    /// Final concatenation POST returned 201.
    Merged { location: Url },
    AuthRequired { status: u16 },
    Rejected { method: Method, status: u16 },
    TransportFailed(TransportError),
    /// Local invariant or response-format violation.
    Violation(TusError),
}

/// Work the orchestrator performs after a transition, in order.
#[derive(Debug)]
pub enum Effect {
    RetrieveOffset,
    Upload,
    CreateForConcatenation,
    RetrieveOffsetForConcatenation,
    UploadForConcatenation,
    Merge,
    /// Cancel these tasks at the transport and ignore their completions.
    CancelOutstanding(Vec<TaskId>),
    NotifyProgress,
    NotifySuccess,
    NotifyFailure(TusError),
    NotifyAuthRequired,
    /// Delete staged data and drop the record.
    Cleanup,
    ReleaseGate,
}

#[derive(Debug)]
pub struct Transition {
    pub record: UploadRecord,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(record: UploadRecord) -> Self {
        Self {
            record,
            effects: Vec::new(),
        }
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn finish(&mut self) {
        let rec = &mut self.record;
        if !rec.is_concatenation() {
            rec.upload_offset = rec.upload_length;
        }
        rec.content_length = None;
        rec.merging_request_id = None;
        rec.set_status(UploadStatus::Finished);
        self.push(Effect::NotifySuccess);
        self.push(Effect::Cleanup);
        self.push(Effect::ReleaseGate);
    }

    /// Stops the upload: outstanding siblings are cancelled so no stale
    /// completion can move it again.
    fn fail(&mut self, error: TusError) {
        self.cancel_outstanding();
        let status = if error.is_transient() {
            UploadStatus::Paused
        } else {
            UploadStatus::Error
        };
        self.record.set_status(status);
        self.push(Effect::NotifyFailure(error));
        self.push(Effect::ReleaseGate);
    }

    fn auth_required(&mut self) {
        self.cancel_outstanding();
        self.record.set_status(UploadStatus::AuthRequired);
        self.push(Effect::NotifyAuthRequired);
        self.push(Effect::ReleaseGate);
    }

    fn cancel_outstanding(&mut self) {
        let tasks: Vec<TaskId> = self
            .record
            .current_session_tasks_id
            .iter()
            .cloned()
            .collect();
        if !tasks.is_empty() {
            self.push(Effect::CancelOutstanding(tasks));
        }
        self.record.reset_session();
        self.record.content_length = None;
    }

    /// Next concatenation step once no creation or HEAD is pending.
    fn advance_concat(&mut self) {
        let rec = &mut self.record;
        let waiting = rec.partial_upload_locations.iter().any(|p| {
            p.server_url.is_none() || p.creation_request_id.is_some() || p.offset_request_pending
        });
        if waiting {
            return;
        }
        if rec.all_partials_finished() {
            if rec.merging_request_id.is_none() {
                if rec.status() != UploadStatus::Uploading {
                    rec.set_status(UploadStatus::Enqueued);
                }
                self.push(Effect::Merge);
            }
            return;
        }
        if rec.status() != UploadStatus::Uploading {
            rec.set_status(UploadStatus::Enqueued);
        }
        self.push(Effect::UploadForConcatenation);
    }
}

/// Computes the next state of `record` after `event`.
pub fn transition(record: &UploadRecord, policy: &ChunkPolicy, event: Event) -> Transition {
    let mut t = Transition::new(record.clone());
    let length = record.upload_length.unwrap_or(0);

    match event {
        Event::Created { location } => {
            t.record.upload_location = Some(location);
            t.record.upload_offset = Some(0);
            t.record.set_status(UploadStatus::Created);
            if length == 0 {
                t.finish();
            } else {
                t.push(Effect::Upload);
            }
        }

        Event::OffsetRetrieved { offset } => {
            if offset > length {
                t.fail(TusError::OffsetOverflow { offset, length });
            } else if offset == length {
                t.finish();
            } else if let Err(e) = policy.chunk_index(offset) {
                t.fail(e.into());
            } else {
                t.record.upload_offset = Some(offset);
                t.push(Effect::Upload);
            }
        }

        Event::ChunkAccepted { offset } => {
            let previous = t.record.upload_offset.unwrap_or(0);
            if offset < previous {
                t.fail(TusError::OffsetRegression {
                    previous,
                    reported: offset,
                });
            } else if offset == previous {
                t.fail(no_progress(offset));
            } else if offset > length {
                t.fail(TusError::OffsetOverflow { offset, length });
            } else {
                t.record.upload_offset = Some(offset);
                t.record.content_length = None;
                t.push(Effect::NotifyProgress);
                if offset == length {
                    t.finish();
                } else if let Err(e) = policy.chunk_index(offset) {
                    t.fail(e.into());
                } else {
                    t.record.set_status(UploadStatus::Uploading);
                    t.push(Effect::Upload);
                }
            }
        }

        Event::PartialCreated { chunk, location } => {
            let Some(partial) = t.record.partial_upload_locations.get_mut(chunk) else {
                t.fail(unknown_chunk(record, chunk));
                return t;
            };
            partial.server_url = Some(location);
            partial.creation_request_id = None;
            partial.offset = 0;
            partial.status = UploadStatus::Created;
            if t.record.status() == UploadStatus::New {
                t.record.set_status(UploadStatus::Created);
            }
            t.advance_concat();
        }

        Event::PartialOffsetRetrieved { chunk, offset } => {
            let Some(partial) = t.record.partial_upload_locations.get_mut(chunk) else {
                t.fail(unknown_chunk(record, chunk));
                return t;
            };
            partial.offset_request_pending = false;
            let size = partial.chunk_size;
            if offset > size {
                t.fail(TusError::OffsetOverflow {
                    offset,
                    length: size,
                });
                return t;
            }
            partial.offset = offset;
            partial.status = if offset == size {
                UploadStatus::Finished
            } else {
                UploadStatus::Created
            };
            t.advance_concat();
        }

        Event::PartialChunkAccepted { chunk, offset } => {
            let Some(partial) = t.record.partial_upload_locations.get_mut(chunk) else {
                t.fail(unknown_chunk(record, chunk));
                return t;
            };
            let (previous, size) = (partial.offset, partial.chunk_size);
            if offset < previous {
                t.fail(TusError::OffsetRegression {
                    previous,
                    reported: offset,
                });
            } else if offset == previous {
                t.fail(no_progress(offset));
            } else if offset > size {
                t.fail(TusError::OffsetOverflow {
                    offset,
                    length: size,
                });
            } else {
                partial.offset = offset;
                partial.status = if offset == size {
                    UploadStatus::Finished
                } else {
                    UploadStatus::Created
                };
                t.push(Effect::NotifyProgress);
                t.advance_concat();
            }
        }

        Event::Merged { location } => {
            t.record.upload_location = Some(location);
            t.finish();
        }

        Event::AuthRequired { status } => {
            tracing::debug!(upload = %record.id, status, "authentication required");
            t.auth_required();
        }

        Event::Rejected { method, status } => t.fail(TusError::Rejected { method, status }),
        Event::TransportFailed(error) => t.fail(error.into()),
        Event::Violation(error) => t.fail(error),
    }

    t
}

fn no_progress(offset: u64) -> TusError {
    TusError::InvalidHeader {
        header: HEADER_UPLOAD_OFFSET,
        value: format!("{offset} (no progress)"),
    }
}

fn unknown_chunk(record: &UploadRecord, chunk: usize) -> TusError {
    TusError::UnknownUpload(format!("{}#{chunk}", record.id))
}
