//! Protocol executor: turns upload records into protocol requests.
//!
//! Every operation validates the record's status, registers the new task
//! ids on the record and returns the requests without sending them. The
//! orchestrator persists the record and only then hands the requests to
//! the transport, so a response can never arrive for an unrecorded task.

use std::collections::BTreeMap;
use std::sync::Arc;

use tus_protocol::constants::{
    CONCAT_PARTIAL, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_TUS_RESUMABLE,
    HEADER_UPLOAD_CONCAT, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
    OFFSET_OCTET_STREAM, concat_final_value,
};
use tus_protocol::{Extension, Method, TUS_VERSION, UploadStatus, encode_metadata};
use tus_transfer::{ChunkPolicy, ChunkStore};
use tracing::debug;
use url::Url;

use crate::TusError;
use crate::record::UploadRecord;
use crate::transport::{RequestBody, TaskId, TusRequest};

/// A request ready to be started under its task id.
pub type Dispatch = (TaskId, TusRequest);

pub struct Executor {
    endpoint: Url,
    headers: BTreeMap<String, String>,
    strict: bool,
    policy: ChunkPolicy,
    chunks: Arc<dyn ChunkStore>,
}

impl Executor {
    pub fn new(
        endpoint: Url,
        headers: BTreeMap<String, String>,
        strict: bool,
        policy: ChunkPolicy,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            endpoint,
            headers,
            strict,
            policy,
            chunks,
        }
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// OPTIONS against the endpoint.
    pub fn discover_capabilities(&self) -> Dispatch {
        let request = TusRequest {
            method: Method::Options,
            url: self.endpoint.clone(),
            headers: self.build_headers(None, Vec::new()),
            body: RequestBody::Empty,
        };
        (TaskId::new(), request)
    }

    /// Creation POST.
    pub fn create(
        &self,
        rec: &mut UploadRecord,
        extensions: Option<&[Extension]>,
    ) -> Result<Vec<Dispatch>, TusError> {
        require_status(rec, "create", &[UploadStatus::New])?;
        self.require_extension(extensions, Extension::Creation)?;

        let length = rec.upload_length.unwrap_or(0);
        let headers = self.build_headers(
            Some(rec),
            vec![
                (HEADER_UPLOAD_LENGTH, length.to_string()),
                (
                    HEADER_UPLOAD_METADATA,
                    encode_metadata(&rec.metadata, &rec.id),
                ),
            ],
        );
        let request = TusRequest {
            method: Method::Post,
            url: self.endpoint.clone(),
            headers,
            body: RequestBody::Empty,
        };
        Ok(vec![register(rec, request)])
    }

    /// HEAD of the upload resource.
    pub fn retrieve_offset(&self, rec: &mut UploadRecord) -> Result<Vec<Dispatch>, TusError> {
        let status = rec.status();
        if matches!(
            status,
            UploadStatus::New | UploadStatus::Uploading | UploadStatus::Canceled
        ) {
            return Err(TusError::InvalidStatus {
                operation: "retrieve offset of",
                status,
            });
        }
        let url = rec.upload_location.clone().ok_or(TusError::InvalidStatus {
            operation: "retrieve offset of",
            status,
        })?;

        let request = TusRequest {
            method: Method::Head,
            url,
            headers: self.build_headers(Some(rec), Vec::new()),
            body: RequestBody::Empty,
        };
        Ok(vec![register(rec, request)])
    }

    /// PATCH of the chunk starting at the record's offset.
    pub fn upload(&self, rec: &mut UploadRecord) -> Result<Vec<Dispatch>, TusError> {
        require_status(rec, "upload", UPLOADABLE)?;
        let url = rec.upload_location.clone().ok_or(TusError::InvalidStatus {
            operation: "upload",
            status: rec.status(),
        })?;

        let length = rec.upload_length.unwrap_or(0);
        let offset = rec.upload_offset.unwrap_or(0);
        let index = self.policy.chunk_index(offset)?;
        let len = self.policy.chunk_len_at(length, offset);

        let data = self.chunks.read(&rec.id, offset, len)?;
        let path = self.chunks.write(&data, &rec.id, index)?;
        debug!(upload = %rec.id, chunk = index, offset, len, "uploading chunk");

        let request = TusRequest {
            method: Method::Patch,
            url,
            headers: self.patch_headers(rec, offset, len),
            body: RequestBody::File { path, len },
        };
        rec.content_length = Some(len);
        rec.set_status(UploadStatus::Uploading);
        Ok(vec![register(rec, request)])
    }

    /// One `Upload-Concat: partial` POST per partial without a resource.
    pub fn create_for_concatenation(
        &self,
        rec: &mut UploadRecord,
        extensions: Option<&[Extension]>,
    ) -> Result<Vec<Dispatch>, TusError> {
        require_status(
            rec,
            "create partials of",
            &[UploadStatus::New, UploadStatus::Enqueued],
        )?;
        self.require_extension(extensions, Extension::Concatenation)?;

        let mut dispatches = Vec::new();
        for index in 0..rec.partial_upload_locations.len() {
            let partial = &rec.partial_upload_locations[index];
            if partial.server_url.is_some() || partial.creation_request_id.is_some() {
                continue;
            }
            let headers = self.build_headers(
                Some(rec),
                vec![
                    (HEADER_UPLOAD_LENGTH, partial.chunk_size.to_string()),
                    (HEADER_UPLOAD_CONCAT, CONCAT_PARTIAL.to_string()),
                ],
            );
            let request = TusRequest {
                method: Method::Post,
                url: self.endpoint.clone(),
                headers,
                body: RequestBody::Empty,
            };
            let dispatch = register(rec, request);
            rec.partial_upload_locations[index].creation_request_id = Some(dispatch.0.clone());
            dispatches.push(dispatch);
        }
        debug!(upload = %rec.id, count = dispatches.len(), "creating partial uploads");
        Ok(dispatches)
    }

    /// HEAD of every created partial that is not finished and has no HEAD
    /// outstanding.
    pub fn retrieve_offset_for_concatenation(
        &self,
        rec: &mut UploadRecord,
    ) -> Result<Vec<Dispatch>, TusError> {
        let mut dispatches = Vec::new();
        for index in 0..rec.partial_upload_locations.len() {
            let partial = &rec.partial_upload_locations[index];
            if partial.is_finished() || partial.offset_request_pending {
                continue;
            }
            let Some(url) = partial.server_url.clone() else {
                continue;
            };
            let request = TusRequest {
                method: Method::Head,
                url,
                headers: self.build_headers(Some(rec), Vec::new()),
                body: RequestBody::Empty,
            };
            let dispatch = register(rec, request);
            rec.partial_upload_locations[index].offset_request_pending = true;
            dispatches.push(dispatch);
        }
        Ok(dispatches)
    }

    /// PATCH of every unfinished partial without an outstanding PATCH,
    /// starting at that partial's last known offset.
    pub fn upload_for_concatenation(
        &self,
        rec: &mut UploadRecord,
    ) -> Result<Vec<Dispatch>, TusError> {
        require_status(rec, "upload partials of", UPLOADABLE)?;
        let length = rec.upload_length.unwrap_or(0);

        let mut dispatches = Vec::new();
        for index in 0..rec.partial_upload_locations.len() {
            let partial = &rec.partial_upload_locations[index];
            if partial.is_finished() || partial.is_transferring() {
                continue;
            }
            let Some(url) = partial.server_url.clone() else {
                continue;
            };

            let range = self.policy.chunk_range(length, partial.chunk_number);
            let offset = partial.offset;
            let len = partial.chunk_size.saturating_sub(offset);
            let data = self.chunks.read(&rec.id, range.start + offset, len)?;
            let path = self.chunks.write(&data, &rec.id, partial.chunk_number)?;

            let request = TusRequest {
                method: Method::Patch,
                url,
                headers: self.patch_headers(rec, offset, len),
                body: RequestBody::File { path, len },
            };
            dispatches.push(register(rec, request));
            rec.partial_upload_locations[index].status = UploadStatus::Uploading;
        }

        if !dispatches.is_empty() {
            rec.set_status(UploadStatus::Uploading);
        }
        debug!(upload = %rec.id, count = dispatches.len(), "uploading partials");
        Ok(dispatches)
    }

    /// Final `Upload-Concat` POST over all partial resources.
    pub fn merge(
        &self,
        rec: &mut UploadRecord,
        extensions: Option<&[Extension]>,
    ) -> Result<Vec<Dispatch>, TusError> {
        require_status(
            rec,
            "merge",
            &[UploadStatus::Uploading, UploadStatus::Enqueued],
        )?;
        self.require_extension(extensions, Extension::Concatenation)?;

        let urls: Vec<&str> = rec
            .partial_upload_locations
            .iter()
            .filter_map(|p| p.server_url.as_ref().map(Url::as_str))
            .collect();
        if urls.len() != rec.partial_upload_locations.len() {
            return Err(TusError::InvalidStatus {
                operation: "merge",
                status: rec.status(),
            });
        }

        let headers = self.build_headers(
            Some(rec),
            vec![
                (HEADER_UPLOAD_CONCAT, concat_final_value(urls)),
                (
                    HEADER_UPLOAD_METADATA,
                    encode_metadata(&rec.metadata, &rec.id),
                ),
            ],
        );
        let request = TusRequest {
            method: Method::Post,
            url: self.endpoint.clone(),
            headers,
            body: RequestBody::Empty,
        };
        let dispatch = register(rec, request);
        rec.merging_request_id = Some(dispatch.0.clone());
        Ok(vec![dispatch])
    }

    fn require_extension(
        &self,
        extensions: Option<&[Extension]>,
        extension: Extension,
    ) -> Result<(), TusError> {
        if !self.strict {
            return Ok(());
        }
        match extensions {
            Some(list) if list.contains(&extension) => Ok(()),
            _ => Err(TusError::ExtensionUnsupported(extension.name())),
        }
    }

    fn patch_headers(&self, rec: &UploadRecord, offset: u64, len: u64) -> Vec<(String, String)> {
        self.build_headers(
            Some(rec),
            vec![
                (HEADER_CONTENT_TYPE, OFFSET_OCTET_STREAM.to_string()),
                (HEADER_CONTENT_LENGTH, len.to_string()),
                (HEADER_UPLOAD_OFFSET, offset.to_string()),
            ],
        )
    }

    /// Config headers, overridden by the upload's custom headers, overridden
    /// by protocol headers. Names compare case-insensitively.
    fn build_headers(
        &self,
        rec: Option<&UploadRecord>,
        protocol: Vec<(&'static str, String)>,
    ) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let custom = rec.map(|r| &r.custom_headers);
        let layers = self
            .headers
            .iter()
            .chain(custom.into_iter().flatten())
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(std::iter::once((
                HEADER_TUS_RESUMABLE.to_string(),
                TUS_VERSION.to_string(),
            )))
            .chain(protocol.into_iter().map(|(k, v)| (k.to_string(), v)));

        for (name, value) in layers {
            out.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            out.push((name, value));
        }
        out
    }
}

const UPLOADABLE: &[UploadStatus] = &[
    UploadStatus::Created,
    UploadStatus::Paused,
    UploadStatus::Enqueued,
    UploadStatus::Uploading,
];

fn require_status(
    rec: &UploadRecord,
    operation: &'static str,
    allowed: &[UploadStatus],
) -> Result<(), TusError> {
    if allowed.contains(&rec.status()) {
        Ok(())
    } else {
        Err(TusError::InvalidStatus {
            operation,
            status: rec.status(),
        })
    }
}

/// Assigns a task id and records it on the upload.
fn register(rec: &mut UploadRecord, request: TusRequest) -> Dispatch {
    let task = TaskId::new();
    rec.current_session_tasks_id.insert(task.clone());
    (task, request)
}
