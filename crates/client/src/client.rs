//! Upload orchestrator.
//!
//! [`TusClient`] owns the upload collection and the single-flight gate.
//! Exactly one upload is serviced at a time; others asking to start are
//! queued and picked up when the gate returns to `ready`. All state lives
//! behind one async mutex, so completions for the same upload are applied
//! one after another.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tus_protocol::constants::{
    HEADER_LOCATION, HEADER_TUS_EXTENSION, HEADER_UPLOAD_OFFSET, is_auth_status,
};
use tus_protocol::{ClientStatus, Extension, Method, UploadStatus, parse_extensions};
use tus_transfer::{ChunkPolicy, ChunkStore, FsChunkStore};
use url::Url;

use crate::completion::{Expected, Outcome, classify};
use crate::config::TusConfig;
use crate::executor::{Dispatch, Executor};
use crate::http::HttpTransport;
use crate::machine::{self, Effect, Event};
use crate::observer::TusObserver;
use crate::record::{PartialUploadState, PendingStop, TransferMode, UploadRecord};
use crate::store::{FileStore, KeyValueStore, Snapshot};
use crate::transport::{Completion, TaskId, Transport, TransportEvent};
use crate::TusError;

/// Name of the state file inside the storage directory.
const STATE_FILE: &str = "state.json";
/// Name of the chunk directory inside the storage directory.
const CHUNKS_DIR: &str = "chunks";

/// Resumable upload client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TusClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: TusConfig,
    executor: Executor,
    chunks: Arc<dyn ChunkStore>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn TusObserver>,
    snapshot: Snapshot,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    status: ClientStatus,
    /// Upload holding the gate.
    active: Option<String>,
    /// Uploads waiting for the gate, in request order.
    pending: VecDeque<String>,
    uploads: Vec<UploadRecord>,
    extensions: Option<Vec<Extension>>,
    /// Outstanding OPTIONS probe.
    probe: Option<TaskId>,
    /// Cancelled tasks whose completions must be ignored.
    retired: HashSet<TaskId>,
    /// Body bytes sent so far per in-flight PATCH.
    in_flight: HashMap<TaskId, u64>,
}

impl State {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.uploads.iter().position(|u| u.id == id)
    }

    fn get(&self, id: &str) -> Option<&UploadRecord> {
        self.uploads.iter().find(|u| u.id == id)
    }

    fn owner_of(&self, task: &TaskId) -> Option<usize> {
        self.uploads.iter().position(|u| u.owns_task(task))
    }

    fn anything_outstanding(&self) -> bool {
        self.probe.is_some() || self.uploads.iter().any(UploadRecord::has_outstanding_tasks)
    }

    /// Whether `rec` has requests in flight or holds the gate.
    fn is_busy(&self, rec: &UploadRecord) -> bool {
        rec.has_outstanding_tasks() || self.active.as_deref() == Some(rec.id.as_str())
    }

    fn progress_of(&self, rec: &UploadRecord) -> (u64, u64) {
        let total = rec.upload_length.unwrap_or(0);
        let sending: u64 = rec
            .current_session_tasks_id
            .iter()
            .filter_map(|t| self.in_flight.get(t))
            .sum();
        ((rec.confirmed_bytes() + sending).min(total), total)
    }
}

impl TusClient {
    /// Creates a client over explicit collaborators.
    ///
    /// Persisted uploads are recovered: request bookkeeping from the previous
    /// process is dropped, uploads that were mid-transfer become `paused`
    /// and the gate starts out `ready`.
    pub fn new(
        config: TusConfig,
        kv: Arc<dyn KeyValueStore>,
        chunks: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn TusObserver>,
    ) -> Result<Self, TusError> {
        config.validate()?;
        let policy = ChunkPolicy::new(config.chunk_size)?;
        let snapshot = Snapshot::new(kv);

        let mut uploads = snapshot.load_uploads()?;
        let persisted = snapshot.load_status()?;
        if persisted != ClientStatus::Ready {
            info!(status = ?persisted, "resetting client status after restart");
        }
        uploads.retain(|rec| {
            if rec.status() == UploadStatus::Finished {
                if let Err(e) = chunks.remove_upload(&rec.id) {
                    warn!(upload = %rec.id, error = %e, "failed to remove finished upload data");
                }
                return false;
            }
            true
        });
        for rec in &mut uploads {
            rec.reset_session();
            rec.content_length = None;
            if rec.status() == UploadStatus::Uploading {
                rec.set_status(UploadStatus::Paused);
            }
        }

        let state = State {
            uploads,
            extensions: snapshot.load_extensions()?,
            ..State::default()
        };
        snapshot.save_uploads(&state.uploads)?;
        snapshot.save_status(state.status)?;
        info!(uploads = state.uploads.len(), "upload client ready");

        let executor = Executor::new(
            config.endpoint.clone(),
            config.headers.clone(),
            config.strict_protocol,
            policy,
            chunks.clone(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                executor,
                chunks,
                transport,
                observer,
                snapshot,
                state: Mutex::new(state),
            }),
        })
    }

    /// Client over a JSON state file, on-disk chunks and the HTTP transport,
    /// all under `config.storage_dir`.
    ///
    /// The returned receiver must be driven with [`run`](Self::run).
    pub fn with_http(
        config: TusConfig,
        observer: Arc<dyn TusObserver>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TusError> {
        let kv = Arc::new(FileStore::new(config.storage_dir.join(STATE_FILE))?);
        let chunks = Arc::new(FsChunkStore::new(config.storage_dir.join(CHUNKS_DIR))?);
        let (transport, events) = HttpTransport::new(config.request_timeout())?;
        let client = Self::new(config, kv, chunks, Arc::new(transport), observer)?;
        Ok((client, events))
    }

    /// Applies transport events until the channel closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transport event stream closed");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn_event_loop(
        &self,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run(events).await })
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        let mut st = self.inner.state.lock().await;
        self.inner.handle_event(&mut st, event);
    }

    /// Starts or resumes `upload`. Returns its id.
    ///
    /// Known ids resume the stored record; `headers` are merged into the
    /// upload's custom headers. A finished upload is left alone.
    pub async fn create_or_resume(
        &self,
        upload: UploadRecord,
        headers: Option<BTreeMap<String, String>>,
    ) -> String {
        let id = upload.id.clone();
        let mut st = self.inner.state.lock().await;
        self.inner.create_or_resume(&mut st, upload, headers);
        id
    }

    /// Resumes every upload that is neither finished nor canceled.
    pub async fn resume_all(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st
            .uploads
            .iter()
            .filter(|u| !matches!(u.status(), UploadStatus::Finished | UploadStatus::Canceled))
            .map(|u| u.id.clone())
            .collect();
        for id in ids {
            self.inner.resume(&mut st, &id);
        }
    }

    /// Retries every unfinished upload.
    pub async fn retry_all(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st.uploads.iter().map(|u| u.id.clone()).collect();
        for id in ids {
            self.inner.retry(&mut st, &id, false);
        }
    }

    pub async fn pause_all(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st.uploads.iter().map(|u| u.id.clone()).collect();
        for id in ids {
            self.inner.stop(&mut st, &id, UploadStatus::Paused, false);
        }
    }

    pub async fn cancel_all(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st.uploads.iter().map(|u| u.id.clone()).collect();
        for id in ids {
            self.inner.stop(&mut st, &id, UploadStatus::Canceled, false);
        }
    }

    /// Removes every idle upload together with its staged data.
    pub async fn clean_up(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st
            .uploads
            .iter()
            .filter(|u| !st.is_busy(u))
            .map(|u| u.id.clone())
            .collect();
        for id in ids {
            self.inner.clean_up_upload(&mut st, &id);
        }
    }

    /// Removes one idle upload together with its staged data.
    ///
    /// Fails with `InvalidStatus` while the upload has requests in flight
    /// or holds the gate; pause or cancel it first.
    pub async fn clean_up_upload(&self, id: &str) -> Result<(), TusError> {
        let mut st = self.inner.state.lock().await;
        let Some(rec) = st.get(id) else {
            return Err(TusError::UnknownUpload(id.to_string()));
        };
        if st.is_busy(rec) {
            return Err(TusError::InvalidStatus {
                operation: "clean up",
                status: rec.status(),
            });
        }
        self.inner.clean_up_upload(&mut st, id);
        Ok(())
    }

    /// Retries one upload.
    ///
    /// A mid-flight upload is stopped first and resumed once its requests
    /// have settled. An upload in `error`, or any upload when `forced`, is
    /// re-queued directly.
    pub async fn retry(&self, id: &str, forced: bool) -> Result<(), TusError> {
        let mut st = self.inner.state.lock().await;
        if st.index_of(id).is_none() {
            return Err(TusError::UnknownUpload(id.to_string()));
        }
        self.inner.retry(&mut st, id, forced);
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<(), TusError> {
        let mut st = self.inner.state.lock().await;
        if st.index_of(id).is_none() {
            return Err(TusError::UnknownUpload(id.to_string()));
        }
        self.inner.stop(&mut st, id, UploadStatus::Paused, false);
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<(), TusError> {
        let mut st = self.inner.state.lock().await;
        if st.index_of(id).is_none() {
            return Err(TusError::UnknownUpload(id.to_string()));
        }
        self.inner.stop(&mut st, id, UploadStatus::Canceled, false);
        Ok(())
    }

    /// Sends an OPTIONS probe if the client is idle.
    pub async fn discover_capabilities(&self) {
        let mut st = self.inner.state.lock().await;
        if st.status != ClientStatus::Ready || st.probe.is_some() {
            debug!(status = ?st.status, "capability probe skipped, client busy");
            return;
        }
        self.inner.start_probe(&mut st);
    }

    pub async fn status(&self) -> ClientStatus {
        self.inner.state.lock().await.status
    }

    pub async fn uploads(&self) -> Vec<UploadRecord> {
        self.inner.state.lock().await.uploads.clone()
    }

    pub async fn upload(&self, id: &str) -> Option<UploadRecord> {
        self.inner.state.lock().await.get(id).cloned()
    }

    /// Extensions advertised by the server, once known.
    pub async fn extensions(&self) -> Option<Vec<Extension>> {
        self.inner.state.lock().await.extensions.clone()
    }

    pub fn config(&self) -> &TusConfig {
        &self.inner.config
    }
}

impl Inner {
    fn persist(&self, st: &State) {
        if let Err(e) = self.snapshot.save_uploads(&st.uploads) {
            warn!(error = %e, "failed to persist uploads");
        }
        if let Err(e) = self.snapshot.save_status(st.status) {
            warn!(error = %e, "failed to persist client status");
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    fn create_or_resume(
        &self,
        st: &mut State,
        upload: UploadRecord,
        headers: Option<BTreeMap<String, String>>,
    ) {
        let id = upload.id.clone();
        match st.index_of(&id) {
            Some(idx) => {
                let stored = &mut st.uploads[idx];
                if stored.source_bytes.is_none() {
                    stored.source_bytes = upload.source_bytes;
                }
                if stored.source_path.is_none() {
                    stored.source_path = upload.source_path;
                }
                stored.custom_headers.extend(upload.custom_headers);
            }
            None => {
                if upload.status() == UploadStatus::Finished {
                    debug!(upload = %id, "upload already finished");
                    return;
                }
                st.uploads.push(upload);
            }
        }
        if let Some(headers) = headers
            && let Some(idx) = st.index_of(&id)
        {
            st.uploads[idx].custom_headers.extend(headers);
        }
        self.resume(st, &id);
    }

    /// Stages the upload if needed and either dispatches it or queues it
    /// behind the gate.
    fn resume(&self, st: &mut State, id: &str) {
        let Some(idx) = st.index_of(id) else {
            return;
        };

        let rec = &mut st.uploads[idx];
        if rec.status() == UploadStatus::Finished {
            debug!(upload = %id, "upload already finished");
            return;
        }
        if let Some(stop) = rec.pending_stop.as_mut() {
            stop.then_resume = true;
            debug!(upload = %id, "resume deferred until stop settles");
            self.persist(st);
            return;
        }
        if rec.has_outstanding_tasks() || st.active.as_deref() == Some(id) {
            debug!(upload = %id, "upload already in progress");
            return;
        }

        if let Err(e) = self.stage(&mut st.uploads[idx]) {
            let rec = &mut st.uploads[idx];
            rec.set_status(UploadStatus::Error);
            warn!(upload = %id, error = %e, "staging failed");
            self.persist(st);
            self.observer
                .on_failure(st.get(id), "failed to stage upload", Some(&e));
            return;
        }

        if st.status != ClientStatus::Ready {
            if !st.pending.iter().any(|p| p == id) {
                st.pending.push_back(id.to_string());
            }
            debug!(upload = %id, queued = st.pending.len(), "upload deferred, client busy");
            self.persist(st);
            return;
        }

        st.pending.retain(|p| p != id);
        st.status = ClientStatus::Uploading;
        st.active = Some(id.to_string());

        if st.extensions.is_none()
            && (self.config.strict_protocol || self.config.concat_mode_if_available)
        {
            self.start_probe(st);
            return;
        }
        self.dispatch(st, id);
    }

    fn stage(&self, rec: &mut UploadRecord) -> Result<(), TusError> {
        let staging = |reason: String| TusError::Staging {
            id: rec.id.clone(),
            reason,
        };

        let size = if self.chunks.is_staged(&rec.id) {
            self.chunks.size(&rec.id).map_err(|e| staging(e.to_string()))?
        } else if let Some(bytes) = &rec.source_bytes {
            self.chunks
                .stage_bytes(&rec.id, bytes)
                .map_err(|e| staging(e.to_string()))?
        } else if let Some(path) = &rec.source_path {
            self.chunks
                .stage_file(&rec.id, path)
                .map_err(|e| staging(e.to_string()))?
        } else {
            return Err(staging("no source data".into()));
        };

        rec.source_bytes = None;
        if rec.upload_length.is_none() {
            rec.upload_length = Some(size);
        }
        Ok(())
    }

    fn retry(&self, st: &mut State, id: &str, forced: bool) {
        let Some(idx) = st.index_of(id) else {
            return;
        };
        let rec = &mut st.uploads[idx];
        if rec.status() == UploadStatus::Finished {
            return;
        }
        if rec.has_outstanding_tasks() {
            self.stop(st, id, UploadStatus::Paused, true);
            return;
        }
        if forced || rec.status() == UploadStatus::Error {
            let status = if rec.is_created() {
                UploadStatus::Enqueued
            } else {
                UploadStatus::New
            };
            rec.set_status(status);
        }
        self.resume(st, id);
    }

    /// Pauses or cancels an upload.
    ///
    /// Running tasks are cancelled at the transport; the status only
    /// changes once every one of them has reported back.
    fn stop(&self, st: &mut State, id: &str, target: UploadStatus, then_resume: bool) {
        let Some(idx) = st.index_of(id) else {
            return;
        };
        st.pending.retain(|p| p != id);

        let rec = &mut st.uploads[idx];
        if rec.status() == UploadStatus::Finished {
            return;
        }

        if rec.has_outstanding_tasks() {
            let then_resume = then_resume || rec.pending_stop.is_some_and(|s| s.then_resume);
            rec.pending_stop = Some(PendingStop {
                target,
                then_resume,
            });
            for task in &rec.current_session_tasks_id {
                if self.transport.is_running(task) {
                    self.transport.cancel(task);
                }
            }
            debug!(upload = %id, target = %target, "stop requested, waiting for tasks");
            self.persist(st);
            return;
        }

        if rec.status() != target {
            rec.reset_session();
            rec.set_status(target);
        }
        info!(upload = %id, status = %target, "upload stopped");
        self.release_gate(st, id);
        self.persist(st);
        if then_resume {
            self.resume(st, id);
        }
        self.service_next(st);
    }

    /// Applies a pending stop once the upload's last task has settled.
    fn finalize_stop(&self, st: &mut State, id: &str) {
        let Some(idx) = st.index_of(id) else {
            return;
        };
        let rec = &mut st.uploads[idx];
        let Some(stop) = rec.pending_stop.take() else {
            return;
        };
        rec.reset_session();
        rec.content_length = None;
        rec.set_status(stop.target);
        info!(upload = %id, status = %stop.target, "upload stopped");

        self.release_gate(st, id);
        self.persist(st);
        if stop.then_resume {
            self.resume(st, id);
        }
        self.service_next(st);
    }

    fn clean_up_upload(&self, st: &mut State, id: &str) {
        if let Err(e) = self.chunks.remove_upload(id) {
            warn!(upload = %id, error = %e, "failed to remove upload data");
        }
        st.uploads.retain(|u| u.id != id);
        st.pending.retain(|p| p != id);
        debug!(upload = %id, "upload cleaned up");
        self.persist(st);
    }

    // -----------------------------------------------------------------------
    // Gate
    // -----------------------------------------------------------------------

    /// Releases the gate if `id` holds it. Does not start the next upload.
    fn release_gate(&self, st: &mut State, id: &str) {
        if st.active.as_deref() != Some(id) {
            return;
        }
        st.active = None;
        if st.probe.is_none() {
            st.status = ClientStatus::Ready;
        }
        debug!(upload = %id, "gate released");
    }

    /// Starts queued uploads while the gate is free.
    fn service_next(&self, st: &mut State) {
        while st.status == ClientStatus::Ready {
            let Some(next) = st.pending.pop_front() else {
                break;
            };
            debug!(upload = %next, "servicing queued upload");
            self.resume(st, &next);
        }
    }

    fn start_probe(&self, st: &mut State) {
        let (task, request) = self.executor.discover_capabilities();
        st.probe = Some(task.clone());
        st.status = ClientStatus::RetrieveCapabilities;
        self.persist(st);
        debug!(task = %task, "probing server capabilities");

        if let Err(e) = self.transport.start(task.clone(), request) {
            let completion = Completion {
                task,
                method: Method::Options,
                url: self.config.endpoint.clone(),
                status: None,
                headers: Vec::new(),
                error: Some(e),
            };
            self.on_probe_completion(st, completion);
        }
    }

    fn on_probe_completion(&self, st: &mut State, completion: Completion) {
        st.probe = None;
        let (event, error) = match classify(&completion, Expected::AnySuccess) {
            Outcome::Success { .. } => {
                let extensions = completion
                    .header(HEADER_TUS_EXTENSION)
                    .map(parse_extensions)
                    .unwrap_or_default();
                info!(extensions = ?extensions, "server capabilities discovered");
                if let Err(e) = self.snapshot.save_extensions(&extensions) {
                    warn!(error = %e, "failed to persist extensions");
                }
                st.extensions = Some(extensions);

                match st.active.clone() {
                    Some(id) => {
                        st.status = ClientStatus::Uploading;
                        self.dispatch(st, &id);
                    }
                    None => {
                        st.status = ClientStatus::Ready;
                        self.persist(st);
                        self.service_next(st);
                    }
                }
                return;
            }
            Outcome::AuthRequired { status } => (Event::AuthRequired { status }, None),
            Outcome::Rejected { status } => {
                let method = Method::Options;
                (
                    Event::Rejected { method, status },
                    Some(TusError::Rejected { method, status }),
                )
            }
            Outcome::TransportFailure(e) => (
                Event::TransportFailed(e.clone()),
                Some(TusError::Transport(e)),
            ),
        };

        // Extensions stay unknown, so the next upload to take the gate probes again.
        warn!(event = ?event, "capability probe failed");
        match st.active.clone().filter(|id| st.index_of(id).is_some()) {
            Some(id) => {
                st.status = ClientStatus::Uploading;
                self.apply_event(st, &id, event);
            }
            None => {
                st.active = None;
                match &error {
                    Some(e) => self
                        .observer
                        .on_failure(None, "capability discovery failed", Some(e)),
                    None => self.observer.on_auth_required(None),
                }
                st.status = ClientStatus::Ready;
                self.persist(st);
                self.service_next(st);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Issues the next request(s) for the upload holding the gate.
    fn dispatch(&self, st: &mut State, id: &str) {
        let Some(idx) = st.index_of(id) else {
            self.release_gate(st, id);
            self.service_next(st);
            return;
        };
        let extensions = st.extensions.clone();
        let rec = &mut st.uploads[idx];

        if rec.mode.is_none() {
            let length = rec.upload_length.unwrap_or(0);
            let concat = self.config.concat_mode_if_available
                && length > 0
                && extensions
                    .as_ref()
                    .is_some_and(|e| e.contains(&Extension::Concatenation));
            let mode = if concat {
                TransferMode::Concatenation
            } else {
                TransferMode::Plain
            };
            debug!(upload = %id, mode = ?mode, "transfer mode decided");
            rec.mode = Some(mode);
        }

        let result = if rec.is_concatenation() {
            self.dispatch_concat(rec, extensions.as_deref())
        } else {
            self.dispatch_plain(rec, extensions.as_deref())
        };
        match result {
            Ok(dispatches) => self.send(st, id, dispatches),
            Err(e) => self.apply_event(st, id, Event::Violation(e)),
        }
    }

    fn dispatch_plain(
        &self,
        rec: &mut UploadRecord,
        extensions: Option<&[Extension]>,
    ) -> Result<Vec<Dispatch>, TusError> {
        if rec.upload_location.is_none() {
            rec.set_status(UploadStatus::New);
            return self.executor.create(rec, extensions);
        }
        // HEAD first, then PATCH: both need a resumable status.
        if !matches!(
            rec.status(),
            UploadStatus::Created | UploadStatus::Paused | UploadStatus::Enqueued
        ) {
            rec.set_status(UploadStatus::Paused);
        }
        self.executor.retrieve_offset(rec)
    }

    fn dispatch_concat(
        &self,
        rec: &mut UploadRecord,
        extensions: Option<&[Extension]>,
    ) -> Result<Vec<Dispatch>, TusError> {
        if rec.partial_upload_locations.is_empty() {
            let length = rec.upload_length.unwrap_or(0);
            rec.partial_upload_locations = self
                .executor
                .policy()
                .ranges(length)
                .enumerate()
                .map(|(i, r)| PartialUploadState::new(i, r.end - r.start))
                .collect();
        }

        let mut dispatches = Vec::new();
        if !rec.all_partials_created() {
            if !matches!(rec.status(), UploadStatus::New | UploadStatus::Enqueued) {
                let status = if rec.is_created() {
                    UploadStatus::Enqueued
                } else {
                    UploadStatus::New
                };
                rec.set_status(status);
            }
            dispatches.extend(self.executor.create_for_concatenation(rec, extensions)?);
        }

        let unfinished_created = rec
            .partial_upload_locations
            .iter()
            .any(|p| p.server_url.is_some() && !p.is_finished());
        if unfinished_created {
            dispatches.extend(self.executor.retrieve_offset_for_concatenation(rec)?);
        }

        if dispatches.is_empty() && rec.all_partials_finished() {
            if !matches!(rec.status(), UploadStatus::Uploading | UploadStatus::Enqueued) {
                rec.set_status(UploadStatus::Enqueued);
            }
            dispatches = self.executor.merge(rec, extensions)?;
        }
        Ok(dispatches)
    }

    /// Persists the registered tasks, then starts them.
    fn send(&self, st: &mut State, id: &str, dispatches: Vec<Dispatch>) {
        self.persist(st);
        let mut dispatches = dispatches.into_iter();
        while let Some((task, request)) = dispatches.next() {
            debug!(upload = %id, task = %task, method = %request.method, url = %request.url, "dispatching");
            if let Err(e) = self.transport.start(task.clone(), request) {
                warn!(upload = %id, task = %task, error = %e, "transport refused request");
                // Only tasks the transport accepted are left to cancel.
                if let Some(idx) = st.index_of(id) {
                    let rec = &mut st.uploads[idx];
                    rec.current_session_tasks_id.remove(&task);
                    for (unstarted, _) in dispatches.by_ref() {
                        rec.current_session_tasks_id.remove(&unstarted);
                    }
                }
                self.apply_event(st, id, Event::TransportFailed(e));
                return;
            }
        }
    }

    /// Runs one executor operation for `id` and sends its requests.
    fn run_op<F>(&self, st: &mut State, id: &str, op: F)
    where
        F: FnOnce(&Executor, &mut UploadRecord, Option<&[Extension]>) -> Result<Vec<Dispatch>, TusError>,
    {
        let Some(idx) = st.index_of(id) else {
            return;
        };
        let extensions = st.extensions.clone();
        match op(&self.executor, &mut st.uploads[idx], extensions.as_deref()) {
            Ok(dispatches) => self.send(st, id, dispatches),
            Err(e) => self.apply_event(st, id, Event::Violation(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn handle_event(&self, st: &mut State, event: TransportEvent) {
        match event {
            TransportEvent::Progress {
                task, bytes_sent, ..
            } => {
                let Some(idx) = st.owner_of(&task) else {
                    return;
                };
                if st.uploads[idx].pending_stop.is_some() {
                    return;
                }
                st.in_flight.insert(task, bytes_sent);
                let rec = &st.uploads[idx];
                let (uploaded, total) = st.progress_of(rec);
                self.observer.on_progress(rec, uploaded, total);
            }
            TransportEvent::ResponseHeaders { task, status } => {
                if is_auth_status(status) {
                    self.on_auth_headers(st, task, status);
                }
            }
            TransportEvent::Completed(completion) => self.on_completion(st, completion),
        }
    }

    /// 401/403 seen before the body finished: abort the request right away.
    fn on_auth_headers(&self, st: &mut State, task: TaskId, status: u16) {
        let Some(idx) = st.owner_of(&task) else {
            return;
        };
        if st.uploads[idx].pending_stop.is_some() {
            return;
        }
        let id = st.uploads[idx].id.clone();
        if self.transport.is_running(&task) {
            self.transport.cancel(&task);
        }
        st.uploads[idx].current_session_tasks_id.remove(&task);
        st.in_flight.remove(&task);
        st.retired.insert(task);
        self.apply_event(st, &id, Event::AuthRequired { status });
    }

    fn on_completion(&self, st: &mut State, completion: Completion) {
        let task = completion.task.clone();
        st.in_flight.remove(&task);

        if st.retired.remove(&task) {
            debug!(task = %task, "ignoring completion of retired task");
            return;
        }
        if st.probe.as_ref() == Some(&task) {
            self.on_probe_completion(st, completion);
            return;
        }

        let Some(idx) = st.owner_of(&task) else {
            if completion.is_cancelled() || st.anything_outstanding() {
                debug!(task = %task, "ignoring completion of unknown task");
            } else {
                warn!(task = %task, method = %completion.method, "completion for unknown request");
                self.observer
                    .on_failure(None, "completion for unknown request", None);
            }
            return;
        };

        let id = st.uploads[idx].id.clone();
        st.uploads[idx].current_session_tasks_id.remove(&task);

        if st.uploads[idx].pending_stop.is_some() {
            debug!(upload = %id, task = %task, "discarding completion of stopped upload");
            if st.uploads[idx].has_outstanding_tasks() {
                self.persist(st);
            } else {
                self.finalize_stop(st, &id);
            }
            return;
        }

        let event = self.completion_event(&st.uploads[idx], &completion);
        self.apply_event(st, &id, event);
    }

    /// Maps a completion to the upload-specific event it represents.
    fn completion_event(&self, rec: &UploadRecord, c: &Completion) -> Event {
        #[derive(Clone, Copy)]
        enum Purpose {
            Create,
            Head,
            Patch,
            Merge,
            PartialCreate(usize),
            PartialHead(usize),
            PartialPatch(usize),
        }

        let partial_by_url = || {
            if rec.is_concatenation() {
                rec.partial_for_url(&c.url)
            } else {
                None
            }
        };
        let purpose = match c.method {
            Method::Post if rec.merging_request_id.as_ref() == Some(&c.task) => Purpose::Merge,
            Method::Post => match rec.partial_for_creation(&c.task) {
                Some(k) => Purpose::PartialCreate(k),
                None => Purpose::Create,
            },
            Method::Head => partial_by_url().map_or(Purpose::Head, Purpose::PartialHead),
            Method::Patch => partial_by_url().map_or(Purpose::Patch, Purpose::PartialPatch),
            Method::Options => {
                return Event::Violation(TusError::UnknownUpload(format!(
                    "OPTIONS completion routed to {}",
                    rec.id
                )));
            }
        };

        match classify(c, Expected::for_method(c.method, self.config.strict_protocol)) {
            Outcome::Success { .. } => {
                let event = match purpose {
                    Purpose::Create => self.location(c).map(|location| Event::Created { location }),
                    Purpose::Merge => self.location(c).map(|location| Event::Merged { location }),
                    Purpose::PartialCreate(chunk) => self
                        .location(c)
                        .map(|location| Event::PartialCreated { chunk, location }),
                    Purpose::Head => offset(c).map(|offset| Event::OffsetRetrieved { offset }),
                    Purpose::Patch => offset(c).map(|offset| Event::ChunkAccepted { offset }),
                    Purpose::PartialHead(chunk) => {
                        offset(c).map(|offset| Event::PartialOffsetRetrieved { chunk, offset })
                    }
                    Purpose::PartialPatch(chunk) => {
                        offset(c).map(|offset| Event::PartialChunkAccepted { chunk, offset })
                    }
                };
                event.unwrap_or_else(Event::Violation)
            }
            Outcome::AuthRequired { status } => Event::AuthRequired { status },
            Outcome::Rejected { status } => Event::Rejected {
                method: c.method,
                status,
            },
            Outcome::TransportFailure(e) => Event::TransportFailed(e),
        }
    }

    /// `Location` header resolved against the endpoint.
    fn location(&self, c: &Completion) -> Result<Url, TusError> {
        let value = c
            .header(HEADER_LOCATION)
            .ok_or(TusError::MissingHeader(HEADER_LOCATION))?;
        self.config
            .endpoint
            .join(value)
            .map_err(|_| TusError::InvalidHeader {
                header: HEADER_LOCATION,
                value: value.to_string(),
            })
    }

    fn apply_event(&self, st: &mut State, id: &str, event: Event) {
        let Some(idx) = st.index_of(id) else {
            return;
        };
        let transition = machine::transition(&st.uploads[idx], self.executor.policy(), event);
        st.uploads[idx] = transition.record;
        self.persist(st);
        self.apply_effects(st, id, transition.effects);
    }

    fn apply_effects(&self, st: &mut State, id: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RetrieveOffset => {
                    self.run_op(st, id, |ex, rec, _| ex.retrieve_offset(rec));
                }
                Effect::Upload => self.run_op(st, id, |ex, rec, _| ex.upload(rec)),
                Effect::CreateForConcatenation => {
                    self.run_op(st, id, |ex, rec, exts| ex.create_for_concatenation(rec, exts));
                }
                Effect::RetrieveOffsetForConcatenation => {
                    self.run_op(st, id, |ex, rec, _| ex.retrieve_offset_for_concatenation(rec));
                }
                Effect::UploadForConcatenation => {
                    self.run_op(st, id, |ex, rec, _| ex.upload_for_concatenation(rec));
                }
                Effect::Merge => self.run_op(st, id, |ex, rec, exts| ex.merge(rec, exts)),
                Effect::CancelOutstanding(tasks) => {
                    for task in tasks {
                        if self.transport.is_running(&task) {
                            self.transport.cancel(&task);
                        }
                        st.in_flight.remove(&task);
                        st.retired.insert(task);
                    }
                }
                Effect::NotifyProgress => {
                    if let Some(rec) = st.get(id) {
                        let (uploaded, total) = st.progress_of(rec);
                        self.observer.on_progress(rec, uploaded, total);
                    }
                }
                Effect::NotifySuccess => {
                    if let Some(rec) = st.get(id) {
                        info!(upload = %id, location = ?rec.upload_location.as_ref().map(Url::as_str), "upload finished");
                        self.observer.on_success(rec);
                    }
                }
                Effect::NotifyFailure(error) => {
                    warn!(upload = %id, error = %error, "upload failed");
                    self.observer
                        .on_failure(st.get(id), "upload failed", Some(&error));
                }
                Effect::NotifyAuthRequired => {
                    warn!(upload = %id, "upload requires authentication");
                    self.observer.on_auth_required(st.get(id));
                }
                Effect::Cleanup => self.clean_up_upload(st, id),
                Effect::ReleaseGate => {
                    self.release_gate(st, id);
                    self.persist(st);
                    self.service_next(st);
                }
            }
        }
    }
}

/// `Upload-Offset` header as a byte count.
fn offset(c: &Completion) -> Result<u64, TusError> {
    let value = c
        .header(HEADER_UPLOAD_OFFSET)
        .ok_or(TusError::MissingHeader(HEADER_UPLOAD_OFFSET))?;
    value.trim().parse().map_err(|_| TusError::InvalidHeader {
        header: HEADER_UPLOAD_OFFSET,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tempfile::TempDir;
    use tus_transfer::ChunkSize;

    use crate::error::{TransportError, TransportErrorKind};
    use crate::observer::{ChannelObserver, UploadEvent};
    use crate::store::MemoryStore;
    use crate::transport::TusRequest;

    const ENDPOINT: &str = "https://tus.example.com/files/";

    /// Records started requests; tests complete them by hand.
    #[derive(Default)]
    struct MockTransport {
        started: StdMutex<Vec<(TaskId, TusRequest)>>,
        running: StdMutex<HashSet<TaskId>>,
        cancelled: StdMutex<Vec<TaskId>>,
        offline: AtomicBool,
        /// Starts accepted before the transport goes offline.
        budget: StdMutex<Option<usize>>,
    }

    impl MockTransport {
        fn take(&self) -> Vec<(TaskId, TusRequest)> {
            std::mem::take(&mut *self.started.lock().unwrap())
        }

        fn cancelled(&self) -> Vec<TaskId> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn start(
            &self,
            task: TaskId,
            request: TusRequest,
        ) -> Result<(), crate::error::TransportError> {
            let mut budget = self.budget.lock().unwrap();
            if self.offline.load(Ordering::SeqCst) || *budget == Some(0) {
                return Err(TransportError::new(
                    TransportErrorKind::ConnectionLost,
                    "offline",
                ));
            }
            if let Some(left) = budget.as_mut() {
                *left -= 1;
            }
            self.running.lock().unwrap().insert(task.clone());
            self.started.lock().unwrap().push((task, request));
            Ok(())
        }

        fn cancel(&self, task: &TaskId) -> bool {
            self.cancelled.lock().unwrap().push(task.clone());
            self.running.lock().unwrap().remove(task)
        }

        fn is_running(&self, task: &TaskId) -> bool {
            self.running.lock().unwrap().contains(task)
        }
    }

    struct Harness {
        dir: TempDir,
        kv: Arc<MemoryStore>,
        chunks: Arc<FsChunkStore>,
        transport: Arc<MockTransport>,
        client: TusClient,
        events: mpsc::UnboundedReceiver<UploadEvent>,
    }

    fn config() -> TusConfig {
        let mut config = TusConfig::new(Url::parse(ENDPOINT).unwrap());
        config.chunk_size = ChunkSize::bytes(100);
        config
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    impl Harness {
        fn new(config: TusConfig) -> Self {
            Self::build(config, TempDir::new().unwrap(), Arc::new(MemoryStore::new()))
        }

        fn build(config: TusConfig, dir: TempDir, kv: Arc<MemoryStore>) -> Self {
            let chunks = Arc::new(FsChunkStore::new(dir.path().join("chunks")).unwrap());
            let transport = Arc::new(MockTransport::default());
            let (observer, events) = ChannelObserver::new();
            let client = TusClient::new(
                config,
                kv.clone(),
                chunks.clone(),
                transport.clone(),
                Arc::new(observer),
            )
            .unwrap();
            Self {
                dir,
                kv,
                chunks,
                transport,
                client,
                events,
            }
        }

        /// Same storage, fresh client: simulates a process restart.
        fn restart(self, config: TusConfig) -> Self {
            Self::build(config, self.dir, self.kv)
        }

        async fn respond(
            &self,
            dispatch: &(TaskId, TusRequest),
            status: u16,
            headers: &[(&str, &str)],
        ) {
            let (task, request) = dispatch;
            self.transport.running.lock().unwrap().remove(task);
            let completion = Completion {
                task: task.clone(),
                method: request.method,
                url: request.url.clone(),
                status: Some(status),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                error: None,
            };
            self.client
                .handle_event(TransportEvent::Completed(completion))
                .await;
        }

        async fn fail(&self, dispatch: &(TaskId, TusRequest), error: TransportError) {
            let (task, request) = dispatch;
            self.transport.running.lock().unwrap().remove(task);
            let completion = Completion {
                task: task.clone(),
                method: request.method,
                url: request.url.clone(),
                status: None,
                headers: Vec::new(),
                error: Some(error),
            };
            self.client
                .handle_event(TransportEvent::Completed(completion))
                .await;
        }

        fn drain(&mut self) -> Vec<UploadEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn single(&self) -> (TaskId, TusRequest) {
            let mut started = self.transport.take();
            assert_eq!(started.len(), 1, "expected exactly one request: {started:?}");
            started.remove(0)
        }

        async fn status_of(&self, id: &str) -> UploadStatus {
            self.client.upload(id).await.unwrap().status()
        }
    }

    /// Drives a plain upload through creation so its first PATCH is out.
    async fn created_plain(h: &Harness, id: &str, len: usize) -> (TaskId, TusRequest) {
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(len)).with_id(id), None)
            .await;
        let post = h.single();
        let location = format!("/files/{id}");
        h.respond(&post, 201, &[("Location", location.as_str())])
            .await;
        h.single()
    }

    #[tokio::test]
    async fn plain_upload_in_two_chunks() {
        let mut h = Harness::new(config());
        let id = h
            .client
            .create_or_resume(
                UploadRecord::from_bytes(data(150))
                    .with_id("a")
                    .with_metadata("filename", "a.bin"),
                None,
            )
            .await;
        assert_eq!(id, "a");
        assert_eq!(h.client.status().await, ClientStatus::Uploading);

        let post = h.single();
        assert_eq!(post.1.method, Method::Post);
        assert_eq!(post.1.url.as_str(), ENDPOINT);
        assert_eq!(post.1.header("Upload-Length"), Some("150"));
        h.respond(&post, 201, &[("Location", "/files/abc")]).await;

        let first = h.single();
        assert_eq!(first.1.method, Method::Patch);
        assert_eq!(first.1.url.as_str(), "https://tus.example.com/files/abc");
        assert_eq!(first.1.header("Upload-Offset"), Some("0"));
        assert_eq!(first.1.header("Content-Length"), Some("100"));

        h.client
            .handle_event(TransportEvent::Progress {
                task: first.0.clone(),
                bytes_sent: 60,
                total_bytes: 100,
            })
            .await;
        h.respond(&first, 204, &[("Upload-Offset", "100")]).await;

        let second = h.single();
        assert_eq!(second.1.header("Upload-Offset"), Some("100"));
        assert_eq!(second.1.header("Content-Length"), Some("50"));
        h.respond(&second, 204, &[("Upload-Offset", "150")]).await;

        assert_eq!(
            h.drain(),
            vec![
                UploadEvent::Progress {
                    id: "a".into(),
                    uploaded: 60,
                    total: 150
                },
                UploadEvent::Progress {
                    id: "a".into(),
                    uploaded: 100,
                    total: 150
                },
                UploadEvent::Progress {
                    id: "a".into(),
                    uploaded: 150,
                    total: 150
                },
                UploadEvent::Success {
                    id: "a".into(),
                    location: Some(Url::parse("https://tus.example.com/files/abc").unwrap()),
                },
            ]
        );
        assert!(h.client.upload("a").await.is_none());
        assert!(!h.chunks.is_staged("a"));
        assert_eq!(h.client.status().await, ClientStatus::Ready);
        assert!(h.transport.take().is_empty());
    }

    #[tokio::test]
    async fn concatenation_upload_with_out_of_order_creation() {
        let mut cfg = config();
        cfg.concat_mode_if_available = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(250)).with_id("b"), None)
            .await;

        let probe = h.single();
        assert_eq!(probe.1.method, Method::Options);
        assert_eq!(h.client.status().await, ClientStatus::RetrieveCapabilities);
        h.respond(&probe, 204, &[("Tus-Extension", "creation,concatenation")])
            .await;
        assert_eq!(
            h.client.extensions().await,
            Some(vec![Extension::Creation, Extension::Concatenation])
        );

        let creations = h.transport.take();
        assert_eq!(creations.len(), 3);
        for (_, req) in &creations {
            assert_eq!(req.header("Upload-Concat"), Some("partial"));
        }
        assert_eq!(creations[2].1.header("Upload-Length"), Some("50"));

        h.respond(&creations[2], 201, &[("Location", "/files/p2")]).await;
        h.respond(&creations[0], 201, &[("Location", "/files/p0")]).await;
        assert!(h.transport.take().is_empty());
        h.respond(&creations[1], 201, &[("Location", "/files/p1")]).await;

        let patches = h.transport.take();
        let urls: Vec<&str> = patches.iter().map(|(_, r)| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://tus.example.com/files/p0",
                "https://tus.example.com/files/p1",
                "https://tus.example.com/files/p2",
            ]
        );
        assert_eq!(h.status_of("b").await, UploadStatus::Uploading);

        h.respond(&patches[0], 204, &[("Upload-Offset", "100")]).await;
        h.respond(&patches[1], 204, &[("Upload-Offset", "100")]).await;
        assert!(h.transport.take().is_empty());
        h.respond(&patches[2], 204, &[("Upload-Offset", "50")]).await;

        let merge = h.single();
        assert_eq!(merge.1.method, Method::Post);
        assert_eq!(
            merge.1.header("Upload-Concat"),
            Some(
                "final;https://tus.example.com/files/p0 https://tus.example.com/files/p1 https://tus.example.com/files/p2"
            )
        );
        h.respond(&merge, 201, &[("Location", "/files/final")]).await;

        let events = h.drain();
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress { uploaded, .. } => Some(*uploaded),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![100, 200, 250]);
        assert_eq!(
            events.last(),
            Some(&UploadEvent::Success {
                id: "b".into(),
                location: Some(Url::parse("https://tus.example.com/files/final").unwrap()),
            })
        );
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn early_unauthorized_stops_upload_once() {
        let mut h = Harness::new(config());
        let patch = created_plain(&h, "c", 150).await;

        h.client
            .handle_event(TransportEvent::ResponseHeaders {
                task: patch.0.clone(),
                status: 401,
            })
            .await;
        assert_eq!(h.transport.cancelled(), vec![patch.0.clone()]);
        assert_eq!(h.status_of("c").await, UploadStatus::AuthRequired);

        // The aborted request still reports completion; it must be ignored.
        h.respond(&patch, 401, &[]).await;
        assert_eq!(
            h.drain(),
            vec![UploadEvent::AuthRequired {
                id: Some("c".into())
            }]
        );
        assert!(h.transport.take().is_empty());
        assert_eq!(h.client.status().await, ClientStatus::Ready);

        h.client.retry("c", false).await.unwrap();
        let head = h.single();
        assert_eq!(head.1.method, Method::Head);
        assert_eq!(head.1.url.as_str(), "https://tus.example.com/files/c");
        h.respond(&head, 200, &[("Upload-Offset", "0")]).await;
        assert_eq!(h.single().1.method, Method::Patch);
    }

    #[tokio::test]
    async fn cancel_discards_raced_success() {
        let mut cfg = config();
        cfg.concat_mode_if_available = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(250)).with_id("d"), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 204, &[("Tus-Extension", "creation,concatenation")])
            .await;
        for (i, creation) in h.transport.take().iter().enumerate() {
            let location = format!("/files/d{i}");
            h.respond(creation, 201, &[("Location", location.as_str())])
                .await;
        }
        let patches = h.transport.take();
        assert_eq!(patches.len(), 3);
        h.respond(&patches[0], 204, &[("Upload-Offset", "100")]).await;
        h.drain();

        h.client.cancel("d").await.unwrap();
        assert_eq!(h.transport.cancelled().len(), 2);
        assert_eq!(h.status_of("d").await, UploadStatus::Uploading);

        // Success that raced the cancel.
        h.respond(&patches[1], 204, &[("Upload-Offset", "100")]).await;
        assert_eq!(h.status_of("d").await, UploadStatus::Uploading);
        h.fail(&patches[2], TransportError::cancelled()).await;

        let rec = h.client.upload("d").await.unwrap();
        assert_eq!(rec.status(), UploadStatus::Canceled);
        assert!(!rec.has_outstanding_tasks());
        assert_eq!(rec.partial_upload_locations[0].offset, 100);
        assert_eq!(rec.partial_upload_locations[1].offset, 0);
        assert!(h.drain().is_empty());
        assert!(h.transport.take().is_empty());
        assert_eq!(h.client.status().await, ClientStatus::Ready);

        h.client.clean_up().await;
        assert!(h.client.uploads().await.is_empty());
        assert!(!h.chunks.is_staged("d"));
    }

    #[tokio::test]
    async fn uploads_run_one_at_a_time() {
        let mut h = Harness::new(config());
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("first"), None)
            .await;
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("second"), None)
            .await;
        // Asking again must not queue twice.
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("second"), None)
            .await;

        let post = h.single();
        assert_eq!(post.1.header("Upload-Metadata"), Some("filename Zmlyc3Q="));
        h.respond(&post, 201, &[("Location", "/files/first")]).await;
        let patch = h.single();
        h.respond(&patch, 204, &[("Upload-Offset", "10")]).await;

        let next = h.single();
        assert_eq!(next.1.method, Method::Post);
        assert_eq!(next.1.header("Upload-Metadata"), Some("filename c2Vjb25k"));
        assert!(h.transport.take().is_empty());
        assert!(
            h.drain()
                .iter()
                .any(|e| matches!(e, UploadEvent::Success { id, .. } if id == "first"))
        );
    }

    #[tokio::test]
    async fn zero_length_upload_finishes_on_creation() {
        let mut h = Harness::new(config());
        h.client
            .create_or_resume(UploadRecord::from_bytes(Vec::new()).with_id("empty"), None)
            .await;
        let post = h.single();
        assert_eq!(post.1.header("Upload-Length"), Some("0"));
        h.respond(&post, 201, &[("Location", "/files/empty")]).await;
        assert!(matches!(
            h.drain().as_slice(),
            [UploadEvent::Success { .. }]
        ));
        assert!(h.transport.take().is_empty());
    }

    #[tokio::test]
    async fn finished_upload_is_not_restarted() {
        let mut h = Harness::new(config());
        let mut done = UploadRecord::from_bytes(data(10)).with_id("done");
        done.set_status(UploadStatus::Finished);
        h.client.create_or_resume(done, None).await;
        assert!(h.transport.take().is_empty());
        assert!(h.client.uploads().await.is_empty());
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_without_creation_fails() {
        let mut cfg = config();
        cfg.strict_protocol = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("s"), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 204, &[("Tus-Extension", "termination")]).await;

        assert!(h.transport.take().is_empty());
        assert_eq!(h.status_of("s").await, UploadStatus::Error);
        match h.drain().as_slice() {
            [UploadEvent::Failure { id, message }] => {
                assert_eq!(id.as_deref(), Some("s"));
                assert!(message.contains("creation"), "{message}");
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn strict_head_requires_200() {
        let mut cfg = config();
        cfg.strict_protocol = true;
        let mut h = Harness::new(cfg.clone());
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(150)).with_id("h"), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 204, &[("Tus-Extension", "creation")]).await;
        let post = h.single();
        h.respond(&post, 201, &[("Location", "/files/h")]).await;
        let patch = h.single();
        h.fail(
            &patch,
            TransportError::new(TransportErrorKind::ConnectionLost, "reset"),
        )
        .await;
        assert_eq!(h.status_of("h").await, UploadStatus::Paused);

        h.client.resume_all().await;
        let head = h.single();
        h.respond(&head, 204, &[("Upload-Offset", "100")]).await;
        assert_eq!(h.status_of("h").await, UploadStatus::Error);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            UploadEvent::Failure { message, .. } if message.contains("204")
        )));
    }

    #[tokio::test]
    async fn staging_failure_marks_error() {
        let mut h = Harness::new(config());
        let missing = h.dir.path().join("missing.bin");
        h.client
            .create_or_resume(UploadRecord::from_path(missing).with_id("m"), None)
            .await;
        assert!(h.transport.take().is_empty());
        assert_eq!(h.status_of("m").await, UploadStatus::Error);
        assert!(matches!(
            h.drain().as_slice(),
            [UploadEvent::Failure { id: Some(_), .. }]
        ));
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn file_source_is_copied_into_storage() {
        let h = Harness::new(config());
        let source = h.dir.path().join("photo.jpg");
        std::fs::write(&source, data(30)).unwrap();
        h.client
            .create_or_resume(UploadRecord::from_path(&source).with_id("f"), None)
            .await;
        assert!(source.exists());
        assert!(h.chunks.is_staged("f"));
        let post = h.single();
        assert_eq!(post.1.header("Upload-Length"), Some("30"));
    }

    #[tokio::test]
    async fn restart_resumes_from_server_offset() {
        let h = Harness::new(config());
        let patch = created_plain(&h, "r", 250).await;
        h.respond(&patch, 204, &[("Upload-Offset", "100")]).await;
        let _second = h.single();

        let h = h.restart(config());
        let rec = h.client.upload("r").await.unwrap();
        assert_eq!(rec.status(), UploadStatus::Paused);
        assert!(!rec.has_outstanding_tasks());
        assert_eq!(h.client.status().await, ClientStatus::Ready);

        h.client.resume_all().await;
        let head = h.single();
        assert_eq!(head.1.method, Method::Head);
        assert_eq!(head.1.url.as_str(), "https://tus.example.com/files/r");
        h.respond(&head, 200, &[("Upload-Offset", "200")]).await;

        let patch = h.single();
        assert_eq!(patch.1.header("Upload-Offset"), Some("200"));
        assert_eq!(patch.1.header("Content-Length"), Some("50"));
    }

    #[tokio::test]
    async fn misaligned_server_offset_is_fatal() {
        let mut h = Harness::new(config());
        let patch = created_plain(&h, "x", 150).await;
        h.fail(&patch, TransportError::new(TransportErrorKind::Timeout, "slow"))
            .await;
        assert_eq!(h.status_of("x").await, UploadStatus::Paused);

        h.client.resume_all().await;
        let head = h.single();
        h.respond(&head, 200, &[("Upload-Offset", "30")]).await;
        assert_eq!(h.status_of("x").await, UploadStatus::Error);
        assert!(h.transport.take().is_empty());
        assert!(matches!(
            h.drain().last(),
            Some(UploadEvent::Failure { .. })
        ));
    }

    #[tokio::test]
    async fn transient_failure_pauses_and_services_queue() {
        let mut h = Harness::new(config());
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("one"), None)
            .await;
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("two"), None)
            .await;
        let post = h.single();
        h.fail(&post, TransportError::new(TransportErrorKind::Timeout, "slow"))
            .await;

        assert_eq!(h.status_of("one").await, UploadStatus::Paused);
        let next = h.single();
        assert_eq!(next.1.header("Upload-Metadata"), Some("filename dHdv"));
        assert!(matches!(
            h.drain().as_slice(),
            [UploadEvent::Failure { id: Some(id), .. }] if id == "one"
        ));
    }

    #[tokio::test]
    async fn refused_request_pauses_upload() {
        let h = Harness::new(config());
        h.transport.offline.store(true, Ordering::SeqCst);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("o"), None)
            .await;
        let rec = h.client.upload("o").await.unwrap();
        assert_eq!(rec.status(), UploadStatus::Paused);
        assert!(!rec.has_outstanding_tasks());
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn pause_waits_for_outstanding_request() {
        let h = Harness::new(config());
        let patch = created_plain(&h, "p", 150).await;

        h.client.pause("p").await.unwrap();
        assert_eq!(h.transport.cancelled(), vec![patch.0.clone()]);
        assert_eq!(h.status_of("p").await, UploadStatus::Uploading);
        assert_eq!(h.client.status().await, ClientStatus::Uploading);

        h.fail(&patch, TransportError::cancelled()).await;
        assert_eq!(h.status_of("p").await, UploadStatus::Paused);
        assert_eq!(h.client.status().await, ClientStatus::Ready);

        h.client.resume_all().await;
        assert_eq!(h.single().1.method, Method::Head);
    }

    #[tokio::test]
    async fn retry_mid_flight_restarts_after_settling() {
        let h = Harness::new(config());
        let patch = created_plain(&h, "t", 150).await;

        h.client.retry("t", false).await.unwrap();
        assert!(h.transport.take().is_empty());
        h.fail(&patch, TransportError::cancelled()).await;

        let head = h.single();
        assert_eq!(head.1.method, Method::Head);
        assert_eq!(h.client.status().await, ClientStatus::Uploading);
    }

    #[tokio::test]
    async fn forced_retry_requeues_errored_upload() {
        let h = Harness::new(config());
        let patch = created_plain(&h, "e", 150).await;
        h.respond(&patch, 500, &[]).await;
        assert_eq!(h.status_of("e").await, UploadStatus::Error);

        h.client.retry_all().await;
        let head = h.single();
        assert_eq!(head.1.method, Method::Head);
        assert!(matches!(
            h.status_of("e").await,
            UploadStatus::Enqueued | UploadStatus::Paused
        ));
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let h = Harness::new(config());
        assert!(matches!(
            h.client.retry("nope", false).await,
            Err(TusError::UnknownUpload(_))
        ));
        assert!(h.client.pause("nope").await.is_err());
        assert!(h.client.cancel("nope").await.is_err());
    }

    #[tokio::test]
    async fn unmatched_completion_notifies_failure() {
        let mut h = Harness::new(config());
        let stray = (
            TaskId::from("stray"),
            TusRequest {
                method: Method::Patch,
                url: Url::parse("https://tus.example.com/files/zzz").unwrap(),
                headers: Vec::new(),
                body: crate::transport::RequestBody::Empty,
            },
        );
        h.fail(&stray, TransportError::cancelled()).await;
        assert!(h.drain().is_empty());

        h.respond(&stray, 204, &[("Upload-Offset", "10")]).await;
        assert_eq!(
            h.drain(),
            vec![UploadEvent::Failure {
                id: None,
                message: "completion for unknown request".into()
            }]
        );
    }

    #[tokio::test]
    async fn discover_capabilities_only_when_idle() {
        let h = Harness::new(config());
        h.client.discover_capabilities().await;
        let probe = h.single();
        assert_eq!(probe.1.method, Method::Options);
        h.client.discover_capabilities().await;
        assert!(h.transport.take().is_empty());

        h.respond(&probe, 200, &[]).await;
        assert_eq!(h.client.extensions().await, Some(Vec::new()));
        assert_eq!(h.client.status().await, ClientStatus::Ready);
        assert!(h.kv.get(crate::store::EXTENSIONS_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn extra_headers_are_sent() {
        let h = Harness::new(config());
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer t".to_string());
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("hdr"), Some(headers))
            .await;
        let post = h.single();
        assert_eq!(post.1.header("authorization"), Some("Bearer t"));
        assert_eq!(post.1.header("Tus-Resumable"), Some("1.0.0"));
    }

    /// Brings a three-partial concatenation upload to the point where all
    /// partial PATCHes are out.
    async fn concat_patches_out(h: &Harness, id: &str) -> Vec<(TaskId, TusRequest)> {
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(250)).with_id(id), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 204, &[("Tus-Extension", "creation,concatenation")])
            .await;
        for (i, creation) in h.transport.take().iter().enumerate() {
            let location = format!("/files/{id}{i}");
            h.respond(creation, 201, &[("Location", location.as_str())])
                .await;
        }
        let patches = h.transport.take();
        assert_eq!(patches.len(), 3);
        patches
    }

    #[tokio::test]
    async fn lost_probe_pauses_and_probes_again() {
        let mut cfg = config();
        cfg.strict_protocol = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("s"), None)
            .await;
        let probe = h.single();
        h.fail(
            &probe,
            TransportError::new(TransportErrorKind::ConnectionLost, "reset"),
        )
        .await;

        assert_eq!(h.status_of("s").await, UploadStatus::Paused);
        assert_eq!(h.client.extensions().await, None);
        assert_eq!(h.client.status().await, ClientStatus::Ready);
        assert!(h.transport.take().is_empty());
        match h.drain().as_slice() {
            [UploadEvent::Failure { id, message }] => {
                assert_eq!(id.as_deref(), Some("s"));
                assert!(message.contains("connection lost"), "{message}");
                assert!(!message.contains("creation"), "{message}");
            }
            other => panic!("unexpected events {other:?}"),
        }

        h.client.retry("s", false).await.unwrap();
        let probe = h.single();
        assert_eq!(probe.1.method, Method::Options);
        h.respond(&probe, 204, &[("Tus-Extension", "creation")]).await;
        let post = h.single();
        assert_eq!(post.1.method, Method::Post);
    }

    #[tokio::test]
    async fn rejected_probe_keeps_concatenation_available() {
        let mut cfg = config();
        cfg.concat_mode_if_available = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(250)).with_id("k"), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 500, &[]).await;

        let rec = h.client.upload("k").await.unwrap();
        assert_eq!(rec.status(), UploadStatus::Error);
        assert_eq!(rec.mode, None);
        assert_eq!(h.client.extensions().await, None);
        assert!(h.transport.take().is_empty());
        assert!(matches!(
            h.drain().as_slice(),
            [UploadEvent::Failure { id: Some(id), .. }] if id == "k"
        ));

        h.client.retry("k", false).await.unwrap();
        let probe = h.single();
        h.respond(&probe, 204, &[("Tus-Extension", "creation,concatenation")])
            .await;
        let creations = h.transport.take();
        assert_eq!(creations.len(), 3);
        assert_eq!(creations[0].1.header("Upload-Concat"), Some("partial"));
    }

    #[tokio::test]
    async fn unauthorized_probe_names_the_upload() {
        let mut cfg = config();
        cfg.strict_protocol = true;
        let mut h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(10)).with_id("u"), None)
            .await;
        let probe = h.single();
        h.respond(&probe, 403, &[]).await;

        assert_eq!(h.status_of("u").await, UploadStatus::AuthRequired);
        assert_eq!(
            h.drain(),
            vec![UploadEvent::AuthRequired {
                id: Some("u".into())
            }]
        );
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn idle_probe_failure_is_reported_without_upload() {
        let mut h = Harness::new(config());
        h.client.discover_capabilities().await;
        let probe = h.single();
        h.respond(&probe, 503, &[]).await;

        assert_eq!(h.client.extensions().await, None);
        assert_eq!(h.client.status().await, ClientStatus::Ready);
        assert!(matches!(
            h.drain().as_slice(),
            [UploadEvent::Failure { id: None, message }] if message.contains("503")
        ));
    }

    #[tokio::test]
    async fn failure_message_names_context_once() {
        let mut h = Harness::new(config());
        let patch = created_plain(&h, "msg", 150).await;
        h.respond(&patch, 500, &[]).await;
        assert_eq!(
            h.drain(),
            vec![UploadEvent::Failure {
                id: Some("msg".into()),
                message: "upload failed: server responded with 500 to PATCH".into(),
            }]
        );
    }

    #[tokio::test]
    async fn refused_batch_retires_only_started_tasks() {
        let mut cfg = config();
        cfg.concat_mode_if_available = true;
        let h = Harness::new(cfg);
        h.client
            .create_or_resume(UploadRecord::from_bytes(data(250)).with_id("bt"), None)
            .await;
        let probe = h.single();
        *h.transport.budget.lock().unwrap() = Some(1);
        h.respond(&probe, 204, &[("Tus-Extension", "creation,concatenation")])
            .await;

        let started = h.single();
        assert_eq!(h.transport.cancelled(), vec![started.0.clone()]);
        let rec = h.client.upload("bt").await.unwrap();
        assert_eq!(rec.status(), UploadStatus::Paused);
        assert!(!rec.has_outstanding_tasks());
        {
            let st = h.client.inner.state.lock().await;
            assert_eq!(st.retired, HashSet::from([started.0.clone()]));
        }

        h.fail(&started, TransportError::cancelled()).await;
        assert!(h.client.inner.state.lock().await.retired.is_empty());
        assert_eq!(h.client.status().await, ClientStatus::Ready);
    }

    #[tokio::test]
    async fn failed_partial_fails_upload_and_retry_resumes_from_heads() {
        let mut cfg = config();
        cfg.concat_mode_if_available = true;
        let mut h = Harness::new(cfg);
        let patches = concat_patches_out(&h, "cf").await;

        h.respond(&patches[0], 204, &[("Upload-Offset", "100")]).await;
        h.respond(&patches[1], 500, &[]).await;
        assert_eq!(h.transport.cancelled(), vec![patches[2].0.clone()]);
        assert_eq!(h.status_of("cf").await, UploadStatus::Error);
        assert_eq!(h.client.status().await, ClientStatus::Ready);
        h.fail(&patches[2], TransportError::cancelled()).await;
        assert_eq!(h.status_of("cf").await, UploadStatus::Error);
        assert!(matches!(
            h.drain().last(),
            Some(UploadEvent::Failure { id: Some(id), .. }) if id == "cf"
        ));

        h.client.retry("cf", false).await.unwrap();
        let heads = h.transport.take();
        let urls: Vec<&str> = heads.iter().map(|(_, r)| r.url.as_str()).collect();
        assert!(heads.iter().all(|(_, r)| r.method == Method::Head));
        assert_eq!(
            urls,
            vec![
                "https://tus.example.com/files/cf1",
                "https://tus.example.com/files/cf2",
            ]
        );
        h.respond(&heads[0], 200, &[("Upload-Offset", "40")]).await;
        assert!(h.transport.take().is_empty());
        h.respond(&heads[1], 200, &[("Upload-Offset", "20")]).await;

        let resumed = h.transport.take();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].1.url.as_str(), "https://tus.example.com/files/cf1");
        assert_eq!(resumed[0].1.header("Upload-Offset"), Some("40"));
        assert_eq!(resumed[0].1.header("Content-Length"), Some("60"));
        assert_eq!(resumed[1].1.url.as_str(), "https://tus.example.com/files/cf2");
        assert_eq!(resumed[1].1.header("Upload-Offset"), Some("20"));
        assert_eq!(resumed[1].1.header("Content-Length"), Some("30"));

        h.respond(&resumed[0], 204, &[("Upload-Offset", "100")]).await;
        assert!(h.transport.take().is_empty());
        h.respond(&resumed[1], 204, &[("Upload-Offset", "50")]).await;

        let merges = h.transport.take();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].1.method, Method::Post);
        assert_eq!(
            merges[0].1.header("Upload-Concat"),
            Some(
                "final;https://tus.example.com/files/cf0 https://tus.example.com/files/cf1 https://tus.example.com/files/cf2"
            )
        );
        h.respond(&merges[0], 201, &[("Location", "/files/cf")]).await;
        assert!(matches!(
            h.drain().last(),
            Some(UploadEvent::Success { id, .. }) if id == "cf"
        ));
        assert!(h.transport.take().is_empty());
    }

    #[tokio::test]
    async fn clean_up_upload_refuses_busy_upload() {
        let h = Harness::new(config());
        let patch = created_plain(&h, "cu", 150).await;

        assert!(matches!(
            h.client.clean_up_upload("cu").await,
            Err(TusError::InvalidStatus { .. })
        ));
        assert!(h.client.upload("cu").await.is_some());

        h.client.pause("cu").await.unwrap();
        h.fail(&patch, TransportError::cancelled()).await;
        h.client.clean_up_upload("cu").await.unwrap();
        assert!(h.client.upload("cu").await.is_none());
        assert!(!h.chunks.is_staged("cu"));
        assert!(matches!(
            h.client.clean_up_upload("cu").await,
            Err(TusError::UnknownUpload(_))
        ));
    }

    #[tokio::test]
    async fn clean_up_upload_leaves_others() {
        let h = Harness::new(config());
        h.transport.offline.store(true, Ordering::SeqCst);
        for id in ["keep", "drop"] {
            h.client
                .create_or_resume(UploadRecord::from_bytes(data(10)).with_id(id), None)
                .await;
        }
        h.client.clean_up_upload("drop").await.unwrap();
        let ids: Vec<String> = h.client.uploads().await.into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["keep"]);
        assert!(h.chunks.is_staged("keep"));
    }
}
