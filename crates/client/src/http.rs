//! [`Transport`] implementation on `reqwest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{Completion, RequestBody, TaskId, Transport, TransportEvent, TusRequest};
use crate::TusError;

/// Size of each body piece read from a chunk file; one progress event is
/// emitted per piece.
const PIECE_SIZE: usize = 64 * 1024;

type RunningTasks = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

/// HTTP transport. Each request runs in its own tokio task.
pub struct HttpTransport {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<TransportEvent>,
    running: RunningTasks,
}

impl HttpTransport {
    /// Creates the transport and the receiver its events arrive on.
    pub fn new(
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TusError::Config(format!("http client: {e}")))?;
        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                client,
                events,
                running: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        ))
    }
}

impl Transport for HttpTransport {
    fn start(&self, task: TaskId, request: TusRequest) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.clone(), token.clone());

        let client = self.client.clone();
        let events = self.events.clone();
        let running = self.running.clone();

        debug!(task = %task, method = %request.method, url = %request.url, "starting request");
        runtime.spawn(async move {
            let method = request.method;
            let url = request.url.clone();

            let result = tokio::select! {
                _ = token.cancelled() => Err(TransportError::cancelled()),
                r = execute(&client, &task, request, &events) => r,
            };

            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task);

            let completion = match result {
                Ok((status, headers)) => Completion {
                    task,
                    method,
                    url,
                    status: Some(status),
                    headers,
                    error: None,
                },
                Err(error) => Completion {
                    task,
                    method,
                    url,
                    status: None,
                    headers: Vec::new(),
                    error: Some(error),
                },
            };
            if events.send(TransportEvent::Completed(completion)).is_err() {
                warn!("transport event receiver dropped");
            }
        });
        Ok(())
    }

    fn cancel(&self, task: &TaskId) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(task) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_running(&self, task: &TaskId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task)
    }
}

async fn execute(
    client: &reqwest::Client,
    task: &TaskId,
    request: TusRequest,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(u16, Vec<(String, String)>), TransportError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

    let mut builder = client.request(method, request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    if let RequestBody::File { path, len } = request.body {
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("{}: {e}", path.display()),
            )
        })?;
        let stream = progress_stream(file, task.clone(), len, events.clone());
        builder = builder.body(reqwest::Body::wrap_stream(stream));
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let _ = events.send(TransportEvent::ResponseHeaders {
        task: task.clone(),
        status,
    });

    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    // Protocol responses carry no meaningful body; drain it so the
    // connection can be reused.
    if let Err(e) = response.bytes().await {
        debug!(task = %task, error = %e, "failed to drain response body");
    }

    Ok((status, headers))
}

/// Streams `file` in [`PIECE_SIZE`] pieces, reporting progress per piece.
fn progress_stream(
    file: tokio::fs::File,
    task: TaskId,
    total: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some((file, 0u64)), move |state| {
        let task = task.clone();
        let events = events.clone();
        async move {
            let (mut file, sent) = state?;
            let mut buf = vec![0u8; PIECE_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    let sent = sent + n as u64;
                    let _ = events.send(TransportEvent::Progress {
                        task,
                        bytes_sent: sent,
                        total_bytes: total,
                    });
                    Some((Ok(buf), Some((file, sent))))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        TransportErrorKind::ConnectionLost
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, e.to_string())
}
