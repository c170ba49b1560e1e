//! Resumable upload client for the TUS 1.0.0 protocol.
//!
//! Uploads are staged into local storage, split into fixed-size chunks and
//! sent either sequentially to one server resource or in parallel to
//! partial resources that a final request concatenates. Upload state is
//! persisted after every step so an interrupted process can resume where
//! the server left off.
//!
//! ```no_run
//! # async fn demo() -> Result<(), tus_client::TusError> {
//! use std::sync::Arc;
//! use tus_client::{ChannelObserver, TusClient, TusConfig, UploadRecord};
//!
//! let config = TusConfig::new("https://uploads.example.com/files/".parse().unwrap());
//! let (observer, mut events) = ChannelObserver::new();
//! let (client, transport_events) = TusClient::with_http(config, Arc::new(observer))?;
//! client.spawn_event_loop(transport_events);
//!
//! client
//!     .create_or_resume(UploadRecord::from_path("/tmp/video.mp4"), None)
//!     .await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod machine;
pub mod observer;
pub mod record;
pub mod store;
pub mod transport;

// Re-export primary types for convenience.
pub use client::TusClient;
pub use config::TusConfig;
pub use error::{TransportError, TransportErrorKind, TusError};
pub use http::HttpTransport;
pub use observer::{ChannelObserver, TusObserver, UploadEvent};
pub use record::{PartialUploadState, TransferMode, UploadRecord};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{Completion, RequestBody, TaskId, Transport, TransportEvent, TusRequest};
pub use tus_protocol::{ClientStatus, Extension, UploadStatus};
pub use tus_transfer::{ChunkSize, ChunkUnit};
