//! In-process composition engine contract
//!
//! Audio-only recordings are mixed by the media engine itself, without a
//! worker process. This module defines the surface the recorder needs from it.

use crate::session::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors raised while wiring publishers into the mixer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositeError {
    /// The first publisher triggered the recorder endpoint, which failed to start
    #[error("Recorder endpoint failed to start: {0}")]
    RecorderStart(String),

    /// A single publisher could not be connected
    #[error("Publisher {stream_id} could not be connected: {reason}")]
    Connect { stream_id: String, reason: String },
}

/// A participant's published stream as seen by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherEndpoint {
    pub stream_id: String,

    /// Engine-side reference of the endpoint
    pub endpoint_ref: String,
}

impl PublisherEndpoint {
    pub fn new(stream_id: impl Into<String>, endpoint_ref: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            endpoint_ref: endpoint_ref.into(),
        }
    }
}

/// Mixer feeding one recorder endpoint
#[async_trait]
pub trait MediaCompositionEngine: Send + Sync {
    /// Connect a publisher. The first connection also starts the recorder endpoint.
    async fn connect_publisher(&self, endpoint: &PublisherEndpoint) -> Result<(), CompositeError>;

    async fn disconnect_publisher(&self, stream_id: &str);

    async fn disconnect_all(&self);

    /// Stop the recorder endpoint. `done` fires once the artifact is finalized.
    async fn stop(&self, done: oneshot::Sender<()>, disconnect_timestamp: Option<i64>);

    /// Recorded duration in milliseconds
    fn duration_millis(&self) -> u64;
}

/// Creates a mixer for a session writing to `output_uri`
pub trait CompositionEngineFactory: Send + Sync {
    fn create(&self, session: &Session, output_uri: &str) -> Arc<dyn MediaCompositionEngine>;
}
