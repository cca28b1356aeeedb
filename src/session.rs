//! Session-side collaborators
//!
//! The recording lifecycle only needs a narrow view of the live session and a
//! handful of outward hand-offs (stop notifications, artifact download, upload,
//! compute node release). They are modeled here as plain types and traits.

use crate::compositor::PublisherEndpoint;
use crate::recorder::state::{EndReason, Recording};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A session participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub participant_id: String,

    /// Present while the participant is publishing
    pub publisher: Option<PublisherEndpoint>,
}

impl Participant {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            publisher: None,
        }
    }

    pub fn publishing(participant_id: impl Into<String>, endpoint: PublisherEndpoint) -> Self {
        Self {
            participant_id: participant_id.into(),
            publisher: Some(endpoint),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.publisher.is_some()
    }
}

/// View of a live media session
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,

    /// Compute node hosting the session's media processing
    pub compute_node_id: String,

    pub participants: Vec<Participant>,

    active_recordings: Arc<AtomicUsize>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, compute_node_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            compute_node_id: compute_node_id.into(),
            participants: Vec::new(),
            active_recordings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn streaming_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_streaming())
    }

    /// Recordings currently holding the compute node
    pub fn active_recordings(&self) -> usize {
        self.active_recordings.load(Ordering::SeqCst)
    }

    /// Shared counter, outlives the session handle
    pub fn recording_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_recordings)
    }
}

/// Receives recording lifecycle notifications for a session
pub trait SessionEvents: Send + Sync {
    fn recording_stopped(&self, session: &Session, recording: &Recording, reason: EndReason);
}

/// Takes sealed recordings to remote storage
pub trait RecordingUploader: Send + Sync {
    fn upload(&self, recording: Recording, reason: Option<EndReason>);
}

/// Runs once the artifact is materialized on local disk
pub type DownloadComplete = Box<dyn FnOnce() + Send + 'static>;

/// Materializes an artifact produced on the compute node
pub trait RecordingDownloader: Send + Sync {
    fn download(&self, recording: &Recording, on_complete: DownloadComplete) -> io::Result<()>;
}

/// Releases a compute node reservation once nothing needs it
pub trait ComputeNodeReleaser: Send + Sync {
    fn release(&self, compute_node_id: &str);
}

/// Outward hand-offs of the recording lifecycle
#[derive(Clone)]
pub struct Collaborators {
    pub events: Arc<dyn SessionEvents>,
    pub uploader: Arc<dyn RecordingUploader>,
    pub downloader: Arc<dyn RecordingDownloader>,
    pub nodes: Arc<dyn ComputeNodeReleaser>,
}

/// Downloader for artifacts already written to the shared recording path
pub struct LocalDownloader;

impl RecordingDownloader for LocalDownloader {
    fn download(&self, recording: &Recording, on_complete: DownloadComplete) -> io::Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        tracing::debug!("Recording {} is local, completing download", recording.id);
        handle.spawn_blocking(on_complete);
        Ok(())
    }
}
