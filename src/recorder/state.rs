//! Recording state management
//!
//! Defines the recording entity, its requested properties and the status
//! state machine.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a recording.
///
/// Transitions only move forward: `starting → started → stopping → {ready | failed}`.
/// `failed` may also be reached directly from `starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Starting,
    Started,
    Stopping,
    Ready,
    Failed,
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl RecordingStatus {
    fn rank(self) -> u8 {
        match self {
            RecordingStatus::Starting => 0,
            RecordingStatus::Started => 1,
            RecordingStatus::Stopping => 2,
            RecordingStatus::Ready | RecordingStatus::Failed => 3,
        }
    }

    /// `ready` and `failed` are terminal
    pub fn is_final(self) -> bool {
        matches!(self, RecordingStatus::Ready | RecordingStatus::Failed)
    }

    pub fn can_transition_to(self, next: RecordingStatus) -> bool {
        !self.is_final() && next.rank() > self.rank()
    }
}

/// Visual arrangement rendered by a worker before capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingLayout {
    BestFit,
    PictureInPicture,
    VerticalPresentation,
    HorizontalPresentation,
    Custom,
}

impl Default for RecordingLayout {
    fn default() -> Self {
        Self::BestFit
    }
}

impl RecordingLayout {
    /// Route name of a standard layout, e.g. `best-fit`
    pub fn kebab_name(&self) -> &'static str {
        match self {
            RecordingLayout::BestFit => "best-fit",
            RecordingLayout::PictureInPicture => "picture-in-picture",
            RecordingLayout::VerticalPresentation => "vertical-presentation",
            RecordingLayout::HorizontalPresentation => "horizontal-presentation",
            RecordingLayout::Custom => "custom",
        }
    }
}

/// Properties requested when a recording is started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingProperties {
    /// Final name of the artifact; defaults to the recording id
    pub name: Option<String>,

    pub has_audio: bool,

    pub has_video: bool,

    pub recording_layout: RecordingLayout,

    /// URL or path under the custom layout root. Only read for `CUSTOM`.
    pub custom_layout: String,

    /// `WIDTHxHEIGHT`
    pub resolution: String,

    /// Shared memory for the worker, in bytes
    pub shm_size: u64,
}

impl Default for RecordingProperties {
    fn default() -> Self {
        Self {
            name: None,
            has_audio: true,
            has_video: true,
            recording_layout: RecordingLayout::BestFit,
            custom_layout: String::new(),
            resolution: "1280x720".to_string(),
            shm_size: 536_870_912,
        }
    }
}

/// Why a recording was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    RecordingStoppedByServer,
    LastParticipantLeft,
    SessionClosedByServer,
    AutomaticStop,
    MediaServerDisconnect,
    NodeCrashed,
    ServerStopped,
}

/// One capture attempt of a session into a durable artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,

    pub session_id: String,

    pub name: String,

    /// Unix timestamp (ms) when the start request was accepted
    pub created_at: i64,

    pub properties: RecordingProperties,

    status: RecordingStatus,

    /// Artifact size in bytes
    pub size: u64,

    /// Artifact duration in seconds
    pub duration: f64,

    /// Observed `WIDTHxHEIGHT`
    pub resolution: Option<String>,

    /// Observed audio track
    pub has_audio: bool,

    /// Observed video track
    pub has_video: bool,
}

impl Recording {
    /// Create a recording in `starting` status
    pub fn new(session_id: &str, recording_id: &str, properties: RecordingProperties) -> Self {
        let name = properties
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| recording_id.to_string());
        let resolution = properties.has_video.then(|| properties.resolution.clone());

        Self {
            id: recording_id.to_string(),
            session_id: session_id.to_string(),
            name,
            created_at: Utc::now().timestamp_millis(),
            has_audio: properties.has_audio,
            has_video: properties.has_video,
            properties,
            status: RecordingStatus::Starting,
            size: 0,
            duration: 0.0,
            resolution,
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    /// Advance the status. Backward or post-final transitions are ignored.
    pub fn set_status(&mut self, next: RecordingStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                "Recording {} ignores transition {:?} -> {:?}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_failed(&mut self) {
        self.set_status(RecordingStatus::Failed);
    }

    pub fn is_failed(&self) -> bool {
        self.status == RecordingStatus::Failed
    }

    /// Dispatch key: video recordings use a worker, audio-only the compositor
    pub fn uses_worker(&self) -> bool {
        self.properties.has_video
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
