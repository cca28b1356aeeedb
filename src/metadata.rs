//! Recording metadata sidecars
//!
//! Each recording folder holds:
//! - `.recording.<id>`: the serialized recording entity, sealed once final
//! - `<id>.info`: ffprobe JSON report written by the worker, consumed on stop
//! - `<name>.mp4` / `<name>.webm`: the artifact itself

use crate::recorder::state::{Recording, RecordingStatus};
use crate::utils::error::{RecordingError, RecordingResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of the sealed entity file
pub const RECORDING_ENTITY_FILE: &str = ".recording.";

/// Technical attributes of a finished capture
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingReport {
    pub has_video: bool,
    pub has_audio: bool,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
}

impl RecordingReport {
    /// Parse ffprobe `-show_format -show_streams` JSON output
    pub fn from_ffprobe_json(content: &str) -> RecordingResult<Self> {
        let json: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| RecordingError::Report(format!("Unreadable report: {}", e)))?;

        let format = json
            .get("format")
            .ok_or_else(|| RecordingError::Report("Report has no format section".to_string()))?;

        // ffprobe prints numbers as strings in the format section
        let number = |value: Option<&serde_json::Value>| -> Option<f64> {
            value.and_then(|v| match v {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            })
        };

        let size_bytes = number(format.get("size")).unwrap_or(0.0) as u64;
        let duration_seconds = number(format.get("duration")).unwrap_or(0.0);

        let streams = json
            .get("streams")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();

        let video = streams
            .iter()
            .find(|s| s.get("codec_type").and_then(|t| t.as_str()) == Some("video"));
        let has_audio = streams
            .iter()
            .any(|s| s.get("codec_type").and_then(|t| t.as_str()) == Some("audio"));

        let width = video
            .and_then(|v| v.get("width"))
            .and_then(|w| w.as_u64())
            .unwrap_or(0) as u32;
        let height = video
            .and_then(|v| v.get("height"))
            .and_then(|h| h.as_u64())
            .unwrap_or(0) as u32;

        Ok(Self {
            has_video: video.is_some(),
            has_audio,
            duration_seconds,
            size_bytes,
            width,
            height,
        })
    }

    /// `WIDTHxHEIGHT`
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Reads worker reports and writes sealed recording sidecars
#[derive(Debug, Clone)]
pub struct RecordingMetadataSealer {
    recording_path: PathBuf,
}

impl RecordingMetadataSealer {
    pub fn new(recording_path: impl Into<PathBuf>) -> Self {
        Self {
            recording_path: recording_path.into(),
        }
    }

    pub fn recording_dir(&self, recording_id: &str) -> PathBuf {
        self.recording_path.join(recording_id)
    }

    pub fn metadata_path(&self, recording: &Recording) -> PathBuf {
        self.recording_dir(&recording.id)
            .join(format!("{}{}", RECORDING_ENTITY_FILE, recording.id))
    }

    pub fn report_path(&self, recording: &Recording) -> PathBuf {
        self.recording_dir(&recording.id)
            .join(format!("{}.info", recording.id))
    }

    /// Artifact path, e.g. `<root>/<id>/<name>.mp4`
    pub fn artifact_path(&self, recording: &Recording, extension: &str) -> PathBuf {
        self.recording_dir(&recording.id)
            .join(format!("{}.{}", recording.name, extension))
    }

    /// Write the entity file of a recording that just started
    pub fn write_initial(&self, recording: &Recording) -> RecordingResult<()> {
        fs::create_dir_all(self.recording_dir(&recording.id))?;
        write_entity(recording, &self.metadata_path(recording))
    }

    /// Read the worker report, deleting it once consumed
    pub fn read_report(&self, recording: &Recording) -> RecordingResult<RecordingReport> {
        let path = self.report_path(recording);
        let content = fs::read_to_string(&path).map_err(|e| {
            RecordingError::Report(format!("Cannot read report {:?}: {}", path, e))
        })?;
        let report = RecordingReport::from_ffprobe_json(&content)?;

        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Could not delete consumed report {:?}: {}", path, e);
        }
        Ok(report)
    }

    /// Record final size and duration, mark `ready` unless already failed, and
    /// write the entity file to `path`.
    pub fn seal_ready(
        &self,
        mut recording: Recording,
        size: u64,
        duration: f64,
        path: &Path,
    ) -> RecordingResult<Recording> {
        recording.size = size;
        recording.duration = duration;
        recording.set_status(RecordingStatus::Ready);

        write_entity(&recording, path)?;

        tracing::debug!(
            "Sealed recording {} as {:?} ({} bytes, {:.3}s)",
            recording.id,
            recording.status(),
            size,
            duration
        );
        Ok(recording)
    }

    /// Read back a sealed entity file
    pub fn read_entity(&self, path: &Path) -> RecordingResult<Recording> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn write_entity(recording: &Recording, path: &Path) -> RecordingResult<()> {
    let content = serde_json::to_string_pretty(recording)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).map_err(|e| {
        RecordingError::Report(format!("Cannot write metadata {:?}: {}", path, e))
    })
}
