//! Recorder configuration
//!
//! Settings consumed by the recording lifecycle. Loading them from the
//! surrounding server is the caller's job; a JSON file loader is provided
//! for standalone use.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which container runtime backend launches workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuntimeBackend {
    /// Docker engine reachable from this process
    Local,
    /// Remote control service driving the compute node
    #[serde(rename_all = "camelCase")]
    Remote { url: String, compute_node_id: String },
}

impl Default for RuntimeBackend {
    fn default() -> Self {
        Self::Local
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Root folder holding one sub-folder per recording
    pub recording_path: PathBuf,

    /// Root folder of custom layouts (`<root>/<layout>/index.html`)
    pub custom_layout_path: PathBuf,

    /// Server secret passed to layout pages
    pub secret: String,

    /// Externally reachable server URL
    pub public_url: String,

    /// Overrides `public_url` for layout pages when set
    pub composed_url: Option<String>,

    /// Embed `user:secret@` credentials in layout URLs
    pub composed_basic_auth: bool,

    /// Username used with `composed_basic_auth`
    pub layout_auth_user: String,

    /// Frontend route prefix of standard layouts
    pub frontend_default_path: String,

    /// Worker debug mode
    pub debug: bool,

    /// Worker image reference (`name:tag`)
    pub worker_image: String,

    /// Wait for a worker to self-terminate after the stop signal
    pub graceful_stop_timeout_secs: u64,

    /// Wait for the worker image to be pulled at initialization
    pub image_pull_timeout_secs: u64,

    /// Idle time after which sessions stop their recordings automatically
    pub autostop_timeout_secs: u64,

    pub runtime: RuntimeBackend,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            recording_path: PathBuf::from("/opt/recordings"),
            custom_layout_path: PathBuf::from("/opt/custom-layout"),
            secret: String::new(),
            public_url: "https://localhost:4443".to_string(),
            composed_url: None,
            composed_basic_auth: true,
            layout_auth_user: "RECORDER".to_string(),
            frontend_default_path: "/dashboard".to_string(),
            debug: false,
            worker_image: "session-recorder/worker:latest".to_string(),
            graceful_stop_timeout_secs: 120,
            image_pull_timeout_secs: 120,
            autostop_timeout_secs: 120,
            runtime: RuntimeBackend::Local,
        }
    }
}

impl RecorderConfig {
    /// Load a configuration from a JSON file, filling absent keys with defaults
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recorder config {:?}", path))?;
        let config: RecorderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse recorder config {:?}", path))?;
        Ok(config)
    }

    /// Folder holding every file of one recording
    pub fn recording_dir(&self, recording_id: &str) -> PathBuf {
        self.recording_path.join(recording_id)
    }

    /// Composed URL, when configured and not empty
    pub fn composed_url(&self) -> Option<&str> {
        self.composed_url.as_deref().filter(|url| !url.is_empty())
    }
}
