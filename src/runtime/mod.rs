//! Container runtime contract
//!
//! Workers are launched and controlled through [`ContainerRuntime`]. Two
//! backends implement it:
//! - [`LocalDockerRuntime`] drives a Docker engine reachable from this process
//! - [`RemoteContainerRuntime`] forwards each call to a control service on the
//!   compute node

pub mod docker;
pub mod remote;

pub use docker::LocalDockerRuntime;
pub use remote::RemoteContainerRuntime;

use crate::config::{RecorderConfig, RuntimeBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a container runtime backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Worker launch failed: {0}")]
    Launch(String),

    #[error("Worker {worker_id} did not stop within {seconds} seconds")]
    Timeout { worker_id: String, seconds: u64 },

    #[error("Runtime I/O error: {0}")]
    Io(String),

    #[error("Runtime call {operation} rejected: {message}")]
    Rejected { operation: String, message: String },

    #[error("Worker not found: {0}")]
    NotFound(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Host folder bound into the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    pub host_path: String,
    pub container_path: String,
}

impl Bind {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
        }
    }

    /// Docker `host:container` notation
    pub fn to_docker(&self) -> String {
        format!("{}:{}", self.host_path, self.container_path)
    }
}

/// Everything needed to launch one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub user: Option<String>,
    pub volumes: Vec<String>,
    pub binds: Vec<Bind>,
    pub network_mode: Option<String>,
    pub env: Vec<String>,
    pub command: Option<Vec<String>>,
    pub shm_size: Option<u64>,
    pub privileged: bool,
    pub labels: HashMap<String, String>,
}

/// Launch and control of isolated worker processes
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a worker and return its id
    async fn run(&self, spec: RunSpec) -> RuntimeResult<String>;

    /// Fire a shell command inside a running worker without waiting for it
    async fn exec_async(&self, worker_id: &str, command: &str) -> RuntimeResult<()>;

    /// Wait until the worker has exited on its own
    async fn wait_for_stopped(&self, worker_id: &str, seconds_of_wait: u64) -> RuntimeResult<()>;

    /// Remove the worker, killing it first when `force` is set
    async fn remove(&self, worker_id: &str, force: bool) -> RuntimeResult<()>;

    async fn image_exists_locally(&self, image: &str) -> RuntimeResult<bool>;

    /// Pull `image` unless already present, bounded by `seconds_of_wait`
    async fn ensure_image_available(&self, image: &str, seconds_of_wait: u64) -> RuntimeResult<()>;

    /// Remove workers of `image` left behind by a previous run
    async fn clean_stranded(&self, image: &str) -> RuntimeResult<()>;
}

/// Build the backend selected by the configuration
pub fn from_config(config: &RecorderConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
    match &config.runtime {
        RuntimeBackend::Local => Ok(Arc::new(LocalDockerRuntime::connect()?)),
        RuntimeBackend::Remote {
            url,
            compute_node_id,
        } => Ok(Arc::new(RemoteContainerRuntime::new(url, compute_node_id)?)),
    }
}
