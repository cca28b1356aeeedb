//! Stop-before-start recovery
//!
//! When a stop request finds no worker for a video recording, the worker may
//! still be launching. The recovery task waits for the handle to show up, then
//! tears everything down so the late worker does not outlive its session.

use super::registry::RecordingRegistry;
use crate::runtime::ContainerRuntime;
use crate::utils::fs::delete_recording_files;
use crate::utils::poll::{poll_until, PollError, PollPolicy, Shutdown};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How a recovery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The late worker was found and removed
    Recovered { worker_id: String, attempts: u32 },
    /// No worker appeared before the ceiling
    TimedOut,
    /// Shutdown interrupted the wait
    Cancelled,
}

/// Background task cleaning up after a worker that launched too late
pub struct RaceRecoveryWorker {
    registry: Arc<RecordingRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    session_id: String,
    recording_id: String,
    recording_dir: PathBuf,
    policy: PollPolicy,
    shutdown: Shutdown,
}

impl RaceRecoveryWorker {
    pub fn new(
        registry: Arc<RecordingRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        session_id: &str,
        recording_id: &str,
        recording_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            runtime,
            session_id: session_id.to_string(),
            recording_id: recording_id.to_string(),
            recording_dir,
            policy: PollPolicy::RACE_RECOVERY,
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run detached. The caller is not expected to await the handle.
    pub fn spawn(self) -> JoinHandle<RecoveryOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> RecoveryOutcome {
        tracing::info!(
            "Waiting up to {:?} for the worker of recording {} to stop it",
            self.policy.ceiling(),
            self.recording_id
        );

        let registry = Arc::clone(&self.registry);
        let (session_id, recording_id) = (self.session_id.clone(), self.recording_id.clone());
        let result = poll_until(self.policy, &self.shutdown, || {
            registry.take_worker_of(&session_id, &recording_id)
        })
        .await;

        let outcome = match result {
            Ok((handle, attempts)) => {
                tracing::info!(
                    "Worker {} of recording {} showed up after {} attempts, removing it",
                    handle.worker_id,
                    self.recording_id,
                    attempts
                );

                if let Err(e) = self.runtime.remove(&handle.worker_id, true).await {
                    tracing::error!(
                        "Could not remove late worker {}: {}",
                        handle.worker_id,
                        e
                    );
                }

                match delete_recording_files(&self.recording_dir) {
                    Ok(true) => tracing::debug!("Deleted files of recording {}", self.recording_id),
                    Ok(false) => {}
                    Err(e) => tracing::error!(
                        "Could not delete files of recording {} at {:?}: {}",
                        self.recording_id,
                        self.recording_dir,
                        e
                    ),
                }

                self.registry.clean_recording(&self.recording_id);
                RecoveryOutcome::Recovered {
                    worker_id: handle.worker_id,
                    attempts,
                }
            }
            Err(PollError::Exhausted { attempts }) => {
                tracing::error!(
                    "Worker of recording {} never showed up after {} attempts. Recording was not stopped",
                    self.recording_id,
                    attempts
                );
                RecoveryOutcome::TimedOut
            }
            Err(PollError::Cancelled { attempts }) => {
                tracing::warn!(
                    "Recovery of recording {} interrupted by shutdown after {} attempts",
                    self.recording_id,
                    attempts
                );
                RecoveryOutcome::Cancelled
            }
        };

        self.registry.finish_recovery(&self.recording_id);
        outcome
    }
}
