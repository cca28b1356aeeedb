//! Recording orchestrator
//!
//! Entry point of the recording lifecycle. Assigns recording ids, dispatches
//! each request to the worker-backed or compositor-backed recorder and keeps
//! the registry consistent whatever the outcome.

use super::composite::CompositeRecorder;
use super::container::ContainerBackedRecorder;
use super::registry::RecordingRegistry;
use super::state::{EndReason, Recording, RecordingProperties, RecordingStatus};
use crate::compositor::CompositionEngineFactory;
use crate::config::RecorderConfig;
use crate::runtime::ContainerRuntime;
use crate::session::{Collaborators, Participant, Session};
use crate::utils::error::{RecordingError, RecordingResult};
use crate::utils::poll::ShutdownHandle;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted during the recording lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    /// Recording started
    Started { recording_id: String },
    /// Recording reached a final status
    Stopped {
        recording_id: String,
        status: RecordingStatus,
    },
    /// Start failed
    Error { recording_id: String, message: String },
}

/// Starts and stops recordings for live sessions
pub struct RecordingOrchestrator {
    config: Arc<RecorderConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<RecordingRegistry>,
    container: ContainerBackedRecorder,
    composite: CompositeRecorder,
    shutdown: ShutdownHandle,
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl RecordingOrchestrator {
    pub fn new(
        config: RecorderConfig,
        runtime: Arc<dyn ContainerRuntime>,
        engines: Arc<dyn CompositionEngineFactory>,
        collaborators: Collaborators,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(RecordingRegistry::new());
        let shutdown = ShutdownHandle::new();
        let (event_tx, _) = broadcast::channel(100);

        let container = ContainerBackedRecorder::new(
            Arc::clone(&config),
            Arc::clone(&runtime),
            Arc::clone(&registry),
            collaborators.clone(),
            shutdown.subscribe(),
        );
        let composite = CompositeRecorder::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            engines,
            collaborators,
            shutdown.subscribe(),
        );

        Self {
            config,
            runtime,
            registry,
            container,
            composite,
            shutdown,
            event_tx,
        }
    }

    /// Build the runtime backend selected by the configuration
    pub fn from_config(
        config: RecorderConfig,
        engines: Arc<dyn CompositionEngineFactory>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let runtime = crate::runtime::from_config(&config)?;
        Ok(Self::new(config, runtime, engines, collaborators))
    }

    pub fn registry(&self) -> &Arc<RecordingRegistry> {
        &self.registry
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Make the worker image available and remove workers left by a previous run
    pub async fn initialize(&self) -> RecordingResult<()> {
        let image = &self.config.worker_image;
        tracing::info!(
            "Initializing recorder (image {}, autostop after {}s)",
            image,
            self.config.autostop_timeout_secs
        );

        let present = match self.runtime.image_exists_locally(image).await {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!("Could not check image {}: {}", image, e);
                false
            }
        };

        if !present {
            tracing::info!("Worker image {} not found locally, pulling it", image);
            self.runtime
                .ensure_image_available(image, self.config.image_pull_timeout_secs)
                .await
                .map_err(|e| {
                    RecordingError::Start(format!("Worker image {} is not available: {}", image, e))
                })?;
        }

        if let Err(e) = self.runtime.clean_stranded(image).await {
            tracing::warn!("Could not remove stranded workers: {}", e);
        }
        Ok(())
    }

    /// Start a recording of `session`. Blocks until the recording is capturing.
    pub async fn start(
        &self,
        session: &Session,
        properties: RecordingProperties,
    ) -> RecordingResult<Recording> {
        let recording_id = self
            .registry
            .reserve_recording_id(&session.session_id, |id| {
                self.config.recording_dir(id).exists()
            });
        let recording = Recording::new(&session.session_id, &recording_id, properties);

        if !self.registry.mark_starting(&recording) {
            return Err(RecordingError::Start(format!(
                "Recording {} is already starting",
                recording_id
            )));
        }

        tracing::info!(
            "Starting {} recording {} of session {}",
            if recording.uses_worker() { "video" } else { "audio-only" },
            recording.id,
            session.session_id
        );

        let result = if recording.uses_worker() {
            self.container.start(recording).await
        } else {
            self.composite.start(session, recording).await
        };

        match result {
            Ok(mut recording) => {
                recording.set_status(RecordingStatus::Started);
                self.registry.mark_started(&recording);
                let _ = self.event_tx.send(RecordingEvent::Started {
                    recording_id: recording.id.clone(),
                });
                tracing::info!("Recording {} started", recording.id);
                Ok(recording)
            }
            Err(e) => {
                // Recorders clean after themselves; this covers the paths that fail early
                self.registry.clean_recording(&recording_id);
                tracing::error!("Recording {} failed to start: {}", recording_id, e);
                let _ = self.event_tx.send(RecordingEvent::Error {
                    recording_id,
                    message: e.to_string(),
                });
                Err(match e {
                    RecordingError::Start(_) => e,
                    other => RecordingError::Start(other.to_string()),
                })
            }
        }
    }

    /// Stop a recording. Never fails: the outcome is in the returned status.
    pub async fn stop(
        &self,
        session: Option<&Session>,
        mut recording: Recording,
        reason: Option<EndReason>,
        disconnect_timestamp: Option<i64>,
    ) -> Recording {
        recording.set_status(RecordingStatus::Stopping);
        tracing::info!(
            "Stopping recording {} of session {} ({:?})",
            recording.id,
            recording.session_id,
            reason
        );

        let recording = if recording.uses_worker() {
            self.container.stop(session, recording, reason).await
        } else {
            self.composite
                .stop(session, recording, reason, disconnect_timestamp)
                .await
        };

        if recording.status().is_final() {
            let _ = self.event_tx.send(RecordingEvent::Stopped {
                recording_id: recording.id.clone(),
                status: recording.status(),
            });
        }
        recording
    }

    /// Add a publisher to an audio-only recording in progress
    pub async fn join_publisher_endpoint_to_composite(
        &self,
        session: &Session,
        recording_id: &str,
        participant: &Participant,
    ) -> RecordingResult<()> {
        tracing::debug!(
            "Joining publisher of {} to composite recording {}",
            participant.participant_id,
            recording_id
        );
        self.composite.join_publisher(session, participant).await
    }

    /// Remove a publisher from an audio-only recording in progress
    pub async fn remove_publisher_endpoint_from_composite(&self, session_id: &str, stream_id: &str) {
        self.composite.remove_publisher(session_id, stream_id).await;
    }

    /// Preempt every bounded wait in flight
    pub fn shutdown(&self) {
        tracing::info!("Recorder shutting down");
        self.shutdown.trigger();
    }
}
