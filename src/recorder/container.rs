//! Worker-backed recordings
//!
//! Recordings with video are captured by a dedicated worker container that
//! loads the layout page and encodes it to `<id>/<name>.mp4`. The worker is
//! considered alive once that file is non-empty.

use super::recovery::RaceRecoveryWorker;
use super::registry::{RecordingRegistry, StopClaim, WorkerHandle};
use super::state::{EndReason, Recording};
use crate::config::RecorderConfig;
use crate::layout::LayoutUrlBuilder;
use crate::metadata::RecordingMetadataSealer;
use crate::runtime::{Bind, ContainerRuntime, RunSpec};
use crate::session::{Collaborators, Session};
use crate::utils::error::{RecordingError, RecordingResult};
use crate::utils::fs::{file_has_bytes, normalize_permissions};
use crate::utils::poll::{bounded, poll_until, PollError, PollPolicy, Shutdown};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Asks the worker to finish encoding and exit
pub const GRACEFUL_STOP_COMMAND: &str = "echo 'q' > stop";

/// Mount point of the recording root inside the worker
pub const WORKER_RECORDING_PATH: &str = "/recordings";

const WORKER_FRAMERATE: u32 = 30;
const WORKER_VIDEO_FORMAT: &str = "mp4";

/// Starts and stops recordings captured by worker containers
pub struct ContainerBackedRecorder {
    config: Arc<RecorderConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<RecordingRegistry>,
    sealer: RecordingMetadataSealer,
    layouts: LayoutUrlBuilder,
    collaborators: Collaborators,
    shutdown: Shutdown,
    readiness: PollPolicy,
}

impl ContainerBackedRecorder {
    pub fn new(
        config: Arc<RecorderConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<RecordingRegistry>,
        collaborators: Collaborators,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            sealer: RecordingMetadataSealer::new(&config.recording_path),
            layouts: LayoutUrlBuilder::new(Arc::clone(&config)),
            config,
            runtime,
            registry,
            collaborators,
            shutdown,
            readiness: PollPolicy::VIDEO_READINESS,
        }
    }

    /// Launch the worker and wait until it is encoding
    pub async fn start(&self, recording: Recording) -> RecordingResult<Recording> {
        if let Some(existing) = self.registry.worker_for(&recording.session_id) {
            self.registry.clean_recording(&recording.id);
            return Err(RecordingError::Start(format!(
                "Session {} is already being recorded by worker {} (recording {})",
                recording.session_id, existing.worker_id, existing.recording_id
            )));
        }

        let layout_url = self.layouts.build(&recording)?;
        let spec = self.run_spec(&recording, &layout_url)?;

        tracing::info!(
            "Starting worker {} for recording {} of session {}",
            spec.name,
            recording.id,
            recording.session_id
        );

        let name = spec.name.clone();
        let worker_id = match self.runtime.run(spec).await {
            Ok(worker_id) => worker_id,
            Err(e) => {
                self.registry.clean_recording(&recording.id);
                return Err(RecordingError::Start(format!(
                    "Couldn't initialize recording container. Error: {}",
                    e
                )));
            }
        };

        let handle = WorkerHandle {
            worker_id: worker_id.clone(),
            name,
            session_id: recording.session_id.clone(),
            recording_id: recording.id.clone(),
        };
        if !self.registry.register_worker(handle) {
            tracing::error!(
                "Session {} got another worker while {} was launching, removing it",
                recording.session_id,
                worker_id
            );
            if let Err(e) = self.runtime.remove(&worker_id, true).await {
                tracing::error!("Could not remove worker {}: {}", worker_id, e);
            }
            self.registry.clean_recording(&recording.id);
            return Err(RecordingError::Start(format!(
                "Session {} already has a worker recording it",
                recording.session_id
            )));
        }

        self.wait_for_video(&recording, &worker_id).await?;
        Ok(recording)
    }

    fn run_spec(&self, recording: &Recording, layout_url: &str) -> RecordingResult<RunSpec> {
        let properties = &recording.properties;
        let env = vec![
            format!("DEBUG_MODE={}", self.config.debug),
            format!("URL={}", layout_url),
            format!("ONLY_VIDEO={}", !properties.has_audio),
            format!("RESOLUTION={}", properties.resolution),
            format!("FRAMERATE={}", WORKER_FRAMERATE),
            format!("VIDEO_ID={}", recording.id),
            format!("VIDEO_NAME={}", recording.name),
            format!("VIDEO_FORMAT={}", WORKER_VIDEO_FORMAT),
            format!("RECORDING_JSON={}", recording.to_json()?),
        ];

        tracing::debug!("Worker layout URL for recording {}: {}", recording.id, layout_url);

        Ok(RunSpec {
            image: self.config.worker_image.clone(),
            name: format!("recording_{}", recording.id),
            volumes: vec![WORKER_RECORDING_PATH.to_string()],
            binds: vec![Bind::new(
                self.config.recording_path.to_string_lossy(),
                WORKER_RECORDING_PATH,
            )],
            network_mode: Some("host".to_string()),
            env,
            shm_size: Some(properties.shm_size),
            labels: HashMap::from([(
                "session-recorder.recording-id".to_string(),
                recording.id.clone(),
            )]),
            ..Default::default()
        })
    }

    async fn wait_for_video(&self, recording: &Recording, worker_id: &str) -> RecordingResult<()> {
        let video = self.sealer.artifact_path(recording, WORKER_VIDEO_FORMAT);
        let registry = &self.registry;
        let session_id = recording.session_id.as_str();

        let result = poll_until(self.readiness, &self.shutdown, || {
            let owned = registry
                .worker_for(session_id)
                .map(|handle| handle.worker_id == worker_id)
                .unwrap_or(false);
            if !owned {
                return Some(false);
            }
            file_has_bytes(&video).then_some(true)
        })
        .await;

        match result {
            Ok((true, attempts)) => {
                tracing::info!(
                    "Worker {} is writing {:?} after {} attempts",
                    worker_id,
                    video,
                    attempts
                );
                Ok(())
            }
            Ok((false, _)) => {
                tracing::warn!(
                    "Worker {} of recording {} was taken by a stop request before it was ready",
                    worker_id,
                    recording.id
                );
                self.registry.clean_recording(&recording.id);
                Err(RecordingError::Start(format!(
                    "Recording {} was stopped before its worker was ready",
                    recording.id
                )))
            }
            Err(e) => {
                if let PollError::Cancelled { .. } = e {
                    tracing::warn!("Readiness wait of recording {} cancelled", recording.id);
                }
                tracing::error!(
                    "Worker {} did not write {:?} after {} attempts",
                    worker_id,
                    video,
                    e.attempts()
                );

                self.registry.forget_worker(session_id, worker_id);
                self.registry.clean_recording(&recording.id);
                if let Err(e) = self.runtime.remove(worker_id, true).await {
                    tracing::error!("Could not remove worker {}: {}", worker_id, e);
                }

                Err(RecordingError::Start(
                    "Recorder container failed generating video file (is empty)".to_string(),
                ))
            }
        }
    }

    /// Stop the worker and seal the artifact. Failures end up in the status.
    pub async fn stop(
        &self,
        session: Option<&Session>,
        mut recording: Recording,
        reason: Option<EndReason>,
    ) -> Recording {
        let handle = match self
            .registry
            .take_worker_or_claim_recovery(&recording.session_id, &recording.id)
        {
            StopClaim::Worker(handle) => handle,
            StopClaim::Recovery => {
                tracing::warn!(
                    "Recording {} stopped before its worker was registered. Waiting for it in the background",
                    recording.id
                );
                RaceRecoveryWorker::new(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.runtime),
                    &recording.session_id,
                    &recording.id,
                    self.sealer.recording_dir(&recording.id),
                )
                .with_shutdown(self.shutdown.clone())
                .spawn();
                return recording;
            }
            StopClaim::RecoveryInFlight => {
                tracing::debug!("Recovery of recording {} already running", recording.id);
                return recording;
            }
            StopClaim::NotRunning => {
                tracing::warn!(
                    "Recording {} has no worker and is not starting, nothing to stop",
                    recording.id
                );
                return self.stored_or(recording);
            }
        };

        tracing::info!(
            "Stopping worker {} of recording {}",
            handle.worker_id,
            recording.id
        );

        if let Err(e) = self
            .runtime
            .exec_async(&handle.worker_id, GRACEFUL_STOP_COMMAND)
            .await
        {
            tracing::error!(
                "Could not send stop signal to worker {}: {}",
                handle.worker_id,
                e
            );
        }

        let seconds = self.config.graceful_stop_timeout_secs;
        let waited = bounded(
            Duration::from_secs(seconds),
            &self.shutdown,
            self.runtime.wait_for_stopped(&handle.worker_id, seconds),
        )
        .await;

        let stopped = match waited {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                tracing::error!("Waiting for worker {} failed: {}", handle.worker_id, e);
                false
            }
            None => false,
        };

        if !stopped {
            let error = RecordingError::Completion(format!(
                "Worker {} of recording {} did not stop within {} seconds",
                handle.worker_id, recording.id, seconds
            ));
            tracing::error!("{}. Removing it forcibly", error);
            recording.mark_failed();
        }

        if let Err(e) = self.runtime.remove(&handle.worker_id, !stopped).await {
            tracing::error!("Could not remove worker {}: {}", handle.worker_id, e);
        }

        if !recording.is_failed() {
            self.apply_report(&mut recording);
        }

        let metadata = self.sealer.metadata_path(&recording);
        let (size, duration) = (recording.size, recording.duration);
        let recording = match self.sealer.seal_ready(recording.clone(), size, duration, &metadata) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!("Could not seal recording {}: {}", recording.id, e);
                recording.mark_failed();
                recording
            }
        };

        if let Err(e) = normalize_permissions(&self.sealer.recording_dir(&recording.id)) {
            tracing::warn!("Could not normalize permissions of recording {}: {}", recording.id, e);
        }

        self.registry.clean_recording(&recording.id);

        if let (Some(session), Some(reason)) = (session, reason) {
            self.collaborators
                .events
                .recording_stopped(session, &recording, reason);
        }

        tracing::info!(
            "Recording {} of session {} finished as {:?}",
            recording.id,
            recording.session_id,
            recording.status()
        );
        self.collaborators.uploader.upload(recording.clone(), reason);
        recording
    }

    /// Final entity already sealed on disk, or `recording` as given
    fn stored_or(&self, recording: Recording) -> Recording {
        match self.sealer.read_entity(&self.sealer.metadata_path(&recording)) {
            Ok(stored) if stored.status().is_final() => stored,
            _ => recording,
        }
    }

    /// Copy the worker's report into the recording, failing it when unusable
    fn apply_report(&self, recording: &mut Recording) {
        match self.sealer.read_report(recording) {
            Ok(report) if !report.has_video => {
                tracing::error!(
                    "Report of recording {} has no video track, marking it failed",
                    recording.id
                );
                recording.mark_failed();
            }
            Ok(report) => {
                recording.size = report.size_bytes;
                recording.duration = report.duration_seconds;
                recording.resolution = Some(report.resolution());
                recording.has_audio = report.has_audio;
                recording.has_video = report.has_video;
            }
            Err(e) => {
                tracing::error!("{}", e);
                recording.mark_failed();
            }
        }
    }
}
