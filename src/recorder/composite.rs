//! Audio-only recordings
//!
//! The media engine mixes every publisher of the session into a single
//! `<id>/<name>.webm` artifact. No worker is involved: the recorder only wires
//! publishers in and out and seals the artifact once the engine has flushed it.

use super::registry::RecordingRegistry;
use super::state::{EndReason, Recording, RecordingStatus};
use crate::compositor::{
    CompositeError, CompositionEngineFactory, MediaCompositionEngine, PublisherEndpoint,
};
use crate::config::RecorderConfig;
use crate::metadata::RecordingMetadataSealer;
use crate::session::{Collaborators, DownloadComplete, Participant, Session};
use crate::utils::error::{RecordingError, RecordingResult};
use crate::utils::fs::{file_size, normalize_permissions};
use crate::utils::poll::{bounded, Shutdown};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Bound on the engine's completion signal after a stop request
pub const COMPOSITE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const COMPOSITE_FORMAT: &str = "webm";

#[derive(Default)]
struct PublisherSet {
    streams: HashSet<String>,
    /// Set once the recording stops; no publisher may join afterwards
    closed: bool,
}

/// Compositor state of one audio-only recording
pub struct CompositeHandle {
    pub recording_id: String,
    pub output_path: PathBuf,
    pub compute_node_id: String,
    engine: Arc<dyn MediaCompositionEngine>,
    publishers: Mutex<PublisherSet>,
    active_recordings: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl CompositeHandle {
    fn new(
        recording_id: &str,
        output_path: PathBuf,
        session: &Session,
        engine: Arc<dyn MediaCompositionEngine>,
    ) -> Self {
        Self {
            recording_id: recording_id.to_string(),
            output_path,
            compute_node_id: session.compute_node_id.clone(),
            engine,
            publishers: Mutex::new(PublisherSet::default()),
            active_recordings: session.recording_counter(),
            released: AtomicBool::new(false),
        }
    }

    fn closed_error(&self, stream_id: &str) -> CompositeError {
        CompositeError::Connect {
            stream_id: stream_id.to_string(),
            reason: format!("recording {} is stopping", self.recording_id),
        }
    }

    /// A stop may close the handle while the engine call is in flight. The
    /// publisher is then disconnected again before returning.
    async fn connect(&self, endpoint: &PublisherEndpoint) -> Result<(), CompositeError> {
        if self.publishers.lock().closed {
            return Err(self.closed_error(&endpoint.stream_id));
        }
        self.engine.connect_publisher(endpoint).await?;

        let accepted = {
            let mut publishers = self.publishers.lock();
            if !publishers.closed {
                publishers.streams.insert(endpoint.stream_id.clone());
            }
            !publishers.closed
        };
        if !accepted {
            self.engine.disconnect_publisher(&endpoint.stream_id).await;
            return Err(self.closed_error(&endpoint.stream_id));
        }
        Ok(())
    }

    async fn disconnect(&self, stream_id: &str) -> bool {
        let was_connected = self.publishers.lock().streams.remove(stream_id);
        if was_connected {
            self.engine.disconnect_publisher(stream_id).await;
        }
        was_connected
    }

    /// Refuse further publishers
    fn close(&self) {
        self.publishers.lock().closed = true;
    }

    async fn disconnect_all(&self) {
        {
            let mut publishers = self.publishers.lock();
            publishers.closed = true;
            publishers.streams.clear();
        }
        self.engine.disconnect_all().await;
    }

    pub fn publishers(&self) -> Vec<String> {
        let mut publishers: Vec<String> = self.publishers.lock().streams.iter().cloned().collect();
        publishers.sort();
        publishers
    }

    /// Give the compute node back once. Returns false on repeated calls.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.active_recordings.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

/// Starts and stops recordings mixed by the media engine
pub struct CompositeRecorder {
    registry: Arc<RecordingRegistry>,
    sealer: RecordingMetadataSealer,
    engines: Arc<dyn CompositionEngineFactory>,
    collaborators: Collaborators,
    shutdown: Shutdown,
    download_timeout: Duration,
}

impl CompositeRecorder {
    pub fn new(
        config: Arc<RecorderConfig>,
        registry: Arc<RecordingRegistry>,
        engines: Arc<dyn CompositionEngineFactory>,
        collaborators: Collaborators,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            sealer: RecordingMetadataSealer::new(&config.recording_path),
            download_timeout: Duration::from_secs(config.graceful_stop_timeout_secs),
            registry,
            engines,
            collaborators,
            shutdown,
        }
    }

    pub async fn start(&self, session: &Session, mut recording: Recording) -> RecordingResult<Recording> {
        let output_path = self.sealer.artifact_path(&recording, COMPOSITE_FORMAT);
        let output_uri = format!("file://{}", output_path.to_string_lossy());

        tracing::info!(
            "Starting composite recording {} of session {} into {}",
            recording.id,
            session.session_id,
            output_uri
        );

        let engine = self.engines.create(session, &output_uri);
        let handle = Arc::new(CompositeHandle::new(&recording.id, output_path, session, engine));

        if !self
            .registry
            .insert_composite(&session.session_id, Arc::clone(&handle))
        {
            self.registry.clean_recording(&recording.id);
            return Err(RecordingError::Start(format!(
                "Session {} is already being recorded by the compositor",
                session.session_id
            )));
        }

        for participant in session.streaming_participants() {
            if let Err(e) = self.connect_participant(&handle, participant).await {
                tracing::error!(
                    "Composite recorder of session {} could not start: {}",
                    session.session_id,
                    e
                );
                self.registry.take_composite(&session.session_id);
                handle.disconnect_all().await;
                self.registry.clean_recording(&recording.id);
                return Err(RecordingError::Start(e.to_string()));
            }
        }

        recording.set_status(RecordingStatus::Started);
        if let Err(e) = self.sealer.write_initial(&recording) {
            tracing::warn!("Could not write initial metadata of recording {}: {}", recording.id, e);
        }

        handle.active_recordings.fetch_add(1, Ordering::SeqCst);
        Ok(recording)
    }

    /// Connect one publisher. Only a failure to bring up the recorder endpoint is fatal.
    async fn connect_participant(
        &self,
        handle: &CompositeHandle,
        participant: &Participant,
    ) -> Result<(), CompositeError> {
        let Some(endpoint) = participant.publisher.as_ref() else {
            return Ok(());
        };

        match handle.connect(endpoint).await {
            Ok(()) => {
                tracing::debug!(
                    "Publisher {} of {} joined composite recording {}",
                    endpoint.stream_id,
                    participant.participant_id,
                    handle.recording_id
                );
                Ok(())
            }
            Err(e @ CompositeError::RecorderStart(_)) => Err(e),
            Err(e) => {
                tracing::warn!("{}. Recording continues without it", e);
                Ok(())
            }
        }
    }

    /// Add a publisher to the session's running composite, if any
    pub async fn join_publisher(&self, session: &Session, participant: &Participant) -> RecordingResult<()> {
        let Some(handle) = self.registry.composite(&session.session_id) else {
            tracing::debug!(
                "Session {} has no composite recording, ignoring publisher of {}",
                session.session_id,
                participant.participant_id
            );
            return Ok(());
        };

        self.connect_participant(&handle, participant)
            .await
            .map_err(|e| RecordingError::Start(e.to_string()))
    }

    /// Remove a publisher from the session's running composite, if any
    pub async fn remove_publisher(&self, session_id: &str, stream_id: &str) {
        let Some(handle) = self.registry.composite(session_id) else {
            return;
        };
        if handle.disconnect(stream_id).await {
            tracing::debug!(
                "Publisher {} left composite recording {}",
                stream_id,
                handle.recording_id
            );
        }
    }

    /// Stop the compositor and seal the artifact once it is downloaded.
    pub async fn stop(
        &self,
        session: Option<&Session>,
        mut recording: Recording,
        reason: Option<EndReason>,
        disconnect_timestamp: Option<i64>,
    ) -> Recording {
        let session_id = session
            .map(|s| s.session_id.clone())
            .unwrap_or_else(|| recording.session_id.clone());

        let Some(handle) = self.registry.take_composite(&session_id) else {
            tracing::warn!(
                "No composite recording running for session {}, recording {} fails",
                session_id,
                recording.id
            );
            recording.mark_failed();
            self.registry.clean_recording(&recording.id);
            return recording;
        };
        handle.close();

        let (done_tx, done_rx) = oneshot::channel();
        handle.engine.stop(done_tx, disconnect_timestamp).await;

        match bounded(COMPOSITE_STOP_TIMEOUT, &self.shutdown, done_rx).await {
            Some(Ok(())) => {
                tracing::debug!("Compositor of recording {} flushed its artifact", recording.id)
            }
            Some(Err(_)) => {
                tracing::error!("Compositor of recording {} dropped its completion signal", recording.id);
                recording.mark_failed();
            }
            None => {
                tracing::error!(
                    "Compositor of recording {} did not complete within {:?}",
                    recording.id,
                    COMPOSITE_STOP_TIMEOUT
                );
                recording.mark_failed();
            }
        }

        handle.disconnect_all().await;
        self.registry.clean_recording(&recording.id);

        let (sealed_tx, sealed_rx) = oneshot::channel();
        let on_complete = self.completion(Arc::clone(&handle), recording.clone(), reason, sealed_tx);

        let download = self.collaborators.downloader.download(&recording, on_complete);

        if let (Some(session), Some(reason)) = (session, reason) {
            self.collaborators
                .events
                .recording_stopped(session, &recording, reason);
        }

        if let Err(e) = download {
            tracing::error!("Could not download recording {}: {}", recording.id, e);
            return recording;
        }

        match bounded(self.download_timeout, &self.shutdown, sealed_rx).await {
            Some(Ok(sealed)) => sealed,
            _ => {
                tracing::warn!(
                    "Download of recording {} still pending, returning it as {:?}",
                    recording.id,
                    recording.status()
                );
                recording
            }
        }
    }

    /// Work done once the artifact is on local disk
    fn completion(
        &self,
        handle: Arc<CompositeHandle>,
        recording: Recording,
        reason: Option<EndReason>,
        sealed_tx: oneshot::Sender<Recording>,
    ) -> DownloadComplete {
        let sealer = self.sealer.clone();
        let uploader = Arc::clone(&self.collaborators.uploader);
        let nodes = Arc::clone(&self.collaborators.nodes);

        Box::new(move || {
            let size = file_size(&handle.output_path);
            let duration = handle.engine.duration_millis() as f64 / 1000.0;

            if let Err(e) = normalize_permissions(&sealer.recording_dir(&recording.id)) {
                tracing::warn!("Could not normalize permissions of recording {}: {}", recording.id, e);
            }

            let metadata = sealer.metadata_path(&recording);
            let recording = match sealer.seal_ready(recording.clone(), size, duration, &metadata) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::error!("Could not seal recording {}: {}", recording.id, e);
                    let mut failed = recording;
                    failed.mark_failed();
                    failed
                }
            };

            if handle.release() {
                nodes.release(&handle.compute_node_id);
            }

            tracing::info!(
                "Composite recording {} finished as {:?} ({} bytes, {:.3}s)",
                recording.id,
                recording.status(),
                recording.size,
                recording.duration
            );
            uploader.upload(recording.clone(), reason);
            let _ = sealed_tx.send(recording);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::{RecordingProperties, RecordingStatus};
    use crate::recorder::testing::{
        collaborators, collaborators_with_failing_download, ScriptedEngineFactory,
        TestCollaborators,
    };
    use std::path::Path;
    use tempfile::tempdir;

    fn session() -> Session {
        Session::new("S1", "node_a")
            .with_participant(Participant::publishing(
                "alice",
                PublisherEndpoint::new("str_alice", "ep_alice"),
            ))
            .with_participant(Participant::publishing(
                "bob",
                PublisherEndpoint::new("str_bob", "ep_bob"),
            ))
            .with_participant(Participant::new("carol"))
    }

    fn audio_only(registry: &RecordingRegistry) -> Recording {
        let properties = RecordingProperties {
            has_video: false,
            ..Default::default()
        };
        let recording = Recording::new("S1", "S1", properties);
        registry.mark_starting(&recording);
        recording
    }

    fn recorder(
        root: &Path,
        registry: Arc<RecordingRegistry>,
        engines: Arc<ScriptedEngineFactory>,
        collab: &TestCollaborators,
    ) -> CompositeRecorder {
        let config = Arc::new(RecorderConfig {
            recording_path: root.to_path_buf(),
            ..Default::default()
        });
        CompositeRecorder::new(
            config,
            registry,
            engines,
            collab.collaborators.clone(),
            Shutdown::never(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_only_lifecycle() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new());
        let mut collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines.clone(), &collab);
        let session = session();

        let recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        let engine = engines.last_engine().unwrap();
        assert_eq!(engine.connected(), vec!["str_alice", "str_bob"]);
        assert_eq!(session.active_recordings(), 1);
        assert!(dir.path().join("S1/.recording.S1").exists());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut recording = recording;
        recording.set_status(RecordingStatus::Stopping);
        let recording = recorder
            .stop(Some(&session), recording, Some(EndReason::LastParticipantLeft), Some(1_700_000_000_000))
            .await;

        assert_eq!(recording.status(), RecordingStatus::Ready);
        assert!((recording.duration - 1.8).abs() < 1e-9);
        assert_eq!(recording.size, 4096);
        assert!(engine.connected().is_empty());
        assert_eq!(engine.disconnect_all_calls(), 1);
        assert_eq!(engine.stop_timestamps(), vec![Some(1_700_000_000_000)]);
        assert_eq!(session.active_recordings(), 0);
        assert_eq!(collab.releases.released(), vec!["node_a"]);
        assert_eq!(registry.composite_count(), 0);

        // Notified with the snapshot taken before sealing
        assert_eq!(
            collab.events.stopped(),
            vec![(
                "S1".to_string(),
                RecordingStatus::Stopping,
                EndReason::LastParticipantLeft
            )]
        );
        let (uploaded, _) = collab.uploads.recv().await.unwrap();
        assert_eq!(uploaded.status(), RecordingStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_timeout_still_cleans_up() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new().completion_after(None));
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines.clone(), &collab);
        let session = session();

        let recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        let started = tokio::time::Instant::now();
        let recording = recorder.stop(Some(&session), recording, None, None).await;

        assert!(started.elapsed() >= COMPOSITE_STOP_TIMEOUT);
        assert_eq!(recording.status(), RecordingStatus::Failed);
        let engine = engines.last_engine().unwrap();
        assert!(engine.connected().is_empty());
        assert_eq!(registry.composite_count(), 0);
        assert_eq!(registry.starting_count(), 0);
        assert_eq!(session.active_recordings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_start_failure_aborts() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new().failing_recorder_start("no codec"));
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines, &collab);
        let session = session();

        let err = recorder.start(&session, audio_only(&registry)).await.unwrap_err();
        assert!(matches!(err, RecordingError::Start(ref msg) if msg.contains("no codec")));
        assert!(registry.is_idle());
        assert_eq!(session.active_recordings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_connect_failure_is_tolerated() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new().failing_stream("str_bob"));
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines.clone(), &collab);
        let session = session();

        recorder.start(&session, audio_only(&registry)).await.unwrap();
        assert_eq!(engines.last_engine().unwrap().connected(), vec!["str_alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishers_join_and_leave() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new());
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines.clone(), &collab);
        let session = session();

        // Nothing running yet
        recorder.remove_publisher("S1", "str_alice").await;

        recorder.start(&session, audio_only(&registry)).await.unwrap();
        let dave = Participant::publishing("dave", PublisherEndpoint::new("str_dave", "ep_dave"));
        recorder.join_publisher(&session, &dave).await.unwrap();
        recorder.remove_publisher("S1", "str_alice").await;

        let engine = engines.last_engine().unwrap();
        assert_eq!(engine.connected(), vec!["str_bob", "str_dave"]);
        let handle = registry.composite("S1").unwrap();
        assert_eq!(handle.publishers(), vec!["str_bob", "str_dave"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_session_uses_recording_session() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new());
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines, &collab);
        let session = session();

        let recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        let recording = recorder
            .stop(None, recording, Some(EndReason::SessionClosedByServer), None)
            .await;

        assert_eq!(recording.status(), RecordingStatus::Ready);
        assert!(collab.events.stopped().is_empty());
        assert_eq!(registry.composite_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_returns_current_status() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new());
        let collab = collaborators_with_failing_download();
        let recorder = recorder(dir.path(), registry.clone(), engines, &collab);
        let session = session();

        let mut recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        recording.set_status(RecordingStatus::Stopping);
        let recording = recorder
            .stop(Some(&session), recording, Some(EndReason::SessionClosedByServer), None)
            .await;

        assert_eq!(recording.status(), RecordingStatus::Stopping);
        assert_eq!(session.active_recordings(), 1);
        assert!(collab.releases.released().is_empty());
        assert_eq!(
            collab.events.stopped(),
            vec![(
                "S1".to_string(),
                RecordingStatus::Stopping,
                EndReason::SessionClosedByServer
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_metadata_is_started() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(ScriptedEngineFactory::new());
        let collab = collaborators();
        let recorder = recorder(dir.path(), registry.clone(), engines, &collab);
        let session = session();

        let recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        assert_eq!(recording.status(), RecordingStatus::Started);

        let sealer = RecordingMetadataSealer::new(dir.path());
        let stored = sealer.read_entity(&sealer.metadata_path(&recording)).unwrap();
        assert_eq!(stored.status(), RecordingStatus::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_racing_stop_leaves_no_publisher() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::new());
        let engines = Arc::new(
            ScriptedEngineFactory::new()
                .completion_after(Some(Duration::ZERO))
                .connect_delay(Duration::from_millis(100)),
        );
        let collab = collaborators();
        let recorder = Arc::new(recorder(dir.path(), registry.clone(), engines.clone(), &collab));
        let session = session();

        let recording = recorder.start(&session, audio_only(&registry)).await.unwrap();
        let handle = registry.composite("S1").unwrap();

        let join = {
            let recorder = Arc::clone(&recorder);
            let session = session.clone();
            tokio::spawn(async move {
                let dave = Participant::publishing("dave", PublisherEndpoint::new("str_dave", "ep_dave"));
                recorder.join_publisher(&session, &dave).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let recording = recorder.stop(Some(&session), recording, None, None).await;
        assert_eq!(recording.status(), RecordingStatus::Ready);
        join.await.unwrap().unwrap();

        assert!(engines.last_engine().unwrap().connected().is_empty());
        assert!(handle.publishers().is_empty());

        // Joins after the stop see no compositor at all
        let erin = Participant::publishing("erin", PublisherEndpoint::new("str_erin", "ep_erin"));
        recorder.join_publisher(&session, &erin).await.unwrap();
        assert!(engines.last_engine().unwrap().connected().is_empty());
    }
}
