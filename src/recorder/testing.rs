//! Scripted runtime, compositor and collaborators for recorder tests

use crate::compositor::{
    CompositeError, CompositionEngineFactory, MediaCompositionEngine, PublisherEndpoint,
};
use crate::recorder::state::{EndReason, Recording, RecordingStatus};
use crate::runtime::{ContainerRuntime, RunSpec, RuntimeError, RuntimeResult};
use crate::session::{
    Collaborators, ComputeNodeReleaser, DownloadComplete, RecordingDownloader, RecordingUploader,
    Session, SessionEvents,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const FFPROBE_REPORT: &str = r#"{
    "streams": [
        { "codec_type": "video", "width": 1280, "height": 720 },
        { "codec_type": "audio" }
    ],
    "format": { "duration": "42.5", "size": "1048576" }
}"#;

pub const AUDIO_ONLY_REPORT: &str = r#"{
    "streams": [ { "codec_type": "audio" } ],
    "format": { "duration": "42.5", "size": "2048" }
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Run { name: String },
    Exec { worker_id: String, command: String },
    Wait { worker_id: String },
    Remove { worker_id: String, force: bool },
    ImageCheck { image: String },
    EnsureImage { image: String },
    CleanStranded { image: String },
}

/// Container runtime whose workers write files on a schedule
pub struct ScriptedRuntime {
    recording_path: PathBuf,
    launch_delay: Duration,
    launch_failure: Option<String>,
    video_after: Option<Duration>,
    report: Option<String>,
    wait_fails: bool,
    image_present: bool,
    next_id: AtomicUsize,
    worker_recordings: Mutex<HashMap<String, String>>,
    specs: Mutex<Vec<RunSpec>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl ScriptedRuntime {
    pub fn new(recording_path: &Path) -> Self {
        Self {
            recording_path: recording_path.to_path_buf(),
            launch_delay: Duration::ZERO,
            launch_failure: None,
            video_after: Some(Duration::from_millis(300)),
            report: Some(FFPROBE_REPORT.to_string()),
            wait_fails: false,
            image_present: true,
            next_id: AtomicUsize::new(0),
            worker_recordings: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn failing_launch(mut self, message: &str) -> Self {
        self.launch_failure = Some(message.to_string());
        self
    }

    pub fn video_after(mut self, delay: Option<Duration>) -> Self {
        self.video_after = delay;
        self
    }

    pub fn report(mut self, report: Option<&str>) -> Self {
        self.report = report.map(str::to_string);
        self
    }

    pub fn wait_times_out(mut self) -> Self {
        self.wait_fails = true;
        self
    }

    pub fn image_missing(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    pub fn specs(&self) -> Vec<RunSpec> {
        self.specs.lock().clone()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().push(call);
    }

    fn env_value<'a>(spec: &'a RunSpec, key: &str) -> Option<&'a str> {
        spec.env
            .iter()
            .find_map(|entry| entry.strip_prefix(key)?.strip_prefix('='))
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn run(&self, spec: RunSpec) -> RuntimeResult<String> {
        self.record(RuntimeCall::Run {
            name: spec.name.clone(),
        });
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if let Some(message) = &self.launch_failure {
            return Err(RuntimeError::Launch(message.clone()));
        }

        let worker_id = format!("worker-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let video_id = Self::env_value(&spec, "VIDEO_ID").unwrap_or_default().to_string();
        let video_name = Self::env_value(&spec, "VIDEO_NAME").unwrap_or_default().to_string();
        self.worker_recordings
            .lock()
            .insert(worker_id.clone(), video_id.clone());

        if let Some(delay) = self.video_after {
            let video = self
                .recording_path
                .join(&video_id)
                .join(format!("{}.mp4", video_name));
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(parent) = video.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                let _ = fs::write(&video, b"ftypisom");
            });
        }

        self.specs.lock().push(spec);
        Ok(worker_id)
    }

    async fn exec_async(&self, worker_id: &str, command: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::Exec {
            worker_id: worker_id.to_string(),
            command: command.to_string(),
        });

        let video_id = self.worker_recordings.lock().get(worker_id).cloned();
        if let (Some(video_id), Some(report)) = (video_id, &self.report) {
            let dir = self.recording_path.join(&video_id);
            let _ = fs::create_dir_all(&dir);
            let _ = fs::write(dir.join(format!("{}.info", video_id)), report);
        }
        Ok(())
    }

    async fn wait_for_stopped(&self, worker_id: &str, seconds_of_wait: u64) -> RuntimeResult<()> {
        self.record(RuntimeCall::Wait {
            worker_id: worker_id.to_string(),
        });
        if self.wait_fails {
            return Err(RuntimeError::Timeout {
                worker_id: worker_id.to_string(),
                seconds: seconds_of_wait,
            });
        }
        Ok(())
    }

    async fn remove(&self, worker_id: &str, force: bool) -> RuntimeResult<()> {
        self.record(RuntimeCall::Remove {
            worker_id: worker_id.to_string(),
            force,
        });
        Ok(())
    }

    async fn image_exists_locally(&self, image: &str) -> RuntimeResult<bool> {
        self.record(RuntimeCall::ImageCheck {
            image: image.to_string(),
        });
        Ok(self.image_present)
    }

    async fn ensure_image_available(&self, image: &str, _seconds_of_wait: u64) -> RuntimeResult<()> {
        self.record(RuntimeCall::EnsureImage {
            image: image.to_string(),
        });
        Ok(())
    }

    async fn clean_stranded(&self, image: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::CleanStranded {
            image: image.to_string(),
        });
        Ok(())
    }
}

#[derive(Clone)]
struct EngineScript {
    completion: Option<Duration>,
    connect_delay: Duration,
    duration_millis: u64,
    recorder_start_failure: Option<String>,
    failing_streams: HashSet<String>,
}

/// Compositor finishing its artifact after a fixed delay
pub struct ScriptedEngine {
    output_path: PathBuf,
    script: EngineScript,
    started: AtomicBool,
    connected: Mutex<HashSet<String>>,
    disconnect_all_calls: AtomicUsize,
    stop_timestamps: Mutex<Vec<Option<i64>>>,
    pending: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ScriptedEngine {
    pub fn connected(&self) -> Vec<String> {
        let mut connected: Vec<String> = self.connected.lock().iter().cloned().collect();
        connected.sort();
        connected
    }

    pub fn disconnect_all_calls(&self) -> usize {
        self.disconnect_all_calls.load(Ordering::SeqCst)
    }

    pub fn stop_timestamps(&self) -> Vec<Option<i64>> {
        self.stop_timestamps.lock().clone()
    }
}

#[async_trait]
impl MediaCompositionEngine for ScriptedEngine {
    async fn connect_publisher(&self, endpoint: &PublisherEndpoint) -> Result<(), CompositeError> {
        if !self.script.connect_delay.is_zero() {
            tokio::time::sleep(self.script.connect_delay).await;
        }
        if !self.started.load(Ordering::SeqCst) {
            if let Some(reason) = &self.script.recorder_start_failure {
                return Err(CompositeError::RecorderStart(reason.clone()));
            }
            self.started.store(true, Ordering::SeqCst);
        }
        if self.script.failing_streams.contains(&endpoint.stream_id) {
            return Err(CompositeError::Connect {
                stream_id: endpoint.stream_id.clone(),
                reason: "ICE failed".to_string(),
            });
        }
        self.connected.lock().insert(endpoint.stream_id.clone());
        Ok(())
    }

    async fn disconnect_publisher(&self, stream_id: &str) {
        self.connected.lock().remove(stream_id);
    }

    async fn disconnect_all(&self) {
        self.disconnect_all_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.lock().clear();
    }

    async fn stop(&self, done: oneshot::Sender<()>, disconnect_timestamp: Option<i64>) {
        self.stop_timestamps.lock().push(disconnect_timestamp);

        let Some(delay) = self.script.completion else {
            self.pending.lock().push(done);
            return;
        };
        let output = self.output_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(parent) = output.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = fs::write(&output, vec![0u8; 4096]);
            let _ = done.send(());
        });
    }

    fn duration_millis(&self) -> u64 {
        self.script.duration_millis
    }
}

/// Factory handing out [`ScriptedEngine`]s
pub struct ScriptedEngineFactory {
    script: EngineScript,
    engines: Mutex<Vec<Arc<ScriptedEngine>>>,
}

impl ScriptedEngineFactory {
    pub fn new() -> Self {
        Self {
            script: EngineScript {
                completion: Some(Duration::from_millis(1_800)),
                connect_delay: Duration::ZERO,
                duration_millis: 1_800,
                recorder_start_failure: None,
                failing_streams: HashSet::new(),
            },
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn completion_after(mut self, delay: Option<Duration>) -> Self {
        self.script.completion = delay;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.script.connect_delay = delay;
        self
    }

    pub fn failing_recorder_start(mut self, reason: &str) -> Self {
        self.script.recorder_start_failure = Some(reason.to_string());
        self
    }

    pub fn failing_stream(mut self, stream_id: &str) -> Self {
        self.script.failing_streams.insert(stream_id.to_string());
        self
    }

    pub fn last_engine(&self) -> Option<Arc<ScriptedEngine>> {
        self.engines.lock().last().cloned()
    }
}

impl CompositionEngineFactory for ScriptedEngineFactory {
    fn create(&self, _session: &Session, output_uri: &str) -> Arc<dyn MediaCompositionEngine> {
        let output_path = PathBuf::from(output_uri.strip_prefix("file://").unwrap_or(output_uri));
        let engine = Arc::new(ScriptedEngine {
            output_path,
            script: self.script.clone(),
            started: AtomicBool::new(false),
            connected: Mutex::new(HashSet::new()),
            disconnect_all_calls: AtomicUsize::new(0),
            stop_timestamps: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        });
        self.engines.lock().push(Arc::clone(&engine));
        engine
    }
}

#[derive(Default)]
pub struct RecordedEvents {
    stopped: Mutex<Vec<(String, RecordingStatus, EndReason)>>,
}

impl RecordedEvents {
    pub fn stopped(&self) -> Vec<(String, RecordingStatus, EndReason)> {
        self.stopped.lock().clone()
    }
}

impl SessionEvents for RecordedEvents {
    fn recording_stopped(&self, _session: &Session, recording: &Recording, reason: EndReason) {
        self.stopped
            .lock()
            .push((recording.id.clone(), recording.status(), reason));
    }
}

struct ChannelUploader {
    tx: mpsc::UnboundedSender<(Recording, Option<EndReason>)>,
}

impl RecordingUploader for ChannelUploader {
    fn upload(&self, recording: Recording, reason: Option<EndReason>) {
        let _ = self.tx.send((recording, reason));
    }
}

/// Completes downloads on a spawned task, or refuses to start them
struct SpawnDownloader {
    fail: bool,
}

impl RecordingDownloader for SpawnDownloader {
    fn download(&self, _recording: &Recording, on_complete: DownloadComplete) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "compute node unreachable"));
        }
        tokio::spawn(async move { on_complete() });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordedReleases {
    nodes: Mutex<Vec<String>>,
}

impl RecordedReleases {
    pub fn released(&self) -> Vec<String> {
        self.nodes.lock().clone()
    }
}

impl ComputeNodeReleaser for RecordedReleases {
    fn release(&self, compute_node_id: &str) {
        self.nodes.lock().push(compute_node_id.to_string());
    }
}

pub struct TestCollaborators {
    pub collaborators: Collaborators,
    pub events: Arc<RecordedEvents>,
    pub releases: Arc<RecordedReleases>,
    pub uploads: mpsc::UnboundedReceiver<(Recording, Option<EndReason>)>,
}

pub fn collaborators() -> TestCollaborators {
    build_collaborators(false)
}

pub fn collaborators_with_failing_download() -> TestCollaborators {
    build_collaborators(true)
}

fn build_collaborators(fail_download: bool) -> TestCollaborators {
    let (tx, uploads) = mpsc::unbounded_channel();
    let events = Arc::new(RecordedEvents::default());
    let releases = Arc::new(RecordedReleases::default());

    TestCollaborators {
        collaborators: Collaborators {
            events: events.clone(),
            uploader: Arc::new(ChannelUploader { tx }),
            downloader: Arc::new(SpawnDownloader { fail: fail_download }),
            nodes: releases.clone(),
        },
        events,
        releases,
        uploads,
    }
}
