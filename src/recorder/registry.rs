//! Recording registry
//!
//! Process-wide bookkeeping shared by every recorder: recordings being started
//! or already started, the worker bound to each session, the compositor handle
//! of audio-only sessions and the set of in-flight race recoveries.
//!
//! All maps live behind a single lock so that compound checks (such as "is
//! there a worker for this session, and if not, is a recovery already running
//! for this recording") are atomic.

use super::composite::CompositeHandle;
use super::state::Recording;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Worker launched for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: String,
    /// Container name, `recording_<recordingId>`
    pub name: String,
    pub session_id: String,
    pub recording_id: String,
}

/// What a stop request found when it looked for the session's worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopClaim {
    /// The worker was registered and now belongs to the caller
    Worker(WorkerHandle),
    /// Still starting and no worker yet; the caller must run a race recovery
    Recovery,
    /// Still starting and another caller already runs the recovery
    RecoveryInFlight,
    /// Neither starting nor running a worker, e.g. already stopped
    NotRunning,
}

#[derive(Default)]
struct Inner {
    starting: HashMap<String, Recording>,
    started: HashMap<String, Recording>,
    session_workers: HashMap<String, WorkerHandle>,
    worker_names: HashMap<String, String>,
    composites: HashMap<String, Arc<CompositeHandle>>,
    recoveries: HashSet<String>,
}

impl Inner {
    fn take_worker_of(&mut self, session_id: &str, recording_id: &str) -> Option<WorkerHandle> {
        let owned = self
            .session_workers
            .get(session_id)
            .map(|handle| handle.recording_id == recording_id)
            .unwrap_or(false);
        if !owned {
            return None;
        }
        let handle = self.session_workers.remove(session_id)?;
        self.worker_names.remove(&handle.worker_id);
        Some(handle)
    }
}

/// Shared recording bookkeeping
#[derive(Default)]
pub struct RecordingRegistry {
    inner: Mutex<Inner>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First free id among `sessionId`, `sessionId-1`, `sessionId-2`...
    ///
    /// An id is taken when a recording with it is starting or started, or when
    /// `exists_on_disk` reports a folder for it.
    pub fn reserve_recording_id<F>(&self, session_id: &str, exists_on_disk: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let inner = self.inner.lock();
        let taken = |id: &str| {
            inner.starting.contains_key(id) || inner.started.contains_key(id) || exists_on_disk(id)
        };

        if !taken(session_id) {
            return session_id.to_string();
        }
        (1..)
            .map(|n| format!("{}-{}", session_id, n))
            .find(|id| !taken(id))
            .unwrap_or_else(|| session_id.to_string())
    }

    /// Returns false when the id was already starting
    pub fn mark_starting(&self, recording: &Recording) -> bool {
        let mut inner = self.inner.lock();
        if inner.starting.contains_key(&recording.id) {
            return false;
        }
        inner.starting.insert(recording.id.clone(), recording.clone());
        true
    }

    /// Move a recording from `starting` to `started`
    pub fn mark_started(&self, recording: &Recording) {
        let mut inner = self.inner.lock();
        inner.starting.remove(&recording.id);
        inner.started.insert(recording.id.clone(), recording.clone());
    }

    pub fn is_starting(&self, recording_id: &str) -> bool {
        self.inner.lock().starting.contains_key(recording_id)
    }

    pub fn started_recording(&self, recording_id: &str) -> Option<Recording> {
        self.inner.lock().started.get(recording_id).cloned()
    }

    /// Drop a recording from the starting and started tables
    pub fn clean_recording(&self, recording_id: &str) {
        let mut inner = self.inner.lock();
        inner.starting.remove(recording_id);
        inner.started.remove(recording_id);
    }

    /// Bind a worker to its session. Returns false if the session already had one.
    pub fn register_worker(&self, handle: WorkerHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.session_workers.contains_key(&handle.session_id) {
            return false;
        }
        inner
            .worker_names
            .insert(handle.worker_id.clone(), handle.name.clone());
        inner
            .session_workers
            .insert(handle.session_id.clone(), handle);
        true
    }

    pub fn worker_for(&self, session_id: &str) -> Option<WorkerHandle> {
        self.inner.lock().session_workers.get(session_id).cloned()
    }

    pub fn worker_name(&self, worker_id: &str) -> Option<String> {
        self.inner.lock().worker_names.get(worker_id).cloned()
    }

    /// Remove and return the session's worker if it was launched for `recording_id`
    pub fn take_worker_of(&self, session_id: &str, recording_id: &str) -> Option<WorkerHandle> {
        let mut inner = self.inner.lock();
        inner.take_worker_of(session_id, recording_id)
    }

    /// Drop the worker of a session only if it is still `worker_id`
    pub fn forget_worker(&self, session_id: &str, worker_id: &str) {
        let mut inner = self.inner.lock();
        let owned = inner
            .session_workers
            .get(session_id)
            .map(|handle| handle.worker_id == worker_id)
            .unwrap_or(false);
        if owned {
            inner.session_workers.remove(session_id);
        }
        inner.worker_names.remove(worker_id);
    }

    /// Claim the recording's worker, or the right to recover a stop that
    /// overtook the start. Exactly one caller wins the recovery, and only
    /// while the recording is still starting.
    pub fn take_worker_or_claim_recovery(&self, session_id: &str, recording_id: &str) -> StopClaim {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.take_worker_of(session_id, recording_id) {
            return StopClaim::Worker(handle);
        }
        if !inner.starting.contains_key(recording_id) {
            return StopClaim::NotRunning;
        }
        if inner.recoveries.insert(recording_id.to_string()) {
            StopClaim::Recovery
        } else {
            StopClaim::RecoveryInFlight
        }
    }

    pub fn finish_recovery(&self, recording_id: &str) {
        self.inner.lock().recoveries.remove(recording_id);
    }

    pub fn recovery_in_flight(&self, recording_id: &str) -> bool {
        self.inner.lock().recoveries.contains(recording_id)
    }

    pub fn pending_recoveries(&self) -> usize {
        self.inner.lock().recoveries.len()
    }

    /// Returns false when the session already had a compositor
    pub fn insert_composite(&self, session_id: &str, handle: Arc<CompositeHandle>) -> bool {
        let mut inner = self.inner.lock();
        if inner.composites.contains_key(session_id) {
            return false;
        }
        inner.composites.insert(session_id.to_string(), handle);
        true
    }

    pub fn composite(&self, session_id: &str) -> Option<Arc<CompositeHandle>> {
        self.inner.lock().composites.get(session_id).cloned()
    }

    pub fn take_composite(&self, session_id: &str) -> Option<Arc<CompositeHandle>> {
        self.inner.lock().composites.remove(session_id)
    }

    pub fn starting_count(&self) -> usize {
        self.inner.lock().starting.len()
    }

    pub fn started_count(&self) -> usize {
        self.inner.lock().started.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().session_workers.len()
    }

    pub fn composite_count(&self) -> usize {
        self.inner.lock().composites.len()
    }

    /// Nothing tracked at all
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.starting.is_empty()
            && inner.started.is_empty()
            && inner.session_workers.is_empty()
            && inner.worker_names.is_empty()
            && inner.composites.is_empty()
            && inner.recoveries.is_empty()
    }
}
