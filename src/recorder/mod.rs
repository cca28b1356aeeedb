//! Recording system module
//!
//! This module implements the recording lifecycle:
//! - RecordingOrchestrator as the entry point for start/stop requests
//! - ContainerBackedRecorder for recordings captured by worker containers
//! - CompositeRecorder for audio-only recordings mixed in-process
//! - RaceRecoveryWorker for stop requests that overtake a worker launch
//! - RecordingRegistry holding the shared bookkeeping

pub mod composite;
pub mod container;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use composite::{CompositeHandle, CompositeRecorder};
pub use container::ContainerBackedRecorder;
pub use orchestrator::{RecordingEvent, RecordingOrchestrator};
pub use recovery::{RaceRecoveryWorker, RecoveryOutcome};
pub use registry::{RecordingRegistry, StopClaim, WorkerHandle};
pub use state::{EndReason, Recording, RecordingLayout, RecordingProperties, RecordingStatus};
