//! Session Recorder - composed recordings of live media sessions.
//!
//! This is the main library crate. It drives the recording lifecycle of a
//! session: video recordings are captured by worker containers, audio-only
//! recordings are mixed by the media engine, and every artifact is sealed
//! with a metadata sidecar before it is handed to upload.

pub mod compositor;
pub mod config;
pub mod layout;
pub mod metadata;
pub mod recorder;
pub mod runtime;
pub mod session;
pub mod utils;

pub use config::{RecorderConfig, RuntimeBackend};
pub use recorder::{EndReason, Recording, RecordingOrchestrator, RecordingProperties, RecordingStatus};
pub use utils::error::{RecordingError, RecordingResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to debug output for this crate. Calling it
/// again once a subscriber is installed does nothing.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Session recorder v{}", env!("CARGO_PKG_VERSION"));
    }
}
