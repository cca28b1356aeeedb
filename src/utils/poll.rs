//! Bounded waits
//!
//! Every wait in the recording lifecycle has an explicit ceiling and can be
//! preempted by process shutdown. Preemption is reported like a timeout.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Interval and attempt ceiling of a sleep-poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between two checks
    pub interval: Duration,

    /// Number of sleeps before giving up
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Worker readiness: non-empty video file within 90 seconds
    pub const VIDEO_READINESS: PollPolicy = PollPolicy {
        interval: Duration::from_millis(100),
        max_attempts: 900,
    };

    /// Stop-before-start recovery: worker handle within 15 seconds
    pub const RACE_RECOVERY: PollPolicy = PollPolicy {
        interval: Duration::from_millis(500),
        max_attempts: 30,
    };

    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Total time the loop may sleep
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Why a poll loop ended without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// Ceiling reached
    Exhausted { attempts: u32 },
    /// Shutdown preempted the loop
    Cancelled { attempts: u32 },
}

impl PollError {
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Exhausted { attempts } | PollError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Owner side of the process-level cancellation signal
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Preempt every bounded wait observing this handle
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the cancellation signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

impl Shutdown {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once shutdown has been triggered
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without firing
                return std::future::pending().await;
            }
        }
    }
}

/// Check, then sleep and check again up to `policy.max_attempts` times.
///
/// Returns the value found together with the number of sleeps it took.
pub async fn poll_until<T, F>(
    policy: PollPolicy,
    shutdown: &Shutdown,
    mut check: F,
) -> Result<(T, u32), PollError>
where
    F: FnMut() -> Option<T>,
{
    if let Some(value) = check() {
        return Ok((value, 0));
    }

    let mut shutdown = shutdown.clone();
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = shutdown.cancelled() => {
                return Err(PollError::Cancelled { attempts: attempt - 1 });
            }
        }
        if let Some(value) = check() {
            return Ok((value, attempt));
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
    })
}

/// Await `fut` for at most `limit`. `None` on timeout or shutdown.
pub async fn bounded<F>(limit: Duration, shutdown: &Shutdown, fut: F) -> Option<F::Output>
where
    F: Future,
{
    let mut shutdown = shutdown.clone();
    tokio::select! {
        result = tokio::time::timeout(limit, fut) => result.ok(),
        _ = shutdown.cancelled() => None,
    }
}
