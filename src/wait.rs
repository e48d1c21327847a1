//! Polling waits for files written by other processes.
//!
//! The pipeline never blocks anywhere else. Every wait polls at a fixed
//! interval, gives up after an optional timeout, and checks a cancellation
//! token before each poll.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::WaitSettings;
use crate::error::{Result, StitchError};

/// Shared flag that aborts pending waits.
///
/// Library callers hold a clone and cancel from another thread. The CLI
/// installs no signal handler: a run killed by a signal leaves its journal
/// behind, and `mosaic-stitch recover` puts the tiles back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Poll interval and optional deadline of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// `None` waits until the condition holds or the wait is cancelled.
    pub timeout: Option<Duration>,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from(&WaitSettings::default())
    }
}

impl From<&WaitSettings> for WaitPolicy {
    fn from(settings: &WaitSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            timeout: settings
                .timeout_secs
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }
}

/// Block until `ready` returns true.
///
/// `what` names the awaited thing in logs and errors. Returns how long the
/// wait took.
pub fn wait_for(
    what: &str,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    mut ready: impl FnMut() -> bool,
) -> Result<Duration> {
    let start = Instant::now();
    let mut announced = false;

    loop {
        if cancel.is_cancelled() {
            return Err(StitchError::Cancelled {
                what: what.to_string(),
            });
        }
        if ready() {
            return Ok(start.elapsed());
        }

        let elapsed = start.elapsed();
        let mut nap = policy.poll_interval;
        if let Some(timeout) = policy.timeout {
            if elapsed >= timeout {
                return Err(StitchError::StitchTimeout {
                    what: what.to_string(),
                    waited_secs: elapsed.as_secs_f64(),
                });
            }
            nap = nap.min(timeout - elapsed);
        }

        if !announced {
            debug!("Waiting for {}", what);
            announced = true;
        }
        thread::sleep(nap);
    }
}

/// Block until `path` exists.
pub fn wait_for_file(
    path: &Path,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
) -> Result<Duration> {
    let what = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    wait_for(&what, policy, cancel, || path.exists())
}
