//! Bounded polling for guest readiness.
//!
//! A freshly started guest gives no notification when its SSH server comes
//! up, so readiness is established by repeatedly attempting a full
//! connect/authenticate/execute cycle.

use std::time::{Duration, Instant};

use color_eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::debug;

/// Number of readiness attempts before giving up.
pub(crate) const DEFAULT_ATTEMPTS: u32 = 60;

/// Pause between two readiness attempts.
pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// How often, and how patiently, to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Every attempt allowed by the policy failed.
#[derive(Debug, Error)]
#[error("Not ready after {attempts} attempts ({elapsed}s)")]
pub(crate) struct ReadinessExhausted {
    pub attempts: u32,
    pub elapsed: u64,
}

/// Spinner shown while waiting; hidden automatically when stderr is not a
/// terminal.
pub(crate) fn create_progress_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(150));
    pb
}

/// Call `test_fn` until it reports ready or `policy.attempts` is used up.
///
/// `Ok(false)` and `Err(_)` from `test_fn` both mean "not ready yet"; the
/// error is only logged. Sleeps `policy.interval` between attempts but not
/// after the last one. Returns the number of attempts used.
pub(crate) fn wait_for_readiness<F>(
    progress: &ProgressBar,
    message: &str,
    policy: ReadinessPolicy,
    mut test_fn: F,
) -> Result<u32, ReadinessExhausted>
where
    F: FnMut(u32) -> Result<bool>,
{
    let start_time = Instant::now();
    debug!(
        "Polling for readiness ({} attempts, {}s apart)",
        policy.attempts,
        policy.interval.as_secs()
    );

    for attempt in 1..=policy.attempts {
        progress.set_message(format!(
            "{} (attempt {}/{}, elapsed: {}s)",
            message,
            attempt,
            policy.attempts,
            start_time.elapsed().as_secs()
        ));

        match test_fn(attempt) {
            Ok(true) => {
                debug!("Readiness check successful after {} attempts", attempt);
                return Ok(attempt);
            }
            Ok(false) => {
                debug!("Readiness check attempt {} returned false", attempt);
            }
            Err(e) => {
                debug!("Readiness check attempt {} failed: {:#}", attempt, e);
            }
        }

        if attempt < policy.attempts {
            std::thread::sleep(policy.interval);
        }
    }

    Err(ReadinessExhausted {
        attempts: policy.attempts,
        elapsed: start_time.elapsed().as_secs(),
    })
}
