//! Bounded-time polling.
//!
//! Repeatedly invokes a probe at a fixed interval until it reports the
//! awaited condition or the timeout elapses. Every bounded wait in the
//! runner (namespace cleanup, pod phase, object deletion) goes through
//! [`wait`] or [`Poller::wait`].

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// Default interval between probe invocations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe<E> {
    /// Whether the awaited condition holds.
    pub satisfied: bool,
    /// Diagnostic from this invocation, kept for the timeout message.
    pub error: Option<E>,
}

impl<E> Probe<E> {
    /// The condition holds.
    pub fn ready() -> Self {
        Self {
            satisfied: true,
            error: None,
        }
    }

    /// The condition does not hold yet, with a diagnostic.
    pub fn pending(error: E) -> Self {
        Self {
            satisfied: false,
            error: Some(error),
        }
    }

    /// The condition does not hold yet and there is nothing to report.
    pub fn not_yet() -> Self {
        Self {
            satisfied: false,
            error: None,
        }
    }

    /// Build from a bare condition plus the diagnostic to keep if it is false.
    pub fn when(satisfied: bool, error: E) -> Self {
        if satisfied {
            Self::ready()
        } else {
            Self::pending(error)
        }
    }
}

/// Final state of a poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome<E> {
    /// Whether the probe was satisfied before the timeout.
    pub satisfied: bool,
    /// Error from the final probe call (often `None` on success).
    pub last_error: Option<E>,
    /// Number of probe calls made.
    pub attempts: u32,
    /// Time spent polling.
    pub elapsed: Duration,
}

impl<E: fmt::Display> PollOutcome<E> {
    /// Convert a timed-out outcome into a [`PollError`] describing `what`.
    pub fn into_result(self, what: &str) -> Result<(), PollError> {
        if self.satisfied {
            return Ok(());
        }
        Err(PollError::TimedOut {
            what: what.to_string(),
            elapsed: self.elapsed,
            attempts: self.attempts,
            last_error: self.last_error.map(|e| e.to_string()),
        })
    }
}

/// Error returned when a wait does not complete in time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Timed-out waiting for {what} after {elapsed:?} ({attempts} attempts){}", fmt_last_error(.last_error))]
    TimedOut {
        what: String,
        elapsed: Duration,
        attempts: u32,
        last_error: Option<String>,
    },
}

fn fmt_last_error(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Total time budget.
    pub timeout: Duration,
    /// Pause between probe calls.
    pub interval: Duration,
}

impl Poller {
    /// Poller with the default one-second interval.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the interval between probe calls.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Invoke `probe` until it is satisfied or the timeout elapses.
    ///
    /// The probe is never called once the timeout has elapsed, and a probe
    /// that never succeeds keeps the loop running until the full timeout
    /// has passed.
    pub fn wait<E, F>(&self, mut probe: F) -> PollOutcome<E>
    where
        F: FnMut() -> Probe<E>,
    {
        let start = Instant::now();
        let mut attempts = 0;
        let mut last_error = None;

        while start.elapsed() < self.timeout {
            attempts += 1;
            let result = probe();
            last_error = result.error;
            if result.satisfied {
                trace!(attempts, elapsed = ?start.elapsed(), "Probe satisfied");
                return PollOutcome {
                    satisfied: true,
                    last_error,
                    attempts,
                    elapsed: start.elapsed(),
                };
            }

            let remaining = self.timeout.saturating_sub(start.elapsed());
            thread::sleep(self.interval.min(remaining));
        }

        trace!(attempts, timeout = ?self.timeout, "Probe timed out");
        PollOutcome {
            satisfied: false,
            last_error,
            attempts,
            elapsed: start.elapsed(),
        }
    }
}

/// Poll `probe` once per second until it is satisfied or `timeout` elapses.
pub fn wait<E, F>(timeout: Duration, probe: F) -> PollOutcome<E>
where
    F: FnMut() -> Probe<E>,
{
    Poller::new(timeout).wait(probe)
}
