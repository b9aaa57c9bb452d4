//! Bounded retry budgets for non-blocking reads and cache-full resends.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry budget for a non-blocking read that sees "no data yet".
///
/// Attempt `n` sleeps `min(n * step, ceiling)` before the next one. The
/// defaults (400 attempts, 1 ms step, 25 ms ceiling) add up to roughly ten
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RetryPolicy {
    /// Total number of read attempts.
    pub attempts: u32,
    /// Delay growth per attempt, in milliseconds.
    pub step_ms: u64,
    /// Upper bound of a single delay, in milliseconds.
    pub ceiling_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 400,
            step_ms: 1,
            ceiling_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub const fn new(attempts: u32, step_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            attempts,
            step_ms,
            ceiling_ms,
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self.step_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(ms.min(self.ceiling_ms))
    }

    /// Sum of all delays the policy can sleep.
    pub fn budget(&self) -> Duration {
        (1..self.attempts).map(|a| self.delay(a)).sum()
    }

    /// Calls `attempt` until it yields a value, at most `self.attempts` times.
    ///
    /// `Ok(None)` from `attempt` means "no data yet". Errors end the loop
    /// immediately. Running out of attempts is [`Error::ReadTimeout`].
    pub fn run<T>(&self, mut attempt: impl FnMut() -> Result<Option<T>>) -> Result<T> {
        for n in 1..=self.attempts {
            if let Some(v) = attempt()? {
                return Ok(v);
            }
            if n < self.attempts {
                thread::sleep(self.delay(n));
            }
        }
        Err(Error::ReadTimeout {
            attempts: self.attempts,
        })
    }
}

/// Resend budget while the peer answers cache-full.
///
/// Defaults: 100 ms between attempts, 3000 attempts (about five minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Backoff {
    /// Total number of sends.
    pub attempts: u32,
    /// Pause between sends, in milliseconds.
    pub interval_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3000,
            interval_ms: 100,
        }
    }
}

impl Backoff {
    /// Creates a backoff budget.
    pub const fn new(attempts: u32, interval_ms: u64) -> Self {
        Self {
            attempts,
            interval_ms,
        }
    }

    /// Pause between two sends.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
