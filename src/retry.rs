//! Retry policy for failed capture attempts.
//!
//! The policy is a pure state machine: given the attempt number that just
//! failed and its classified outcome, it decides whether to retry after a
//! delay or give up for the day. It never sleeps itself; the scheduler owns
//! the waiting, through the injected clock, so the policy is testable
//! without real time.
//!
//! Fatal failures are never retried - storage insufficiency and rejected
//! configurations will not self-resolve within the same day's window.
//! Transient failures back off exponentially: the delay doubles per attempt
//! up to a ceiling, and the attempt count is bounded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Outcome;

/// Decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay, within the same due window.
    Retry { delay: Duration },
    /// Stop: the day's capture is resolved as failed.
    GiveUp,
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per due window, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Ceiling on the backoff delay.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after `attempt` (1-based) resolved with `outcome`.
    pub fn decide(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        match outcome {
            Outcome::Success | Outcome::Fatal(_) => RetryDecision::GiveUp,
            Outcome::Transient(_) => {
                if attempt >= self.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry {
                        delay: self.delay_for(attempt),
                    }
                }
            }
        }
    }

    /// Backoff delay after the given 1-based attempt number.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
