use std::fmt;
use std::time::Duration;

use crate::accrual::client::{AccrualError, AccrualReply, AccrualStatus};

pub type Outcome = Result<AccrualReply, AccrualError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// the outcome is a final verdict
    Done,
    /// ask again after a wait
    Retry,
    /// give up on this order for now
    Fail,
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// total number of requests per order, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// wall-clock cap for all attempts of one order
    pub max_elapsed: Duration,
    pub classify: fn(&Outcome) -> Decision,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_elapsed", &self.max_elapsed)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(30),
            classify: classify_outcome,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based): initial_delay * multiplier^retry,
    /// capped at max_delay.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(retry as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Like `delay_for_attempt`, but a rate-limited reply may ask for a longer wait.
    pub fn delay_after(&self, retry: u32, outcome: &Outcome) -> Duration {
        let backoff = self.delay_for_attempt(retry);
        match outcome {
            Ok(AccrualReply::RateLimited {
                retry_after: Some(wait),
            }) => (*wait).max(backoff).min(self.max_delay),
            _ => backoff,
        }
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

pub fn classify_outcome(outcome: &Outcome) -> Decision {
    match outcome {
        Ok(AccrualReply::Verdict(verdict)) => match verdict.status {
            AccrualStatus::Invalid | AccrualStatus::Processed => Decision::Done,
            AccrualStatus::Registered | AccrualStatus::Processing => Decision::Retry,
        },
        Ok(AccrualReply::NotReady) | Ok(AccrualReply::RateLimited { .. }) | Ok(AccrualReply::ServerError(_)) => {
            Decision::Retry
        }
        Err(AccrualError::Transport(_)) | Err(AccrualError::Decode(_)) => Decision::Retry,
        Err(AccrualError::UnexpectedStatus(_)) => Decision::Fail,
    }
}
