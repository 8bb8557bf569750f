//! Bounded poll-and-retry for operations on a non-blocking connection.

use std::time::{Duration, Instant};

use smart_default::SmartDefault;

use crate::error::{Error, Result};

/// How long flush and drain loops may keep polling before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault)]
pub struct RetryPolicy {
    /// Pause after the first unsuccessful attempt
    #[default(Duration::from_micros(100))]
    pub initial_delay: Duration,

    /// Upper bound for a single pause; the delay doubles until it reaches this
    #[default(Duration::from_millis(20))]
    pub max_delay: Duration,

    /// Total time budget of one wait
    #[default(Duration::from_secs(30))]
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, operation: &'static str) -> Backoff {
        Backoff {
            policy: *self,
            operation,
            delay: self.initial_delay,
            attempts: 0,
            started: Instant::now(),
        }
    }
}

/// One bounded wait. Call [`Backoff::wait`] each time an attempt made no progress.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    operation: &'static str,
    delay: Duration,
    attempts: u32,
    started: Instant,
}

impl Backoff {
    /// Sleep before the next attempt, or fail with [`Error::Timeout`] once the budget is spent.
    pub fn wait(&mut self) -> Result<()> {
        self.attempts = self.attempts.saturating_add(1);
        let elapsed = self.started.elapsed();
        if elapsed >= self.policy.timeout {
            return Err(Error::Timeout {
                operation: self.operation,
                attempts: self.attempts,
            });
        }
        let remaining = self.policy.timeout - elapsed;
        std::thread::sleep(self.delay.min(remaining));
        self.delay = (self.delay * 2).min(self.policy.max_delay);
        Ok(())
    }

    /// Progress was made: start the next wait from the initial delay again.
    pub fn reset(&mut self) {
        self.delay = self.policy.initial_delay;
        self.attempts = 0;
        self.started = Instant::now();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
