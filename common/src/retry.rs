//! Retry policies for the node's blocking connect loops.

use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<NonZeroU32>,
    pub backoff: Backoff,
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError<E: std::fmt::Display> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub const fn forever(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }

    pub fn allows_another(&self, attempts_so_far: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => attempts_so_far < max.get(),
        }
    }

    /// Runs `op` until it succeeds or the policy is exhausted, calling `wait`
    /// between attempts. `op` receives the 1-based attempt number.
    ///
    /// On success returns the value and the number of attempts it took.
    pub fn run<T, E: std::fmt::Display>(
        &self,
        mut wait: impl FnMut(Duration),
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<(T, u32), RetryError<E>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok((value, attempt)),
                Err(last) if !self.allows_another(attempt) => {
                    return Err(RetryError {
                        attempts: attempt,
                        last,
                    })
                }
                Err(_) => wait(self.delay_after(attempt)),
            }
        }
    }
}
