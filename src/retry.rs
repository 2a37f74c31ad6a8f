// src/retry.rs
//! Bounded-retry policy shared by the judgment calls and digest delivery.
//! One policy object instead of ad hoc sleep/loop pairs at every call site.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt.
    Fixed(Duration),
    /// base, 2*base, 3*base, ...
    Linear(Duration),
    /// base, 2*base, 4*base, ...
    Exponential(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay to sleep after a failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(base) => base,
            Backoff::Linear(base) => base.saturating_mul(attempt),
            Backoff::Exponential(base) => base.saturating_mul(1u32 << (attempt - 1).min(16)),
        }
    }

    /// Run `op` up to `max_attempts` times. The closure receives the 1-based
    /// attempt number; the last error is returned when all attempts fail.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(_) => {
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
