//! Retry discipline for fallible I/O.
//!
//! Every network edge of the pipeline (catalog queries, bulk writes,
//! checkpoint reads/writes) is wrapped in [`retry_forever`]: exponential
//! backoff capped at a maximum delay, unbounded attempts. The engine prefers
//! to wedge and log on a persistent upstream outage rather than crash.
//!
//! Cancellation is cooperative: a shared [`Shutdown`] flag is checked between
//! sleeps, so a SIGINT interrupts a retry ladder at the next slice.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::error;

/// Shared cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early when the flag trips.
    ///
    /// Returns `false` if shutdown was requested before the sleep finished.
    pub async fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(200);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_triggered() {
                return false;
            }
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        !self.is_triggered()
    }
}

/// Exponential backoff schedule: `start × factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub start: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            start: Duration::from_millis(100),
            factor: 2,
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retrying after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.start;
        for _ in 0..attempt {
            if delay >= self.max {
                break;
            }
            delay = (delay * self.factor).min(self.max);
        }
        delay.min(self.max)
    }
}

/// Run `op` until it succeeds, sleeping on the backoff schedule between
/// attempts. Attempts are unbounded; the only way out besides success is the
/// shutdown flag tripping, which surfaces as an error.
pub async fn retry_forever<T, F, Fut>(
    policy: Backoff,
    shutdown: &Shutdown,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = policy.delay(attempt);
                error!(
                    "{label} failed (attempt {}): {err:#}; retrying in {:?}",
                    attempt + 1,
                    delay
                );
                attempt = attempt.saturating_add(1);
                if !shutdown.sleep(delay).await {
                    anyhow::bail!("{label}: shutdown requested during retry");
                }
            }
        }
    }
}
