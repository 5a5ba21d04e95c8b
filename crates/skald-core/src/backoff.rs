//! Exponential backoff for transient-I/O retries, shared by every
//! adapter crate so a KV/BUS/DB timeout is retried the same way everywhere.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::SkaldConfig;
use crate::error::SkaldError;

/// An exponential backoff sequence with jitter, capped at a maximum delay.
///
/// `next()` never blocks and never panics; call it before sleeping and sleep
/// for the returned duration.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SkaldConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_multiplier, config.backoff_max)
    }

    /// Reset the sequence after a successful call.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay for the next retry, with up to 25% jitter, advancing the
    /// sequence.
    pub fn next(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);

        let unjittered = self.base.mul_f64(factor).min(self.max);
        let jitter_nanos = rand::thread_rng().gen_range(0..=(unjittered.as_nanos() / 4).max(1));

        unjittered - Duration::from_nanos(jitter_nanos as u64).min(unjittered)
    }
}

/// Retry `op` while it fails with a retryable [`SkaldError`], sleeping an
/// exponential backoff between attempts, up to `config.backoff_max_attempts`
/// tries total. A non-retryable error, or the last attempt's error, is
/// always returned immediately.
///
/// Shared by the redis/kafka/mongo adapter crates so a KV/BUS/DB timeout is
/// retried the same way everywhere, rather than each adapter growing its own
/// retry loop.
pub async fn retry<T, F, Fut>(config: &SkaldConfig, mut op: F) -> Result<T, SkaldError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SkaldError>>,
{
    let mut backoff = Backoff::from_config(config);
    let mut attempt: u32 = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind().is_retryable() && attempt < config.backoff_max_attempts => {
                let delay = backoff.next();
                tracing::warn!(?err, attempt, ?delay, "transient error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_millis(500));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next();
            assert!(last <= Duration::from_millis(500));
        }
        assert!(last > Duration::ZERO);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        backoff.next();
        backoff.next();
        backoff.reset();
        // After reset, the first delay should again be close to `base` (allow
        // for jitter).
        let delay = backoff.next();
        assert!(delay <= Duration::from_millis(100));
    }
}
