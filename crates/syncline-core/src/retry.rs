use std::time::Duration;

use rand::Rng;

/// Extra wait added on top of a server-provided retry-after hint so the
/// retry lands after the throttling window, not on its edge.
pub const RATE_LIMIT_GUARD: Duration = Duration::from_millis(200);

/// Backoff policy for resilient delivery.
///
/// The delay grows exponentially with the retry count plus a uniform
/// jitter. A server retry-after hint bounds the wait from above; it never
/// extends it.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
    max_retries: u32,
    max_lifetime: Duration,
}

impl DeliveryRetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_ms,
            max_retries: 4,
            max_lifetime: Duration::from_secs(180),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Delay before the given retry (the first retry has `retry_count` 1).
    pub fn delay_for_retry(&self, retry_count: u32, server_hint: Option<Duration>) -> Duration {
        let shift = retry_count.min(16);
        let backoff = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let calculated = backoff.saturating_add(jitter).min(self.max_delay_ms);

        match server_hint {
            Some(hint) => {
                let hinted = (hint + RATE_LIMIT_GUARD).as_millis() as u64;
                Duration::from_millis(hinted.min(calculated))
            }
            None => Duration::from_millis(calculated),
        }
    }

    /// True once the retry budget or the operation lifetime is spent.
    /// Operations without a known age (queued while offline) never age out.
    pub fn is_exhausted(&self, retry_count: u32, age: Option<Duration>) -> bool {
        retry_count > self.max_retries || age.map_or(false, |age| age > self.max_lifetime)
    }
}

impl Default for DeliveryRetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 60_000, 3_000)
    }
}
