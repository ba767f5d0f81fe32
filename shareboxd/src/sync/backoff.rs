use std::time::Duration;

use rand::Rng;

/// Exponential backoff with optional jitter for retrying failed sync passes.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            base_ms: whole_millis(base),
            cap_ms: whole_millis(cap),
            jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Deterministic variant for tests; `delay` feeds it a thread rng.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        let capped = self.base_ms.saturating_mul(factor).min(self.cap_ms);
        let millis = if self.jitter {
            rng.gen_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
