//! Retry delays: capped exponential backoff with full jitter

use rand::Rng;
use std::time::Duration;

/// Upper bound of the delay before retry number `attempt` (1-based)
pub fn backoff_cap(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let cap_ms = (base.as_millis() as u64).saturating_mul(1u64 << exponent);
    Duration::from_millis(cap_ms.min(max.as_millis() as u64))
}

/// Uniformly random delay in `[0, backoff_cap(attempt)]`
pub fn full_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let cap_ms = backoff_cap(attempt, base, max).as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}
