//! Exponential backoff schedule.

use std::time::Duration;

/// Delay before the retry that follows failed attempt number `attempt`
/// (1-based): `initial * 2^(attempt - 1)`, saturating.
pub fn exponential_delay(initial: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << exponent)
}
