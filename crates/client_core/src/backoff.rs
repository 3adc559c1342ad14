use std::time::Duration;

/// `min(base · 2^(attempt−1), ceiling)` for `attempt ≥ 1`; attempt 0 waits nothing.
pub fn exponential_delay(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = (attempt - 1).min(31);
    base.checked_mul(1u32 << exp)
        .unwrap_or(ceiling)
        .min(ceiling)
}
