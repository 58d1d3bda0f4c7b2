//! Pure exponential backoff computation.
//!
//! `backoff` has no state and does no IO - it is a deterministic function of
//! its four inputs, treating policy data ([`crate::job::TaskConfig`]) as
//! plain values rather than a service.

use std::time::Duration;

/// Default minimum delay: 100ms.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(100);
/// Default maximum delay: 10s.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
/// Default growth factor.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Compute the exponential backoff delay for a given attempt.
///
/// `delay = clamp(min * factor^attempt, min, max)`.
///
/// Non-positive `min`, `max`, or `factor` fall back to their defaults.
/// `max < min` is not a meaningful policy; the effective minimum wins so the
/// clamp never rejects the default floor.
/// The intermediate multiplication saturates at `max` instead of overflowing
/// (a large `attempt` with `factor > 1` grows without bound).
///
/// # Examples
///
/// ```
/// use queuecore::backoff;
/// use std::time::Duration;
///
/// let delays: Vec<Duration> = (0..9)
///     .map(|a| backoff::backoff(Duration::from_secs(1), Duration::from_secs(60), 2.0, a))
///     .collect();
/// assert_eq!(
///     delays,
///     vec![1, 2, 4, 8, 16, 32, 60, 60, 60].into_iter().map(Duration::from_secs).collect::<Vec<_>>()
/// );
/// ```
pub fn backoff(min: Duration, max: Duration, factor: f64, attempt: u32) -> Duration {
    let min = if min.is_zero() { DEFAULT_MIN_DELAY } else { min };
    let max = if max.is_zero() { DEFAULT_MAX_DELAY } else { max };
    let max = max.max(min);
    let factor = if factor <= 0.0 { DEFAULT_FACTOR } else { factor };

    let scale = factor.powi(attempt as i32);
    if !scale.is_finite() {
        return max;
    }

    let min_secs = min.as_secs_f64();
    let raw_secs = min_secs * scale;
    if !raw_secs.is_finite() || raw_secs >= max.as_secs_f64() {
        return max;
    }

    Duration::from_secs_f64(raw_secs.max(min_secs))
}
