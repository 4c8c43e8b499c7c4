//! Retry delays after transient failures.
//!
//! The nominal delay doubles with every attempt up to `backoff_max`. Each
//! command then lands somewhere in a window around it, picked from a hash of
//! its id and attempt, so a burst of failures from one provider does not come
//! back as a burst and a rerun of the same failure waits the same time.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use crate::{command::CommandId, config::RetryConfig};

/// Delay before attempt `attempt` (1-based) of `id` becomes visible again.
pub fn retry_delay(config: &RetryConfig, id: &CommandId, attempt: u32) -> Duration {
    let base = config.backoff_base();
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }

    let max = config.backoff_max();
    let doublings = (attempt - 1).min(31);
    let nominal = base
        .checked_mul(1 << doublings)
        .map_or(max, |delay| delay.min(max));

    Duration::from_millis(spread_ms(config, nominal, max, id, attempt))
}

/// Places `nominal` within `nominal ± span`, never past `max`. The span is
/// `jitter_ratio` of the nominal delay, at least `jitter_min_ms`, and never
/// wider than the delay itself.
fn spread_ms(
    config: &RetryConfig,
    nominal: Duration,
    max: Duration,
    id: &CommandId,
    attempt: u32,
) -> u64 {
    let nominal_ms = u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    // NaN casts to zero.
    let permille = (config.jitter_ratio.clamp(0.0, 1.0) * 1000.0) as u64;
    let span_ms = (nominal_ms.saturating_mul(permille) / 1000)
        .max(config.jitter_min_ms)
        .min(nominal_ms);
    if span_ms == 0 {
        return nominal_ms;
    }

    let width = span_ms.saturating_mul(2).saturating_add(1);
    let offset = seed(id, attempt) % width;
    (nominal_ms - span_ms).saturating_add(offset).min(max_ms)
}

fn seed(id: &CommandId, attempt: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}
