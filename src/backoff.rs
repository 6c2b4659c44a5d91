//! Exponential backoff for retries at I/O boundaries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest exponent applied to the initial delay (caps growth at 64x).
const MAX_EXPONENT: u32 = 6;

/// Exponential backoff with optional jitter.
///
/// The delay for attempt `n` (0-based) is `initial * 2^min(n, 6)`, capped at
/// `max`. With jitter enabled, up to `jitter` of the delay is randomly
/// subtracted so that many tasks retrying at once spread out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
  /// Delay before the first retry.
  #[serde(with = "millis")]
  pub initial: Duration,
  /// Upper bound for any delay.
  #[serde(with = "millis")]
  pub max: Duration,
  /// Fraction (0.0..=1.0) of the delay that may be randomly removed.
  pub jitter: f64,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_millis(100),
      max: Duration::from_secs(10),
      jitter: 0.2,
    }
  }
}

impl Backoff {
  /// Creates a backoff without jitter.
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max,
      jitter: 0.0,
    }
  }

  /// Sets the jitter fraction, clamped to `0.0..=1.0`.
  #[must_use]
  pub fn with_jitter(mut self, jitter: f64) -> Self {
    self.jitter = jitter.clamp(0.0, 1.0);
    self
  }

  /// Returns the delay before retry number `attempt` (0-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(MAX_EXPONENT);
    let base = self.initial.saturating_mul(factor).min(self.max);
    if self.jitter <= 0.0 || base.is_zero() {
      return base;
    }
    let spread = base.mul_f64(self.jitter);
    let cut = rand::thread_rng().gen_range(Duration::ZERO..=spread);
    base - cut
  }
}

pub(crate) mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_doubles_until_cap() {
    let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
    assert_eq!(backoff.delay(0), Duration::from_millis(10));
    assert_eq!(backoff.delay(1), Duration::from_millis(20));
    assert_eq!(backoff.delay(2), Duration::from_millis(40));
    assert_eq!(backoff.delay(3), Duration::from_millis(80));
    assert_eq!(backoff.delay(4), Duration::from_millis(100));
    assert_eq!(backoff.delay(60), Duration::from_millis(100));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let backoff =
      Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter(0.5);
    for _ in 0..100 {
      let d = backoff.delay(0);
      assert!(d >= Duration::from_millis(50));
      assert!(d <= Duration::from_millis(100));
    }
  }

  #[test]
  fn test_jitter_is_clamped() {
    let backoff = Backoff::default().with_jitter(7.0);
    assert_eq!(backoff.jitter, 1.0);
  }
}
