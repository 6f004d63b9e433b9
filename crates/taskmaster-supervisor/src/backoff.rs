//! Restart delay after consecutive failures.
//!
//! The delay for the `n`th consecutive failure is `base × n`, clamped to `max`,
//! so it never decreases while failures keep piling up.
//!
//! ```rust
//! use std::time::Duration;
//! use taskmaster_supervisor::BackoffPolicy;
//!
//! let backoff = BackoffPolicy {
//!     base: Duration::from_secs(1),
//!     max: Duration::from_secs(5),
//! };
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(3));
//! assert_eq!(backoff.delay(10), Duration::from_secs(5));
//! ```

use std::time::Duration;
use taskmaster_core::config::SupervisorSection;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub base: Duration,
	pub max: Duration,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			max: Duration::from_secs(30),
		}
	}
}

impl BackoffPolicy {
	/// Delay before the restart that follows failure number `attempt` (1-based).
	pub fn delay(&self, attempt: u32) -> Duration {
		self.base.saturating_mul(attempt.max(1)).min(self.max)
	}
}

impl From<&SupervisorSection> for BackoffPolicy {
	fn from(section: &SupervisorSection) -> Self {
		Self {
			base: Duration::from_millis(section.backoff_base_ms),
			max: Duration::from_millis(section.backoff_max_ms),
		}
	}
}
