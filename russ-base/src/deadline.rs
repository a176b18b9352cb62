//! Absolute, monotonic-clock deadlines threaded through every blocking operation.

use std::time::Duration;
use std::time::Instant;

/// Sentinel meaning "wait forever". Mirrors `RUSS_DEADLINE_NEVER` (`INT64_MAX` ms).
pub const NEVER: Deadline = Deadline(i64::MAX);

/// An absolute point in time, expressed in milliseconds on a monotonic clock, at which a
/// blocking operation should give up.
///
/// [`NEVER`] is the sentinel for "no deadline". Deadlines are otherwise relative to an
/// unspecified epoch fixed at process start (see [`Deadline::now`]), not wall-clock time, so
/// they are stable across clock adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(i64);

fn monotonic_origin() -> Instant {
    static ORIGIN: once_cell::sync::OnceCell<Instant> = once_cell::sync::OnceCell::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl Deadline {
    /// The current time expressed on the same clock as every other `Deadline`.
    pub fn now() -> Deadline {
        let elapsed = Instant::now().saturating_duration_since(monotonic_origin());
        Deadline(elapsed.as_millis() as i64)
    }

    /// Builds a deadline `timeout` from now. A `None` timeout maps to [`NEVER`].
    pub fn from_timeout(timeout: Option<Duration>) -> Deadline {
        match timeout {
            None => NEVER,
            Some(d) => {
                let ms = d.as_millis().min(i64::MAX as u128) as i64;
                let now = Self::now().0;
                Deadline(now.saturating_add(ms))
            }
        }
    }

    /// `true` if this deadline never expires.
    pub fn is_never(self) -> bool {
        self == NEVER
    }

    /// Milliseconds remaining until this deadline, clamped to `>= 0`. [`NEVER`] reports
    /// `i32::MAX`, a value large enough to pass to `poll(2)` as "block indefinitely" callers
    /// that want a finite timeout should special-case [`Deadline::is_never`] instead.
    pub fn remaining_ms(self) -> i64 {
        if self.is_never() {
            return i64::from(i32::MAX);
        }
        (self.0 - Self::now().0).max(0)
    }

    /// Like [`remaining_ms`](Self::remaining_ms) but saturates to `Duration::MAX` for
    /// [`NEVER`], for APIs that want a `Duration`.
    pub fn remaining(self) -> Duration {
        if self.is_never() {
            return Duration::MAX;
        }
        Duration::from_millis(self.remaining_ms().max(0) as u64)
    }

    /// Signed difference, in milliseconds, between this deadline and another. Negative if
    /// `self` is earlier than `other`.
    pub fn diff_ms(self, other: Deadline) -> i64 {
        self.0 - other.0
    }

    /// `true` once `Deadline::now()` has passed this deadline.
    pub fn has_expired(self) -> bool {
        !self.is_never() && Self::now().0 >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_never_expires() {
        assert!(!NEVER.has_expired());
        assert_eq!(NEVER.remaining_ms(), i64::from(i32::MAX));
    }

    #[test]
    fn timeout_zero_expires_immediately() {
        let d = Deadline::from_timeout(Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.has_expired());
    }

    #[test]
    fn timeout_future_has_not_expired() {
        let d = Deadline::from_timeout(Some(Duration::from_secs(60)));
        assert!(!d.has_expired());
        assert!(d.remaining_ms() > 0);
    }

    #[test]
    fn diff_is_signed() {
        let a = Deadline::from_timeout(Some(Duration::from_millis(100)));
        let b = Deadline::from_timeout(Some(Duration::from_millis(200)));
        assert!(a.diff_ms(b) < 0);
        assert!(b.diff_ms(a) > 0);
    }
}
