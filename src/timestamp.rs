//! Unix timestamp type shared by events, payment windows, and token TTLs.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::time::{SystemTime, SystemTimeError};

/// Seconds since the Unix epoch.
///
/// Nostr events carry `created_at` as a plain JSON integer, so unlike
/// stringified-timestamp wire formats this type serializes numerically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }

    /// Whether `self` is strictly more than `max_age` seconds before `now`.
    pub fn is_older_than(&self, max_age: u64, now: UnixTimestamp) -> bool {
        self.0 + max_age < now.0
    }

    pub fn saturating_sub(&self, secs: u64) -> UnixTimestamp {
        UnixTimestamp(self.0.saturating_sub(secs))
    }

    pub fn max(self, other: UnixTimestamp) -> UnixTimestamp {
        UnixTimestamp(self.0.max(other.0))
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl Sub<UnixTimestamp> for UnixTimestamp {
    type Output = u64;

    fn sub(self, rhs: UnixTimestamp) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UnixTimestamp {
    fn from(value: u64) -> Self {
        UnixTimestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_integer() {
        let ts = UnixTimestamp(1698080400);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1698080400");
        let back: UnixTimestamp = serde_json::from_str("1698080400").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_is_older_than() {
        let now = UnixTimestamp(1000);
        assert!(UnixTimestamp(700).is_older_than(180, now));
        assert!(!UnixTimestamp(900).is_older_than(180, now));
        // Exactly at the boundary is still acceptable.
        assert!(!UnixTimestamp(820).is_older_than(180, now));
    }

    #[test]
    fn test_saturating_sub() {
        assert_eq!(UnixTimestamp(100).saturating_sub(360), UnixTimestamp(0));
    }
}
