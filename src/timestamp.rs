//! ==============================================================================
//! timestamp.rs - fixed-width utc timestamps
//! ==============================================================================
//!
//! purpose:
//!     every document this authority writes stores time as a 14 character
//!     `YYYYMMDDHHMMSS` utc string. "never" is the all-zero string.
//!     `Stamp` is the in-memory form: whole seconds since the unix epoch,
//!     compared and aged without touching strings.
//!
//! relationships:
//!     - used by: every store (device, server, project), history.rs, engine.rs
//!     - uses: chrono (formatting / parsing)
//!
//! ==============================================================================

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

const FORMAT: &str = "%Y%m%d%H%M%S";
const NEVER_TEXT: &str = "00000000000000";

/// A point in time with one second resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(i64);

impl Stamp {
    /// Sentinel for "never happened".
    pub const NEVER: Stamp = Stamp(0);

    pub fn now() -> Self {
        Stamp(Utc::now().timestamp())
    }

    pub fn from_secs(secs: i64) -> Self {
        Stamp(secs)
    }

    pub fn is_never(self) -> bool {
        self == Self::NEVER
    }

    /// Parse the fixed-width form. Returns `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text == NEVER_TEXT {
            return Some(Self::NEVER);
        }
        if text.len() != NEVER_TEXT.len() {
            return None;
        }
        NaiveDateTime::parse_from_str(text, FORMAT)
            .ok()
            .map(|dt| Stamp(dt.and_utc().timestamp()))
    }

    pub fn minus(self, d: Duration) -> Self {
        Stamp(self.0.saturating_sub(secs(d)))
    }

    /// Time elapsed from `self` until `now`.
    ///
    /// "never" is infinitely old; stamps in the future have age zero.
    pub fn age(self, now: Stamp) -> Duration {
        if self.is_never() {
            return Duration::MAX;
        }
        Duration::from_secs(now.0.saturating_sub(self.0).max(0) as u64)
    }

    pub fn older_than(self, now: Stamp, limit: Duration) -> bool {
        self.age(now) > limit
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str(NEVER_TEXT);
        }
        match DateTime::<Utc>::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "{}", dt.format(FORMAT)),
            None => f.write_str(NEVER_TEXT),
        }
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// malformed stamps load as "never" rather than failing the whole document
impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Stamp::parse(&text).unwrap_or_else(|| {
            tracing::warn!("unparsable timestamp {:?} treated as never", text);
            Stamp::NEVER
        }))
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_fixed_width() {
        let stamp = Stamp::parse("20240305140709").unwrap();
        assert_eq!(stamp.to_string(), "20240305140709");
        assert_eq!(Stamp::NEVER.to_string(), "00000000000000");
    }

    #[test]
    fn rejects_wrong_width() {
        assert!(Stamp::parse("2024030514070").is_none());
        assert!(Stamp::parse("garbage").is_none());
        assert_eq!(Stamp::parse("00000000000000"), Some(Stamp::NEVER));
    }

    #[test]
    fn never_is_infinitely_old() {
        let now = Stamp::now();
        assert_eq!(Stamp::NEVER.age(now), Duration::MAX);
        assert!(Stamp::NEVER.older_than(now, Duration::from_secs(1)));
        let later = Stamp::parse("20240101000005").unwrap();
        let earlier = Stamp::parse("20240101000000").unwrap();
        assert_eq!(later.age(earlier), Duration::ZERO);
        assert_eq!(earlier.age(later), Duration::from_secs(5));
    }

    #[test]
    fn malformed_json_stamp_is_never() {
        let stamp: Stamp = serde_json::from_str("\"yesterday\"").unwrap();
        assert!(stamp.is_never());
    }
}
