use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// WindowDuration
// ---------------------------------------------------------------------------

const WEEK: u64 = 604_800;
const DAY: u64 = 86_400;
const HOUR: u64 = 3_600;
const MINUTE: u64 = 60;

/// A duration parsed from a window literal like `"30s"`, `"5m"`, `"1h"`, `"7d"`, `"2w"`.
///
/// The grammar is anchored: exactly one decimal number followed by exactly one
/// unit suffix. No whitespace, no sign, no fractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowDuration(Duration);

impl WindowDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl From<WindowDuration> for Duration {
    fn from(wd: WindowDuration) -> Self {
        wd.0
    }
}

impl From<Duration> for WindowDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// Rejection of a window literal that does not match `^\d+(s|m|h|d|w)$`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration literal {input:?}: {reason}")]
pub struct DurationFormatError {
    pub input: String,
    pub reason: &'static str,
}

impl DurationFormatError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl FromStr for WindowDuration {
    type Err = DurationFormatError;

    fn from_str(s: &str) -> Result<Self, DurationFormatError> {
        if s.is_empty() {
            return Err(DurationFormatError::new(s, "empty string"));
        }

        let idx = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| DurationFormatError::new(s, "missing unit suffix"))?;
        if idx == 0 {
            return Err(DurationFormatError::new(s, "missing numeric part"));
        }

        let (num_part, suffix) = (&s[..idx], &s[idx..]);
        let value: u64 = num_part
            .parse()
            .map_err(|_| DurationFormatError::new(s, "numeric part out of range"))?;

        let unit = match suffix {
            "s" => 1,
            "m" => MINUTE,
            "h" => HOUR,
            "d" => DAY,
            "w" => WEEK,
            _ => return Err(DurationFormatError::new(s, "unknown unit (expected s/m/h/d/w)")),
        };

        let secs = value
            .checked_mul(unit)
            .ok_or_else(|| DurationFormatError::new(s, "duration overflows"))?;

        Ok(Self(Duration::from_secs(secs)))
    }
}

impl fmt::Display for WindowDuration {
    /// Canonical form: the largest unit that divides the value evenly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs == 0 {
            return write!(f, "0s");
        }
        if secs.is_multiple_of(WEEK) {
            write!(f, "{}w", secs / WEEK)
        } else if secs.is_multiple_of(DAY) {
            write!(f, "{}d", secs / DAY)
        } else if secs.is_multiple_of(HOUR) {
            write!(f, "{}h", secs / HOUR)
        } else if secs.is_multiple_of(MINUTE) {
            write!(f, "{}m", secs / MINUTE)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for WindowDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WindowDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
