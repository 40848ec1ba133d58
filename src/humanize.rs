//! Human-readable sizes and durations for configuration values
//!
//! Both types accept either a bare integer (bytes / milliseconds) or a
//! string with a unit suffix, so TOML and environment overrides can say
//! `chunk_size = "1KB"` or `BULKFETCH__ENGINE__REQUEST_TIMEOUT=20s`.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty value")]
    Empty,

    #[error("invalid number in '{0}'")]
    InvalidNumber(String),

    #[error("unknown unit '{unit}' in '{input}'")]
    InvalidUnit { input: String, unit: String },

    #[error("value overflows: {0}")]
    Overflow(String),
}

/// Splits `"20s"` into `(20, "s")`. A bare number yields an empty unit.
fn split_unit(input: &str) -> Result<(u64, String), ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let pos = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(pos);

    let value = digits
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidNumber(trimmed.to_string()))?;

    Ok((value, unit.trim().to_ascii_lowercase()))
}

/// Byte count, e.g. a streaming chunk size
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_unit(s)?;

        let multiplier: u64 = match unit.as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1 << 10,
            "m" | "mb" | "mib" => 1 << 20,
            "g" | "gb" | "gib" => 1 << 30,
            _ => {
                return Err(ParseError::InvalidUnit {
                    input: s.to_string(),
                    unit,
                });
            }
        };

        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];

        for (unit, size) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Duration with a unit suffix: `ms`, `s`, `m` or `h`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for HumanDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_unit(s)?;

        let millis_per_unit: u64 = match unit.as_str() {
            "" | "ms" => 1,
            "s" | "sec" | "secs" => 1_000,
            "m" | "min" | "mins" => 60_000,
            "h" => 3_600_000,
            _ => {
                return Err(ParseError::InvalidUnit {
                    input: s.to_string(),
                    unit,
                });
            }
        };

        value
            .checked_mul(millis_per_unit)
            .map(HumanDuration::from_millis)
            .ok_or_else(|| ParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms != 0 && ms % 1_000 == 0 {
            write!(f, "{}s", ms / 1_000)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accepts `1024` as well as `"1KB"` for any `FromStr` value type.
macro_rules! deserialize_human {
    ($ty:ty, $expecting:literal, $from_int:expr) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct HumanVisitor;

                impl<'de> serde::de::Visitor<'de> for HumanVisitor {
                    type Value = $ty;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                        Ok($from_int(v))
                    }

                    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                        u64::try_from(v)
                            .map($from_int)
                            .map_err(|_| E::custom("value must not be negative"))
                    }

                    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse::<$ty>().map_err(E::custom)
                    }
                }

                deserializer.deserialize_any(HumanVisitor)
            }
        }
    };
}

deserialize_human!(ByteSize, "a byte size such as \"1KB\" or an integer", ByteSize);
deserialize_human!(
    HumanDuration,
    "a duration such as \"500ms\", \"20s\" or integer milliseconds",
    HumanDuration::from_millis
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_sizes() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("1KB".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("64 kib".parse::<ByteSize>().unwrap(), ByteSize(64 * 1024));
        assert_eq!("2M".parse::<ByteSize>().unwrap(), ByteSize(2 * 1024 * 1024));
    }

    #[test]
    fn test_parse_byte_size_rejects_unknown_unit() {
        let err = "3XB".parse::<ByteSize>().unwrap_err();
        assert!(matches!(err, ParseError::InvalidUnit { .. }));
        assert_eq!("".parse::<ByteSize>().unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(
            "500ms".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_millis(500)
        );
        assert_eq!(
            "20s".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(20)
        );
        assert_eq!(
            "2m".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(120)
        );
        assert_eq!(
            "750".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteSize(1024).to_string(), "1KB");
        assert_eq!(ByteSize(1500).to_string(), "1500B");
        assert_eq!(HumanDuration::from_secs(20).to_string(), "20s");
        assert_eq!(HumanDuration::from_millis(500).to_string(), "500ms");
    }

    #[test]
    fn test_deserialize_from_json() {
        #[derive(Deserialize)]
        struct Sample {
            chunk: ByteSize,
            timeout: HumanDuration,
        }

        let parsed: Sample = serde_json::from_str(r#"{"chunk": "4KB", "timeout": 2000}"#).unwrap();
        assert_eq!(parsed.chunk.as_u64(), 4096);
        assert_eq!(parsed.timeout.as_duration(), Duration::from_secs(2));
    }
}
