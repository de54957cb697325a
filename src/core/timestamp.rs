// Casetrail - core/timestamp.rs
//
// Canonical event timestamps: UTC, second precision, one spelling.
//
// The normaliser hands us "YYYY-MM-DD HH:MM:SS". Anything chrono would
// leniently accept but that does not format back to the identical string
// (single-digit fields, trailing fractions, surrounding whitespace) is
// rejected, so every accepted timestamp round-trips byte for byte.

use crate::util::constants::CANONICAL_TIMESTAMP_FORMAT;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;

/// Why a raw timestamp string was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// chrono could not parse the string with the canonical format.
    Unparseable { raw: String, reason: String },

    /// The string parsed, but is not spelled canonically.
    NonCanonical { raw: String, canonical: String },
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unparseable { raw, reason } => write!(
                f,
                "cannot parse timestamp '{raw}' as {CANONICAL_TIMESTAMP_FORMAT}: {reason}"
            ),
            Self::NonCanonical { raw, canonical } => write!(
                f,
                "timestamp '{raw}' is not in canonical form (expected '{canonical}')"
            ),
        }
    }
}

impl std::error::Error for TimestampError {}

/// Parse a canonical timestamp string into a UTC instant.
pub fn parse_canonical(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let naive = NaiveDateTime::parse_from_str(raw, CANONICAL_TIMESTAMP_FORMAT).map_err(|e| {
        TimestampError::Unparseable {
            raw: raw.to_string(),
            reason: e.to_string(),
        }
    })?;
    let ts = naive.and_utc();
    let canonical = format_canonical(&ts);
    if canonical != raw {
        return Err(TimestampError::NonCanonical {
            raw: raw.to_string(),
            canonical,
        });
    }
    Ok(ts)
}

/// Format a UTC instant in canonical form. Sub-second precision is dropped.
pub fn format_canonical(ts: &DateTime<Utc>) -> String {
    ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string()
}

/// serde adapter: `#[serde(with = "crate::core::timestamp::canonical")]`.
pub mod canonical {
    use super::{format_canonical, parse_canonical};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_canonical(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_canonical(&raw).map_err(serde::de::Error::custom)
    }
}

/// serde adapter for optional canonical timestamps.
pub mod canonical_opt {
    use super::{format_canonical, parse_canonical};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&format_canonical(ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| parse_canonical(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}
