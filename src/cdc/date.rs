// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Polymorphic date and timestamp decoding.
//!
//! Connectors encode a `DATE` column either as a quoted `YYYY-MM-DD` string
//! or as a bare integer counting days since 1970-01-01 (UTC). The encoding is
//! told apart by the first JSON token, which is exactly what
//! `deserialize_any` dispatches on:
//!
//! ```text
//! "2025-08-10"  → visit_str  → parse
//! 20310         → visit_u64  → epoch + days
//! -1            → visit_i64  → epoch - days
//! null          → visit_unit → absent
//! anything else → error
//! ```
//!
//! # Example
//!
//! ```
//! use org_sync::cdc::date::normalize_date;
//!
//! assert_eq!(normalize_date("20310").unwrap().as_deref(), Some("2025-08-10"));
//! assert_eq!(normalize_date("\"2025-08-10\"").unwrap().as_deref(), Some("2025-08-10"));
//! assert_eq!(normalize_date("null").unwrap(), None);
//! assert!(normalize_date("20310.5").is_err());
//! ```

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use std::fmt;

use super::DecodeError;

/// Canonical date format.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d";

#[must_use]
pub fn epoch() -> NaiveDate {
    NaiveDate::default()
}

/// `1970-01-01 + days`, or `None` when outside the representable range.
#[must_use]
pub fn from_epoch_days(days: i64) -> Option<NaiveDate> {
    if days >= 0 {
        epoch().checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        epoch().checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

#[must_use]
pub fn canonical(date: &NaiveDate) -> String {
    date.format(CANONICAL_FORMAT).to_string()
}

/// Parse a strict `YYYY-MM-DD` string.
pub fn parse_canonical(s: &str) -> Option<NaiveDate> {
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, CANONICAL_FORMAT).ok()
}

/// Normalize one raw JSON date token to its canonical string.
pub fn normalize_date(raw_json: &str) -> Result<Option<String>, DecodeError> {
    let mut de = serde_json::Deserializer::from_str(raw_json);
    let date = optional_date(&mut de)?;
    de.end()?;
    Ok(date.as_ref().map(canonical))
}

struct DateVisitor;

impl<'de> Visitor<'de> for DateVisitor {
    type Value = Option<NaiveDate>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a YYYY-MM-DD string, an integer day offset from 1970-01-01, or null")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(DateVisitor)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.is_empty() {
            return Ok(None);
        }
        parse_canonical(v)
            .map(Some)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        from_epoch_days(v)
            .map(Some)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .ok()
            .and_then(from_epoch_days)
            .map(Some)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }
}

/// `deserialize_with` target for optional date fields.
pub fn optional_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DateVisitor)
}

struct TimestampVisitor;

impl<'de> Visitor<'de> for TimestampVisitor {
    type Value = Option<DateTime<Utc>>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an RFC 3339 timestamp, integer microseconds since the epoch, or null")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(TimestampVisitor)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.is_empty() {
            return Ok(None);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(v) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        // Timestamp columns without zone arrive as naive UTC
        NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| Some(naive.and_utc()))
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        DateTime::from_timestamp_micros(v)
            .map(Some)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .ok()
            .and_then(DateTime::from_timestamp_micros)
            .map(Some)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }
}

/// `deserialize_with` target for optional timestamp fields.
pub fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(TimestampVisitor)
}
