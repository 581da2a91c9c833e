//! Table-level operations on the SQLite store

pub mod event_streams;
pub mod transactions;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

/// Timestamps are stored as fixed-width RFC 3339 text so that lexicographic
/// SQL comparisons match chronological order; nanosecond precision keeps the
/// round trip exact
pub(crate) fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        Some(s) => parse_ts(idx, &s).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<T>> {
    match s {
        Some(s) => parse_json(idx, &s).map(Some),
        None => Ok(None),
    }
}
