//! Timestamp handling: FILETIME conversion and the canonical table format.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_DIFF: i128 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i128 = 10_000_000;

/// Convert a Windows FILETIME to `DateTime<Utc>`, keeping 100ns precision
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let ticks = filetime as i128 - FILETIME_EPOCH_DIFF;
    let secs = i64::try_from(ticks.div_euclid(TICKS_PER_SECOND)).ok()?;
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Render a key last-write time the way decoded records carry it:
/// `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
pub fn format_key_timestamp(filetime: u64) -> String {
    filetime_to_datetime(filetime)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, false))
        .unwrap_or_default()
}

/// Reformat an ISO-8601-like timestamp into `YYYY-MM-DD T-HH:MM:SS`
///
/// The date/time separator becomes ` T-`, fractional seconds and any zone
/// suffix are cut off (not rounded). Returns `None` when there is no `T`
/// separator, in which case the caller keeps the raw value.
pub fn canonical_timestamp(raw: &str) -> Option<String> {
    let (date, time) = raw.split_once('T')?;
    let time = match time.find('.') {
        Some(dot) => &time[..dot],
        None => strip_zone_suffix(time),
    };
    Some(format!("{} T-{}", date, time))
}

fn strip_zone_suffix(time: &str) -> &str {
    if let Some(stripped) = time.strip_suffix('Z') {
        return stripped;
    }
    match time.find(['+', '-']) {
        Some(pos) => &time[..pos],
        None => time,
    }
}

/// Whether a value already has the exact canonical shape
pub fn is_canonical(formatted: &str) -> bool {
    static CANONICAL: OnceLock<Regex> = OnceLock::new();
    CANONICAL
        .get_or_init(|| {
            Regex::new(r"^\d{4}-\d{2}-\d{2} T-\d{2}:\d{2}:\d{2}$").expect("valid timestamp pattern")
        })
        .is_match(formatted)
}
