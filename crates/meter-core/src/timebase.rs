//! Meter-local timestamp handling.
//!
//! Meters render every timestamp in their configured local zone. The fleet
//! maps zone names to fixed offsets through a lookup table — the meters
//! themselves never apply DST transitions mid-window, and the season flag in
//! `ZSTs13` stamps is ignored by contract; the configured zone is
//! authoritative. Unknown zone names are fatal for the affected meter.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::parser::ParseError;

/// Zone-name → fixed offset table (seconds east of UTC).
///
/// Extend here when a roster grows a new zone; a missing entry fails the
/// meter loudly instead of shipping rows with shifted timestamps.
const ZONE_OFFSETS: &[(&str, i32)] = &[
    ("CET", 2 * 3600),
    ("CEST", 2 * 3600),
    ("Europe/Berlin", 2 * 3600),
    ("Europe/Vienna", 2 * 3600),
    ("Europe/Prague", 2 * 3600),
    ("Europe/Zurich", 2 * 3600),
    ("UTC", 0),
    ("Etc/UTC", 0),
];

/// Resolve a zone name to its fixed offset.
///
/// Accepts table entries plus literal `+HH:MM` / `-HH:MM` / `+HHMM` forms.
pub fn zone_offset(name: &str) -> Result<FixedOffset, ParseError> {
    if let Some((_, secs)) = ZONE_OFFSETS.iter().find(|(n, _)| *n == name) {
        return FixedOffset::east_opt(*secs)
            .ok_or_else(|| ParseError::UnknownTimezone(name.to_owned()));
    }
    if let Some(offset) = parse_literal_offset(name) {
        return Ok(offset);
    }
    Err(ParseError::UnknownTimezone(name.to_owned()))
}

fn parse_literal_offset(name: &str) -> Option<FixedOffset> {
    let (sign, rest) = match name.as_bytes().first()? {
        b'+' => (1, &name[1..]),
        b'-' => (-1, &name[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse a `ZSTs13` profile stamp: season flag + `YYMMDDhhmmss`.
///
/// The season flag is read and discarded.
pub fn parse_zsts13(field: &str, zone: FixedOffset) -> Result<DateTime<Utc>, ParseError> {
    let trimmed = field.trim();
    if trimmed.len() != 13 {
        return Err(ParseError::BadTimestamp(field.to_owned()));
    }
    parse_log_stamp(&trimmed[1..], zone)
}

/// Parse a 12-digit `YYMMDDhhmmss` stamp in the meter's zone.
pub fn parse_log_stamp(digits: &str, zone: FixedOffset) -> Result<DateTime<Utc>, ParseError> {
    let naive = NaiveDateTime::parse_from_str(digits, "%y%m%d%H%M%S")
        .map_err(|_| ParseError::BadTimestamp(digits.to_owned()))?;
    zone.from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ParseError::BadTimestamp(digits.to_owned()))
}

/// Render the `from` bound of a time-window command: `0YYMMDDhhmm` in the
/// meter's zone (leading `0` is the season flag the meter ignores).
pub fn render_from_bound(instant: DateTime<Utc>, zone: FixedOffset) -> String {
    format!("0{}", instant.with_timezone(&zone).format("%y%m%d%H%M"))
}

/// Parse a rendered `from` bound back to an instant (minute precision).
pub fn parse_from_bound(field: &str, zone: FixedOffset) -> Result<DateTime<Utc>, ParseError> {
    let trimmed = field.trim();
    if trimmed.len() != 11 {
        return Err(ParseError::BadTimestamp(field.to_owned()));
    }
    let naive = NaiveDateTime::parse_from_str(&format!("{}00", &trimmed[1..]), "%y%m%d%H%M%S")
        .map_err(|_| ParseError::BadTimestamp(field.to_owned()))?;
    zone.from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ParseError::BadTimestamp(field.to_owned()))
}
