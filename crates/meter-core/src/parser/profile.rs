//! Load-profile block parsing (P.01/P.02 family).
//!
//! Block form:
//! ```text
//! KZ(ZSTs13)(S)(RP)(z)(K1)(E1)..(Kz)(Ez)
//! (Mw1)...(Mwz)
//! (Mw1)...(Mwz)
//! ```
//! The header's `ZSTs13` stamps the first data row; row `i` is
//! `zsts13 + i * RP` minutes. A body may repeat the header when the meter
//! splits the window into several blocks.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::list::paren_groups;
use super::{MeterContext, ParseError, is_profile_header};
use crate::record::Record;
use crate::timebase;

/// Decoded profile-block header.
struct BlockHeader {
    start: DateTime<Utc>,
    /// Registration period.
    period: Duration,
    /// Values per row (z).
    count: usize,
    ids: Vec<String>,
    units: Vec<String>,
    row: usize,
}

pub(crate) fn parse_profile(raw: &str, ctx: &MeterContext) -> Result<Vec<Record>, ParseError> {
    let lines: Vec<&str> = raw
        .split('\n')
        .map(|l| l.trim_matches(['\r', '\n']))
        .collect();
    parse_profile_lines(&lines, ctx)
}

/// Parse a sequence of profile lines (headers and data rows).
pub(crate) fn parse_profile_lines(
    lines: &[&str],
    ctx: &MeterContext,
) -> Result<Vec<Record>, ParseError> {
    let mut records = Vec::new();
    let mut header: Option<BlockHeader> = None;

    for line in lines {
        let line = line.trim_matches(['\r', '\n']);
        if is_profile_header(line) {
            match parse_header(line, ctx) {
                Ok(hdr) => header = Some(hdr),
                // A bad header is fatal for its block only: rows already
                // decoded from earlier blocks in the same reply survive.
                // With nothing collected yet there is nothing to save, so
                // the fault surfaces.
                Err(e) if records.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        meter_id = %ctx.meter_id,
                        line,
                        error = %e,
                        "malformed profile header, keeping earlier blocks"
                    );
                    break;
                }
            }
            continue;
        }
        if line.len() < 2 {
            // End of message (or the bare `!` terminator line).
            debug!(meter_id = %ctx.meter_id, line, "short line, end of profile data");
            break;
        }
        let Some(hdr) = header.as_mut() else {
            warn!(meter_id = %ctx.meter_id, line, "profile data row before any header, dropping");
            continue;
        };

        let values = paren_groups(line);
        if values.len() < hdr.count {
            // A truncated trailing row (Tr timeout mid-stream) ends the
            // block cleanly; everything before it is good data.
            debug!(
                meter_id = %ctx.meter_id,
                expected = hdr.count,
                found = values.len(),
                "incomplete trailing profile row, terminating block"
            );
            break;
        }
        if values.len() > hdr.count {
            warn!(
                meter_id = %ctx.meter_id,
                expected = hdr.count,
                found = values.len(),
                line,
                "profile row with excess values, dropping"
            );
            continue;
        }

        let line_time = hdr.start + hdr.period * i32::try_from(hdr.row).unwrap_or(i32::MAX);
        for (i, value) in values.iter().enumerate() {
            let value = value.trim();
            if !is_profile_value(value) {
                warn!(
                    meter_id = %ctx.meter_id,
                    obis = %hdr.ids[i],
                    value,
                    "non-numeric profile cell, skipping"
                );
                continue;
            }
            records.push(Record {
                obis: hdr.ids[i].clone(),
                value: value.to_owned(),
                unit: Some(hdr.units[i].clone()).filter(|u| !u.is_empty()),
                line_time: Some(line_time.timestamp()),
            });
        }
        hdr.row += 1;
    }
    Ok(records)
}

/// Decode `KZ(ZSTs13)(S)(RP)(z)(K1)(E1)..(Kz)(Ez)`.
fn parse_header(line: &str, ctx: &MeterContext) -> Result<BlockHeader, ParseError> {
    let groups = paren_groups(line);
    if groups.len() < 4 {
        return Err(ParseError::Malformed(format!(
            "profile header with {} fields: {line:?}",
            groups.len()
        )));
    }

    let start = timebase::parse_zsts13(groups[0], ctx.zone)?;

    // Status word: Metcom sends decimal, EMH ASCII hex. Kept as a string,
    // normalized to the 8-bit binary form for the decimal flavor.
    let status = if ctx.vendor.profile_status_is_decimal() {
        match groups[1].trim().parse::<u32>() {
            Ok(s) => format!("{s:08b}"),
            Err(_) => groups[1].trim().to_owned(),
        }
    } else {
        groups[1].trim().to_owned()
    };

    let period_minutes: i64 = groups[2]
        .trim()
        .parse()
        .map_err(|_| ParseError::Malformed(format!("bad registration period {:?}", groups[2])))?;

    let count: u32 = groups[3]
        .trim()
        .parse()
        .map_err(|_| ParseError::Malformed(format!("bad value count {:?}", groups[3])))?;
    if count != 6 && count != 8 {
        return Err(ParseError::UnsupportedCount(count));
    }
    let count = count as usize;

    let mut ids = Vec::with_capacity(count);
    let mut units = Vec::with_capacity(count);
    for i in 0..count {
        let id = groups
            .get(4 + 2 * i)
            .ok_or_else(|| ParseError::Malformed(format!("profile header truncated: {line:?}")))?;
        let unit = groups.get(5 + 2 * i).copied().unwrap_or("");
        // Identifier tails only, without the medium/channel prefix.
        let tail = match id.trim().rsplit_once(':') {
            Some((_, tail)) => tail,
            None => id.trim(),
        };
        ids.push(tail.to_owned());
        units.push(unit.trim().to_owned());
    }

    debug!(
        meter_id = %ctx.meter_id,
        start = %start,
        status = %status,
        period_minutes,
        count,
        "profile block header"
    );

    Ok(BlockHeader {
        start,
        period: Duration::minutes(period_minutes),
        count,
        ids,
        units,
        row: 0,
    })
}

/// Measured values are plain `digits.digits` decimals; anything else is a
/// marker for a missing or invalid cell.
fn is_profile_value(s: &str) -> bool {
    match s.split_once('.') {
        Some((int, frac)) => {
            !int.is_empty()
                && !frac.is_empty()
                && int.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
