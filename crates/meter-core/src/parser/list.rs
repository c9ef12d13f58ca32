//! Table-readout (list) parsing: one record per data-set line.

use tracing::{debug, warn};

use super::{Blocks, MeterContext, ParseError, eventlog, find_blocks, profile};
use crate::record::Record;

/// Maximum field widths from the dataset grammar.
const MAX_ADDRESS: usize = 16;
const MAX_VALUE: usize = 32;
const MAX_UNIT: usize = 16;

/// Why a single line produced no record. Only `Malformed` is worth a log
/// line; historical rows are skipped by design.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RowFault {
    /// `*NN` tariff suffix on the address — a historical value.
    Historical,
    Malformed(&'static str),
}

/// Parse every block of a readout body: plain data-set lines plus any
/// embedded load-profile block or P.99 line the meter streamed along.
pub(crate) fn parse_list(raw: &str, ctx: &MeterContext) -> Result<Vec<Record>, ParseError> {
    let Blocks { list, profile: profile_lines, p99 } = find_blocks(raw);

    let mut records = Vec::new();
    for line in list {
        match parse_data_set(line) {
            Ok(record) => records.push(record),
            Err(RowFault::Historical) => {
                debug!(meter_id = %ctx.meter_id, line, "skipping historical value");
            }
            Err(RowFault::Malformed(reason)) => {
                warn!(meter_id = %ctx.meter_id, line, reason, "dropping malformed data set");
            }
        }
    }
    if !profile_lines.is_empty() {
        // A bad embedded block must not cost the data-set lines already
        // decoded from the same readout.
        match profile::parse_profile_lines(&profile_lines, ctx) {
            Ok(rows) => records.extend(rows),
            Err(e) => {
                warn!(meter_id = %ctx.meter_id, error = %e, "embedded profile block dropped");
            }
        }
    }
    if let Some(line) = p99 {
        records.extend(eventlog::parse_p99_line(line, ctx));
    }
    Ok(records)
}

/// Decode one `address(value[*unit])[(…)…]` line.
///
/// The address keeps only the last colon-suffixed tail (`1-0:1.8.0` →
/// `1.8.0`). The first parenthesis group carries the value and optional
/// unit; trailing groups (timestamps on maximum-demand lines) are ignored.
pub(crate) fn parse_data_set(line: &str) -> Result<Record, RowFault> {
    let open = line.find('(').ok_or(RowFault::Malformed("no value field"))?;
    let address = normalize_address(&line[..open])?;
    if address.contains('*') {
        return Err(RowFault::Historical);
    }

    let groups = paren_groups(&line[open..]);
    let first = *groups.first().ok_or(RowFault::Malformed("no value field"))?;

    // Numeric value, optionally `value*unit`, is the preferred form.
    let (value_part, unit_part) = match first.split_once('*') {
        Some((v, u)) => (v, Some(u)),
        None => (first, None),
    };
    if is_numeric_value(value_part) {
        let unit = match unit_part {
            Some(u) => Some(validate_unit(u)?.to_owned()),
            None => None,
        };
        if value_part.len() > MAX_VALUE {
            return Err(RowFault::Malformed("value too long"));
        }
        return Ok(Record {
            obis: address.to_owned(),
            value: value_part.to_owned(),
            unit,
            line_time: None,
        });
    }

    // Alphanumeric fallback: a single group of word characters ending the
    // line (serial numbers, firmware ids, status words).
    if groups.len() == 1
        && line.trim_end().ends_with(')')
        && !first.is_empty()
        && first.len() <= MAX_VALUE
        && first.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Ok(Record {
            obis: address.to_owned(),
            value: first.to_owned(),
            unit: None,
            line_time: None,
        });
    }

    Err(RowFault::Malformed("unparseable value"))
}

/// Keep the last colon-suffixed tail and validate the dataset address
/// charset. `..` and `/` mark a corrupt address.
fn normalize_address(address: &str) -> Result<&str, RowFault> {
    let tail = match address.rsplit_once(':') {
        Some((_, tail)) => tail,
        None => address,
    };
    if tail.is_empty() || tail.len() > MAX_ADDRESS {
        return Err(RowFault::Malformed("bad address length"));
    }
    if tail.contains("..") || tail.contains('/') {
        return Err(RowFault::Malformed("corrupt address"));
    }
    if tail
        .chars()
        .any(|c| !c.is_ascii_graphic() || matches!(c, '(' | ')' | '!' | '#'))
    {
        return Err(RowFault::Malformed("bad address character"));
    }
    Ok(tail)
}

fn validate_unit(unit: &str) -> Result<&str, RowFault> {
    if unit.is_empty() || unit.len() > MAX_UNIT {
        return Err(RowFault::Malformed("bad unit length"));
    }
    if unit
        .chars()
        .any(|c| !c.is_ascii_graphic() || matches!(c, '(' | ')' | '/' | '!'))
    {
        return Err(RowFault::Malformed("bad unit character"));
    }
    Ok(unit)
}

/// `-?digits[.digits]` — decimal values use a point, never a comma.
fn is_numeric_value(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() {
        return false;
    }
    match digits.split_once('.') {
        Some((int, frac)) => {
            !int.is_empty()
                && int.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c.is_ascii_digit())
        }
        None => digits.chars().all(|c| c.is_ascii_digit()),
    }
}

/// Contents of the successive `(..)` groups of a line.
pub(crate) fn paren_groups(rest: &str) -> Vec<&str> {
    let mut groups = Vec::new();
    let mut remaining = rest;
    while let Some(open) = remaining.find('(') {
        let Some(close_rel) = remaining[open..].find(')') else {
            break;
        };
        groups.push(&remaining[open + 1..open + close_rel]);
        remaining = &remaining[open + close_rel + 1..];
    }
    groups
}
