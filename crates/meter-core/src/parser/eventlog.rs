//! Event-log parsing: P.98 standard log, P.99 parameter log, the reserved
//! P.200/P.210/P.211 logs, and the F.F error register.

use std::collections::HashSet;
use tracing::{debug, warn};

use super::list::paren_groups;
use super::{MeterContext, ParseError};
use crate::meter::{DataKind, Vendor};
use crate::record::Record;
use crate::timebase;

// ---------------------------------------------------------------------------
// P.98
// ---------------------------------------------------------------------------

/// Parse the standard log.
///
/// EMH rows are `P.98(sYYMMDDhhmmss)(SSSSSSSS)()(k)…` — one record per row
/// carrying the status word. Metcom rows are
/// `P.98(sYYMMDDhhmmss)(00)()(2)(…C.11.0)()(…C.11.10)()(D1)(D2)` — two
/// records per row carrying the standard-log data values.
pub(crate) fn parse_p98(raw: &str, ctx: &MeterContext) -> Result<Vec<Record>, ParseError> {
    let mut records = Vec::new();

    for line in raw.split("\r\n").map(|l| l.trim_matches(['\r', '\n'])) {
        if !line.starts_with("P.98") {
            continue;
        }
        let groups = paren_groups(line);
        let Some(stamp) = groups.first() else {
            warn!(meter_id = %ctx.meter_id, line, "P.98 row without timestamp, dropping");
            continue;
        };
        if stamp.len() != 13 {
            warn!(meter_id = %ctx.meter_id, line, "P.98 row with bad timestamp width, dropping");
            continue;
        }
        let line_time = match timebase::parse_zsts13(stamp, ctx.zone) {
            Ok(t) => t.timestamp(),
            Err(_) => {
                warn!(meter_id = %ctx.meter_id, line, "P.98 row with unparseable timestamp, dropping");
                continue;
            }
        };

        if ctx.vendor.p98_two_values() {
            let (obis_1, obis_2) = Vendor::metcom_p98_obis();
            let (Some(d1), Some(d2)) = (
                groups.len().checked_sub(2).and_then(|i| groups.get(i)),
                groups.last(),
            ) else {
                warn!(meter_id = %ctx.meter_id, line, "P.98 row without data values, dropping");
                continue;
            };
            records.push(Record::new(obis_1, *d1).at(line_time));
            records.push(Record::new(obis_2, *d2).at(line_time));
        } else {
            let Some(status) = groups.get(1) else {
                warn!(meter_id = %ctx.meter_id, line, "P.98 row without status word, dropping");
                continue;
            };
            let obis = ctx
                .vendor
                .log_obis(DataKind::P98)
                .unwrap_or("100.0.98");
            records.push(Record::new(obis, *status).at(line_time));
        }
    }

    if !ctx.vendor.p98_two_values() {
        decollide_line_times(&mut records);
    }
    Ok(records)
}

/// Two log events can share a second; bump duplicates forward until every
/// record has a distinct line time (the relational sink keys on it).
fn decollide_line_times(records: &mut [Record]) {
    let mut seen: HashSet<i64> = HashSet::new();
    for record in records {
        if let Some(mut t) = record.line_time {
            while !seen.insert(t) {
                t += 1;
            }
            record.line_time = Some(t);
        }
    }
}

// ---------------------------------------------------------------------------
// P.99
// ---------------------------------------------------------------------------

/// Parse the parameter-change log: the 32-bit status word becomes one
/// record per bit, LSB first.
pub(crate) fn parse_p99(raw: &str, ctx: &MeterContext) -> Result<Vec<Record>, ParseError> {
    let line = raw
        .split("\r\n")
        .map(|l| l.trim_matches(['\r', '\n']))
        .find(|l| l.starts_with("P.99"))
        .ok_or_else(|| ParseError::Malformed(format!("no P.99 entry in reply: {raw:?}")))?;
    let records = parse_p99_line(line, ctx);
    if records.is_empty() {
        return Err(ParseError::Malformed(format!("unparseable P.99 entry: {line:?}")));
    }
    Ok(records)
}

/// Decode a single P.99 line into its 32 bit records. Returns an empty list
/// when the status word does not decode (callers treat that as a dropped
/// row when the line was embedded in a readout).
pub(crate) fn parse_p99_line(line: &str, ctx: &MeterContext) -> Vec<Record> {
    let groups = paren_groups(line);
    let Some(status) = groups.get(1) else {
        warn!(meter_id = %ctx.meter_id, line, "P.99 entry without status word");
        return Vec::new();
    };
    let Ok(word) = u32::from_str_radix(status.trim(), 16) else {
        warn!(meter_id = %ctx.meter_id, line, status, "P.99 status word is not hex");
        return Vec::new();
    };
    debug!(meter_id = %ctx.meter_id, status = %status, "P.99 status word");

    (0..32)
        .map(|bit| {
            Record::new(
                format!("p99_bit{bit}"),
                if word >> bit & 1 == 1 { "1" } else { "0" },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// P.200 / P.210 / P.211
// ---------------------------------------------------------------------------

/// Reserved logs: decode the header timestamp where present and ship each
/// row as one opaque record under the family's log OBIS.
pub(crate) fn parse_opaque_log(
    raw: &str,
    kind: DataKind,
    ctx: &MeterContext,
) -> Result<Vec<Record>, ParseError> {
    let tag = kind
        .command_tag()
        .ok_or_else(|| ParseError::UnknownKind(kind.to_string()))?;
    let obis = ctx
        .vendor
        .log_obis(kind)
        .ok_or_else(|| ParseError::UnknownKind(kind.to_string()))?;

    let mut records = Vec::new();
    for line in raw.split("\r\n").map(|l| l.trim_matches(['\r', '\n'])) {
        if !line.starts_with(tag) {
            continue;
        }
        let line_time = paren_groups(line)
            .first()
            .filter(|stamp| stamp.len() == 13)
            .and_then(|stamp| timebase::parse_zsts13(stamp, ctx.zone).ok())
            .map(|t| t.timestamp());
        let mut record = Record::new(obis, line);
        record.line_time = line_time;
        records.push(record);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// F.F error register
// ---------------------------------------------------------------------------

/// Parse the error register readout: the `F.F(XXXXXXXX)` line yields one
/// record with unit `log`.
pub(crate) fn parse_error_register(raw: &str) -> Result<Vec<Record>, ParseError> {
    let line = raw
        .split("\r\n")
        .map(|l| l.trim_matches(['\r', '\n']))
        .find(|l| l.starts_with("F.F"))
        .ok_or_else(|| ParseError::Malformed(format!("no F.F register in reply: {raw:?}")))?;
    let word = paren_groups(line)
        .first()
        .copied()
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ParseError::Malformed(format!("unparseable F.F register: {line:?}")))?;
    Ok(vec![Record::new("F.F", word).with_unit("log")])
}
