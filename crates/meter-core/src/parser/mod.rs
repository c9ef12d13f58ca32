//! Reply-body parser for the COSEM/OBIS dataset grammar.
//!
//! Input is the decoded ASCII body of a meter reply — parity bits and frame
//! delimiters already stripped by the framer. The parser splits the body
//! into blocks (plain data-set lines, multi-line load profiles, event-log
//! entries), decodes each into OBIS-tagged [`Record`]s, and normalizes the
//! embedded timestamps to UTC.
//!
//! Malformed rows are logged and dropped. A bad profile-block header (an
//! unsupported value count, a garbled field) is fatal for that block only:
//! parsing stops there and rows from earlier blocks in the same reply are
//! kept — unless nothing was decoded yet, in which case the fault
//! surfaces. An unknown timezone fails the whole parse.

mod eventlog;
mod list;
mod profile;

use chrono::FixedOffset;
use thiserror::Error;

use crate::meter::{DataKind, MeterDescriptor, Vendor};
use crate::record::Record;
use crate::timebase;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser for data kind {0:?}")]
    UnknownKind(String),
    #[error("unsupported value count z={0} (expected 6 or 8)")]
    UnsupportedCount(u32),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("bad timestamp {0:?}")]
    BadTimestamp(String),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// MeterContext
// ---------------------------------------------------------------------------

/// The per-meter facts the parser needs. Plain data, so parsing stays a
/// pure function of (raw bytes, context).
#[derive(Debug, Clone)]
pub struct MeterContext {
    pub meter_id: String,
    pub vendor: Vendor,
    pub zone: FixedOffset,
}

impl MeterContext {
    pub fn for_meter(meter: &MeterDescriptor) -> Result<MeterContext, ParseError> {
        Ok(MeterContext {
            meter_id: meter.meter_id.clone(),
            vendor: meter.vendor(),
            zone: timebase::zone_offset(meter.zone_name())?,
        })
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Decode a reply body into records for the given data kind.
pub fn parse(raw: &str, kind: DataKind, ctx: &MeterContext) -> Result<Vec<Record>, ParseError> {
    match kind {
        DataKind::List1 | DataKind::List2 | DataKind::List3 | DataKind::List4 => {
            list::parse_list(raw, ctx)
        }
        DataKind::P01 | DataKind::P02 => profile::parse_profile(raw, ctx),
        DataKind::P98 => eventlog::parse_p98(raw, ctx),
        DataKind::P99 => eventlog::parse_p99(raw, ctx),
        DataKind::P200 | DataKind::P210 | DataKind::P211 => {
            eventlog::parse_opaque_log(raw, kind, ctx)
        }
        DataKind::Error => eventlog::parse_error_register(raw),
    }
}

// ---------------------------------------------------------------------------
// Block discovery
// ---------------------------------------------------------------------------

/// Load-profile header tags (the `P.0x`/`P.10` family).
pub(crate) const PROFILE_TAGS: [&str; 10] = [
    "P.01", "P.02", "P.03", "P.04", "P.05", "P.06", "P.07", "P.08", "P.09", "P.10",
];

pub(crate) fn is_profile_header(line: &str) -> bool {
    PROFILE_TAGS.iter().any(|tag| line.starts_with(tag))
}

/// The blocks discovered in a readout body.
#[derive(Debug, Default)]
pub(crate) struct Blocks<'a> {
    /// Plain `address(value[*unit])` data-set lines.
    pub list: Vec<&'a str>,
    /// Lines of an embedded load-profile block (header + data rows).
    pub profile: Vec<&'a str>,
    /// An embedded P.99 parameter-change line.
    pub p99: Option<&'a str>,
}

/// Split a readout body into blocks.
///
/// Skips the leading identification line (starts with `/`), stops at the
/// end-of-message marker (a line shorter than five characters containing
/// `!`), and classifies the rest. Lines that fit no block are ignored.
pub(crate) fn find_blocks(raw: &str) -> Blocks<'_> {
    let mut blocks = Blocks::default();
    let mut in_profile = false;

    for line in raw.split("\r\n").map(|l| l.trim_matches(['\r', '\n'])) {
        if line.starts_with('/') {
            continue;
        }
        if line.len() < 5 && line.contains('!') {
            break;
        }
        if line.starts_with("P.99") {
            blocks.p99 = Some(line);
            in_profile = false;
        } else if in_profile || is_profile_header(line) {
            in_profile = true;
            blocks.profile.push(line);
        } else if looks_like_data_set(line) {
            blocks.list.push(line);
        }
    }
    blocks
}

/// Rough data-set shape check: an address made of word characters and dots
/// (optionally with a `A-B:` prefix) followed by at least one `(..)` group.
fn looks_like_data_set(line: &str) -> bool {
    let Some(open) = line.find('(') else {
        return false;
    };
    if !line[open..].contains(')') {
        return false;
    }
    let address = match line[..open].rsplit_once(':') {
        Some((prefix, tail)) => {
            if prefix.is_empty() {
                return false;
            }
            tail
        }
        None => &line[..open],
    };
    let mut chars = address.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    address.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_skip_ident_and_stop_at_end_marker() {
        let raw = "/MCS5\\@V0050710000051\r\nF.F(00000000)\r\n1.8.0(01281.6601*kWh)\r\n!\r\ngarbage(1)\r\n";
        let blocks = find_blocks(raw);
        assert_eq!(blocks.list, vec!["F.F(00000000)", "1.8.0(01281.6601*kWh)"]);
        assert!(blocks.profile.is_empty());
        assert!(blocks.p99.is_none());
    }

    #[test]
    fn blocks_collect_embedded_profile_and_p99() {
        let raw = "8.8.0(00008.423*kvarh)\r\nP.99(1201021132243)(00002000)()(0)\r\nP.01(1220823161500)(00000000)(15)(6)(1.5)(kW)(2.5)(kW)(5.5)(kvar)(6.5)(kvar)(7.5)(kvar)(8.5)(kvar)\r\n(0.1)(0.2)(0.3)(0.4)(0.5)(0.6)\r\n!\r\n";
        let blocks = find_blocks(raw);
        assert_eq!(blocks.list.len(), 1);
        assert_eq!(blocks.profile.len(), 2);
        assert!(blocks.p99.is_some());
    }

    #[test]
    fn data_set_shape_check() {
        assert!(looks_like_data_set("1.8.0(01281.6601*kWh)"));
        assert!(looks_like_data_set("1-0:31.7.0(2.414*A)"));
        assert!(looks_like_data_set("C.90.2(70D4EF6C)"));
        assert!(!looks_like_data_set("(0.00063)(0.00000)"));
        assert!(!looks_like_data_set("!"));
        assert!(!looks_like_data_set("no parens here"));
    }
}
