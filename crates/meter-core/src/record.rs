//! Parser output records and the sink batch key.

use crate::meter::DataKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One OBIS-tagged value decoded from a meter reply.
///
/// Values keep the source precision verbatim (strings, decimal point per the
/// dataset grammar). `line_time` is the absolute instant of a profile or
/// event-log row, in seconds since the Unix epoch (UTC); plain table rows
/// carry no line time and are stamped with the dispatch instant downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "id")]
    pub obis: String,
    pub value: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_time: Option<i64>,
}

impl Record {
    pub fn new(obis: impl Into<String>, value: impl Into<String>) -> Record {
        Record {
            obis: obis.into(),
            value: value.into(),
            unit: None,
            line_time: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Record {
        self.unit = Some(unit.into());
        self
    }

    pub fn at(mut self, line_time: i64) -> Record {
        self.line_time = Some(line_time);
        self
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.unit, self.line_time) {
            (Some(unit), Some(t)) => write!(f, "{}={} {} @{}", self.obis, self.value, unit, t),
            (Some(unit), None) => write!(f, "{}={} {}", self.obis, self.value, unit),
            (None, Some(t)) => write!(f, "{}={} @{}", self.obis, self.value, t),
            (None, None) => write!(f, "{}={}", self.obis, self.value),
        }
    }
}

/// Sink key for one session's batch of records.
///
/// Rendered as `{org}:{meter_id}_{dispatched_at}:{kind}` — the staging key
/// format the downstream movers expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Organization, always lowercase.
    pub org: String,
    pub meter_id: String,
    /// Wall clock of dispatch, unix seconds.
    pub dispatched_at: i64,
    pub kind: DataKind,
}

impl BatchKey {
    pub fn new(org: &str, meter_id: &str, dispatched_at: i64, kind: DataKind) -> BatchKey {
        BatchKey {
            org: org.to_lowercase(),
            meter_id: meter_id.to_owned(),
            dispatched_at,
            kind,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}_{}:{}",
            self.org,
            self.meter_id,
            self.dispatched_at,
            self.kind.as_str()
        )
    }
}
