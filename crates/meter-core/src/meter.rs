//! Meter descriptors, vendor families, and the polled data kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::parser::ParseError;

// ---------------------------------------------------------------------------
// DataKind
// ---------------------------------------------------------------------------

/// The data structures a meter can be polled for.
///
/// Each kind has its own polling interval on the meter descriptor; an
/// interval of zero disables the kind for that meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    List1,
    List2,
    List3,
    List4,
    P01,
    P02,
    P98,
    P99,
    P200,
    P210,
    P211,
    Error,
}

impl DataKind {
    pub const ALL: [DataKind; 12] = [
        DataKind::List1,
        DataKind::List2,
        DataKind::List3,
        DataKind::List4,
        DataKind::P01,
        DataKind::P02,
        DataKind::P98,
        DataKind::P99,
        DataKind::P200,
        DataKind::P210,
        DataKind::P211,
        DataKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::List1 => "list1",
            DataKind::List2 => "list2",
            DataKind::List3 => "list3",
            DataKind::List4 => "list4",
            DataKind::P01 => "p01",
            DataKind::P02 => "p02",
            DataKind::P98 => "p98",
            DataKind::P99 => "p99",
            DataKind::P200 => "p200",
            DataKind::P210 => "p210",
            DataKind::P211 => "p211",
            DataKind::Error => "error",
        }
    }

    /// Selector digit for the readout request `/{digit}<id>!`.
    ///
    /// Table 1 is requested with `?`; tables 2..4 with their number. The
    /// error register rides on the table 1 readout (its F.F line).
    pub fn readout_selector(self) -> Option<char> {
        match self {
            DataKind::List1 | DataKind::Error => Some('?'),
            DataKind::List2 => Some('2'),
            DataKind::List3 => Some('3'),
            DataKind::List4 => Some('4'),
            _ => None,
        }
    }

    /// Identifier used in the `R5` command data field for profile and log
    /// kinds, e.g. `P.01` for the load profile.
    pub fn command_tag(self) -> Option<&'static str> {
        match self {
            DataKind::P01 => Some("P.01"),
            DataKind::P02 => Some("P.02"),
            DataKind::P98 => Some("P.98"),
            DataKind::P99 => Some("P.99"),
            DataKind::P200 => Some("P.200"),
            DataKind::P210 => Some("P.210"),
            DataKind::P211 => Some("P.211"),
            _ => None,
        }
    }

    /// The persisted resume field backing this kind, if any.
    pub fn watermark_field(self) -> Option<WatermarkField> {
        match self {
            DataKind::P01 => Some(WatermarkField::P01From),
            DataKind::P98 => Some(WatermarkField::P98From),
            _ => None,
        }
    }

    /// Kinds that are read in programming mode (R5 command) rather than via
    /// the readout stream.
    pub fn uses_programming_mode(self) -> bool {
        self.command_tag().is_some()
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "list1" | "1" => Ok(DataKind::List1),
            "list2" | "2" => Ok(DataKind::List2),
            "list3" | "3" => Ok(DataKind::List3),
            "list4" | "4" => Ok(DataKind::List4),
            "p01" | "p.01" => Ok(DataKind::P01),
            "p02" | "p.02" => Ok(DataKind::P02),
            "p98" | "p.98" => Ok(DataKind::P98),
            "p99" | "p.99" => Ok(DataKind::P99),
            "p200" | "p.200" => Ok(DataKind::P200),
            "p210" | "p.210" => Ok(DataKind::P210),
            "p211" | "p.211" => Ok(DataKind::P211),
            "error" => Ok(DataKind::Error),
            other => Err(ParseError::UnknownKind(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// WatermarkField
// ---------------------------------------------------------------------------

/// Resume-watermark columns on the meter roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkField {
    P01From,
    P98From,
}

impl WatermarkField {
    pub fn column_name(self) -> &'static str {
        match self {
            WatermarkField::P01From => "p01_from",
            WatermarkField::P98From => "p98_from",
        }
    }
}

impl fmt::Display for WatermarkField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

// ---------------------------------------------------------------------------
// Vendor
// ---------------------------------------------------------------------------

/// Closed vendor-family variant.
///
/// The parser and session differences between families are behavioral flags
/// on this enum, not separate implementations: status-word radix, P.98 row
/// shape, the event-log OBIS table, and the readout handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Emh,
    Metcom,
    /// Unknown manufacturer strings; behaves EMH-like.
    Generic,
}

impl Vendor {
    pub fn from_name(name: &str) -> Vendor {
        match name.to_lowercase().as_str() {
            "emh" => Vendor::Emh,
            "metcom" => Vendor::Metcom,
            _ => Vendor::Generic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Emh => "emh",
            Vendor::Metcom => "metcom",
            Vendor::Generic => "generic",
        }
    }

    /// Metcom renders the profile status word as a decimal number; EMH as
    /// ASCII hex.
    pub fn profile_status_is_decimal(self) -> bool {
        self == Vendor::Metcom
    }

    /// Metcom P.98 rows carry two data values (two records per row); EMH
    /// rows yield a single status record.
    pub fn p98_two_values(self) -> bool {
        self == Vendor::Metcom
    }

    /// Metcom answers the request message with a bare identification line
    /// and expects the full option-select handshake before streaming;
    /// EMH-family meters stream the identification and dataset in one reply.
    pub fn full_readout_handshake(self) -> bool {
        self == Vendor::Metcom
    }

    /// Event-log OBIS identifiers per family.
    pub fn log_obis(self, kind: DataKind) -> Option<&'static str> {
        match (self, kind) {
            (Vendor::Metcom, DataKind::P99) => Some("101.1.99"),
            (Vendor::Metcom, DataKind::P200) => Some("101.1.200"),
            (Vendor::Metcom, DataKind::P210) => Some("101.1.210"),
            (Vendor::Metcom, DataKind::P211) => Some("101.1.211"),
            (_, DataKind::P98) => Some("100.0.98"),
            (_, DataKind::P99) => Some("100.0.99"),
            (_, DataKind::P200) => Some("100.0.200"),
            (_, DataKind::P210) => Some("100.0.210"),
            (_, DataKind::P211) => Some("100.0.211"),
            _ => None,
        }
    }

    /// The two Metcom P.98 record identifiers (standard log data 1 and 2).
    pub fn metcom_p98_obis() -> (&'static str, &'static str) {
        ("101.1.98", "101.2.98")
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PasswordKind
// ---------------------------------------------------------------------------

/// Which password command the meter expects in programming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordKind {
    #[default]
    Utility,
    Manufacturer,
}

impl PasswordKind {
    /// `P1` authenticates with the utility password, `P2` with the
    /// manufacturer password.
    pub fn command(self) -> &'static [u8] {
        match self {
            PasswordKind::Utility => b"P1",
            PasswordKind::Manufacturer => b"P2",
        }
    }
}

// ---------------------------------------------------------------------------
// MeterDescriptor
// ---------------------------------------------------------------------------

fn default_port() -> u16 {
    8000
}

fn default_active() -> bool {
    true
}

/// One meter as described by the roster.
///
/// Created on roster load, replaced wholesale by a roster refresh (schedule
/// state is carried over by key merge in the scheduler), and dropped when
/// the meter disappears from the roster or goes inactive.
///
/// Serde derives match the JSON shape of the roster cache files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterDescriptor {
    /// Stable roster row id.
    pub id: i64,
    pub meter_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub manufacturer: String,
    pub ip_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address the request message with the meter id (`/?<id>!` instead of
    /// `/?!`).
    #[serde(default)]
    pub use_meter_id: bool,
    /// Per-meter connect/read timeout override, seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_type: PasswordKind,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,

    // Per-kind polling intervals in seconds; 0 disables the kind.
    #[serde(default)]
    pub list1: u32,
    #[serde(default)]
    pub list2: u32,
    #[serde(default)]
    pub list3: u32,
    #[serde(default)]
    pub list4: u32,
    #[serde(default)]
    pub p01: u32,
    #[serde(default)]
    pub p02: u32,
    #[serde(default)]
    pub p98: u32,
    #[serde(default)]
    pub p99: u32,
    #[serde(default)]
    pub p200: u32,
    #[serde(default)]
    pub p210: u32,
    #[serde(default)]
    pub p211: u32,
    #[serde(default)]
    pub error: u32,

    /// Resume watermarks, unix seconds.
    #[serde(default)]
    pub p01_from: Option<i64>,
    #[serde(default)]
    pub p98_from: Option<i64>,
}

impl MeterDescriptor {
    pub fn vendor(&self) -> Vendor {
        Vendor::from_name(&self.manufacturer)
    }

    /// Timezone name, defaulting to the fleet's conventional `CET`.
    pub fn zone_name(&self) -> &str {
        self.timezone.as_deref().unwrap_or("CET")
    }

    pub fn org(&self) -> &str {
        self.org.as_deref().unwrap_or("default")
    }

    /// Polling interval for a kind, in seconds. 0 = disabled.
    pub fn interval(&self, kind: DataKind) -> u32 {
        match kind {
            DataKind::List1 => self.list1,
            DataKind::List2 => self.list2,
            DataKind::List3 => self.list3,
            DataKind::List4 => self.list4,
            DataKind::P01 => self.p01,
            DataKind::P02 => self.p02,
            DataKind::P98 => self.p98,
            DataKind::P99 => self.p99,
            DataKind::P200 => self.p200,
            DataKind::P210 => self.p210,
            DataKind::P211 => self.p211,
            DataKind::Error => self.error,
        }
    }

    pub fn watermark(&self, field: WatermarkField) -> Option<i64> {
        match field {
            WatermarkField::P01From => self.p01_from,
            WatermarkField::P98From => self.p98_from,
        }
    }

    /// `host:port` for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}
