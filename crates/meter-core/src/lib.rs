//! Core data model and reply parser for the meter-reading fleet.
//!
//! Holds the pieces shared between the poller service and the integration
//! suites: meter descriptors as they come out of the roster, the OBIS-tagged
//! `Record` the parser produces, the vendor-family variant with its
//! behavioral flags, fixed-offset timezone handling, and the stateful text
//! parser for the COSEM/OBIS dataset grammar.
//!
//! The parser is pure: the same raw reply with the same meter context always
//! yields the same record list.

pub mod meter;
pub mod parser;
pub mod record;
pub mod timebase;

pub use meter::{DataKind, MeterDescriptor, PasswordKind, Vendor, WatermarkField};
pub use parser::{MeterContext, ParseError, parse};
pub use record::{BatchKey, Record};
