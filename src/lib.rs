//! meter-fleet: automated readout of IEC 62056-21 Mode C electricity meters
//! over TCP.
//!
//! The workspace splits into:
//! - `iec-line` — line-layer framing primitives (parity, BCC, control bytes)
//! - `meter-core` — data model and the COSEM/OBIS reply parser
//! - `mf-test-utils` — scripted TCP meter for integration tests
//! - `poller` — the fleet controller daemon (sessions, scheduler, sinks)
//!
//! This root package only hosts the cross-service integration suites under
//! `tests/integration/`.
