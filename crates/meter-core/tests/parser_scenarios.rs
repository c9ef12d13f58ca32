//! Parser scenarios against captured meter replies.
//!
//! The raw inputs here are real reply bodies (post-framing: parity and
//! delimiters already stripped), one per supported shape. These pin down
//! the exact record lists the rest of the pipeline relies on.

use chrono::{TimeZone, Utc};
use meter_core::{DataKind, MeterContext, Record, Vendor, parse, timebase};

fn metcom_ctx() -> MeterContext {
    MeterContext {
        meter_id: "10067967".to_owned(),
        vendor: Vendor::Metcom,
        zone: timebase::zone_offset("CET").unwrap(),
    }
}

fn emh_ctx() -> MeterContext {
    MeterContext {
        meter_id: "10201787".to_owned(),
        vendor: Vendor::Emh,
        zone: timebase::zone_offset("CET").unwrap(),
    }
}

fn rec(obis: &str, value: &str, unit: Option<&str>) -> Record {
    Record {
        obis: obis.to_owned(),
        value: value.to_owned(),
        unit: unit.map(str::to_owned),
        line_time: None,
    }
}

// ---------------------------------------------------------------------------
// Scenario: Metcom table 1 readout
// ---------------------------------------------------------------------------

#[test]
fn metcom_table1_readout() {
    let raw = "F.F(00000000)\r\n0.0.0(10067967)\r\n1.8.0(01281.6601*kWh)\r\n1.6.1(0.50262*kW)(2211120730)\r\n1.6.1*12(0.39912*kW)(2210130900)\r\n!\r\n";
    let records = parse(raw, DataKind::List1, &metcom_ctx()).unwrap();
    assert_eq!(
        records,
        vec![
            rec("F.F", "00000000", None),
            rec("0.0.0", "10067967", None),
            rec("1.8.0", "01281.6601", Some("kWh")),
            rec("1.6.1", "0.50262", Some("kW")),
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario: EMH P.01 block, CET in summer (+02:00)
// ---------------------------------------------------------------------------

#[test]
fn emh_p01_block() {
    let raw = "P.01(1220823161500)(00000000)(15)(6)(1.5)(kW)(2.5)(kW)(5.5)(kvar)(6.5)(kvar)(7.5)(kvar)(8.5)(kvar)\r\n(0.00063)(0.00000)(0.00023)(0.00000)(0.00000)(0.00000)\r\n(0.02093)(0.00000)(0.00184)(0.00000)(0.00000)(0.00033)\r\n";
    let records = parse(raw, DataKind::P01, &emh_ctx()).unwrap();
    assert_eq!(records.len(), 12);

    let row0 = Utc.with_ymd_and_hms(2022, 8, 23, 14, 15, 0).unwrap().timestamp();
    let row1 = Utc.with_ymd_and_hms(2022, 8, 23, 14, 30, 0).unwrap().timestamp();
    assert!(records[..6].iter().all(|r| r.line_time == Some(row0)));
    assert!(records[6..].iter().all(|r| r.line_time == Some(row1)));

    assert_eq!(records[0].obis, "1.5");
    assert_eq!(records[0].value, "0.00063");
    assert_eq!(records[0].unit.as_deref(), Some("kW"));
    assert_eq!(records[11].obis, "8.5");
    assert_eq!(records[11].value, "0.00033");
    assert_eq!(records[11].unit.as_deref(), Some("kvar"));
}

// ---------------------------------------------------------------------------
// Scenario: Metcom P.01 with z=6, four rows, 15-minute strides
// ---------------------------------------------------------------------------

#[test]
fn metcom_p01_four_rows() {
    let raw = "P.01(1220823150000)(08)(15)(6)(1-0:1.5.0)(kW)(1-0:2.5.0)(kW)(1-0:5.5.0)(kvar)(1-0:6.5.0)(kvar)(1-0:7.5.0)(kvar)(1-0:8.5.0)(kvar)\r\n(0.26)(0.00)(0.00)(0.00)(0.00)(0.05)\r\n(0.17)(0.00)(0.03)(0.00)(0.00)(0.00)\r\n(0.10)(0.00)(0.01)(0.00)(0.00)(0.05)\r\n(0.22)(0.00)(0.01)(0.00)(0.00)(0.03)\r\n";
    let records = parse(raw, DataKind::P01, &metcom_ctx()).unwrap();
    assert_eq!(records.len(), 24);

    let start = Utc.with_ymd_and_hms(2022, 8, 23, 13, 0, 0).unwrap().timestamp();
    for (i, chunk) in records.chunks(6).enumerate() {
        let expected = start + i as i64 * 15 * 60;
        assert!(chunk.iter().all(|r| r.line_time == Some(expected)));
    }
    assert_eq!(records[0].obis, "1.5.0");
}

// ---------------------------------------------------------------------------
// Scenario: EMH P.98 with a duplicated entry time
// ---------------------------------------------------------------------------

#[test]
fn emh_p98_log_with_collision() {
    let raw = "P.98(1220906115553)(00002000)()(0)\r\nP.98(1220906115553)(00004000)()(0)\r\nP.98(1220906120814)(00000100)()(0)\r\nP.98(1220910235706)(00000080)()(0)\r\n";
    let records = parse(raw, DataKind::P98, &emh_ctx()).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.obis == "100.0.98"));
    assert!(records.iter().all(|r| r.unit.is_none()));

    let t0 = Utc.with_ymd_and_hms(2022, 9, 6, 9, 55, 53).unwrap().timestamp();
    assert_eq!(records[0].line_time, Some(t0));
    // The colliding second entry is bumped by exactly one second.
    assert_eq!(records[1].line_time, Some(t0 + 1));
    assert_eq!(records[0].value, "00002000");
    assert_eq!(records[1].value, "00004000");
}

// ---------------------------------------------------------------------------
// Scenario: Metcom P.98, two records per entry
// ---------------------------------------------------------------------------

#[test]
fn metcom_p98_log() {
    let raw = "P.98(1220813152310)(00)()(2)(91.11.0)()(91.11.10)()(1)(0)\r\nP.98(1220813161205)(00)()(2)(91.11.0)()(91.11.10)()(2)(0)\r\nP.98(1220814110004)(00)()(2)(91.11.0)()(91.11.10)()(4)(0)\r\nP.98(1220814110500)(00)()(2)(91.11.0)()(91.11.10)()(5)(0)\r\nP.98(1220817170320)(00)()(2)(91.11.0)()(91.11.10)()(1)(0)\r\nP.98(1220817171407)(00)()(2)(91.11.0)()(91.11.10)()(2)(0)\r\n";
    let records = parse(raw, DataKind::P98, &metcom_ctx()).unwrap();
    assert_eq!(records.len(), 12);
    for pair in records.chunks(2) {
        assert_eq!(pair[0].obis, "101.1.98");
        assert_eq!(pair[1].obis, "101.2.98");
        assert_eq!(pair[0].line_time, pair[1].line_time);
    }
    assert_eq!(records[0].value, "1");
    assert_eq!(records[1].value, "0");
    assert_eq!(records[4].value, "4");
}

// ---------------------------------------------------------------------------
// Scenario: F.F error register
// ---------------------------------------------------------------------------

#[test]
fn error_register() {
    let records = parse("F.F(00000000)\r\n", DataKind::Error, &emh_ctx()).unwrap();
    assert_eq!(records, vec![rec("F.F", "00000000", Some("log"))]);
}

// ---------------------------------------------------------------------------
// Determinism: same bytes + same context ⇒ same records
// ---------------------------------------------------------------------------

#[test]
fn parser_is_deterministic() {
    let raw = "P.98(1220906115553)(00002000)()(0)\r\nP.98(1220906115553)(00004000)()(0)\r\n";
    let first = parse(raw, DataKind::P98, &emh_ctx()).unwrap();
    for _ in 0..10 {
        assert_eq!(parse(raw, DataKind::P98, &emh_ctx()).unwrap(), first);
    }
}
