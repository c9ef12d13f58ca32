//! End-to-end load-profile poll with a resume watermark.
//!
//! A programming-mode session with password against the scripted meter:
//! verifies the R5 time-window command embeds the watermark rendered in
//! the meter's zone, and that the parsed rows carry the timestamps the
//! next watermark advance would persist.

use chrono::{Duration as TimeDelta, TimeZone, Utc};
use std::time::Duration;

use meter_core::{BatchKey, DataKind, MeterContext, MeterDescriptor, PasswordKind, timebase};
use mf_test_utils::{MockMeter, Step, p0_frame, stx_frame};
use poller::session::{Session, from_bound};
use poller::sink::BufferSink;

fn meter_for(mock: &MockMeter) -> MeterDescriptor {
    MeterDescriptor {
        id: 7,
        meter_id: "10132380".to_owned(),
        description: None,
        manufacturer: "EMH".to_owned(),
        ip_address: mock.host(),
        port: mock.port(),
        use_meter_id: true,
        timeout: None,
        password: Some("00000000".to_owned()),
        password_type: PasswordKind::Utility,
        timezone: Some("CET".to_owned()),
        org: Some("acme".to_owned()),
        is_active: true,
        list1: 0,
        list2: 0,
        list3: 0,
        list4: 0,
        p01: 900,
        p02: 0,
        p98: 0,
        p99: 0,
        p200: 0,
        p210: 0,
        p211: 0,
        error: 0,
        p01_from: None,
        p98_from: None,
    }
}

const P01_BODY: &[u8] = b"P.01(1220823161500)(00000000)(15)(6)(1.5)(kW)(2.5)(kW)(5.5)(kvar)(6.5)(kvar)(7.5)(kvar)(8.5)(kvar)\r\n(0.00063)(0.00000)(0.00023)(0.00000)(0.00000)(0.00000)\r\n(0.02093)(0.00000)(0.00184)(0.00000)(0.00000)(0.00033)\r\n";

#[tokio::test]
async fn profile_poll_resumes_from_watermark() {
    let mock = MockMeter::start(vec![
        // Identification (EMH: Tr-quiesced line, no ETX).
        Step::exchange(b"/EMH4\\@01LZQJL0013F\r\n".to_vec()),
        // Programming mode hello.
        Step::exchange(p0_frame("00000001")),
        // Password accepted.
        Step::exchange(vec![0x06]),
        // Profile data.
        Step::exchange(stx_frame(P01_BODY)),
    ])
    .await
    .unwrap();

    let mut meter = meter_for(&mock);
    let now = Utc::now();
    // Watermark 30 minutes back: more recent than the 90-minute floor, so
    // the session must resume exactly from it.
    let mark = now - TimeDelta::minutes(30);
    meter.p01_from = Some(mark.timestamp());

    let from = from_bound(&meter, DataKind::P01, now, TimeDelta::minutes(90)).unwrap();
    assert_eq!(from, Utc.timestamp_opt(mark.timestamp(), 0).unwrap());

    let mut session = Session::open(
        meter.clone(),
        Duration::from_secs(2),
        Duration::from_millis(400),
    )
    .await
    .unwrap();
    let body = session.read_kind(DataKind::P01, Some(from)).await.unwrap();

    // The R5 command carried the watermark, rendered in CET.
    let zone = timebase::zone_offset("CET").unwrap();
    let expected_window = format!("P.01({};)", timebase::render_from_bound(from, zone));
    let received = mock.received();
    let r5 = received
        .iter()
        .find(|frame| frame.windows(2).any(|w| w == b"R5"))
        .expect("an R5 command frame");
    let r5_text: Vec<u8> = iec_line::drop_ctl_bytes(&r5[..r5.len() - 1]);
    assert_eq!(String::from_utf8(r5_text).unwrap(), format!("R5{expected_window}"));

    // Parse, stage, and compute the next watermark.
    let ctx = MeterContext::for_meter(&meter).unwrap();
    let records = meter_core::parse(&body, DataKind::P01, &ctx).unwrap();
    assert_eq!(records.len(), 12);

    let row0 = Utc.with_ymd_and_hms(2022, 8, 23, 14, 15, 0).unwrap().timestamp();
    let row1 = Utc.with_ymd_and_hms(2022, 8, 23, 14, 30, 0).unwrap().timestamp();
    assert!(records[..6].iter().all(|r| r.line_time == Some(row0)));
    assert!(records[6..].iter().all(|r| r.line_time == Some(row1)));

    let dir = tempfile::tempdir().unwrap();
    let sink = BufferSink::open(&dir.path().join("staging.sqlite3"), 86_400).unwrap();
    let key = BatchKey::new(meter.org(), &meter.meter_id, now.timestamp(), DataKind::P01);
    assert!(sink.insert(&key, &records).await.unwrap());

    // The resume point the worker would persist after sink confirmation.
    let newest = records.iter().filter_map(|r| r.line_time).max().unwrap();
    assert_eq!(newest, row1);

    // The session signed off.
    assert!(
        mock.received()
            .iter()
            .any(|frame| frame.as_slice() == iec_line::sign_off_frame().as_slice()),
        "sign-off frame must be sent after a successful read"
    );
}

#[tokio::test]
async fn old_watermark_is_capped_by_the_rolling_window() {
    let mock = MockMeter::start(vec![]).await.unwrap();
    let mut meter = meter_for(&mock);
    let now = Utc::now();
    meter.p01_from = Some((now - TimeDelta::hours(12)).timestamp());

    let from = from_bound(&meter, DataKind::P01, now, TimeDelta::minutes(90)).unwrap();
    assert_eq!(from, now - TimeDelta::minutes(90));
}
