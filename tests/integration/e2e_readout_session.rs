//! End-to-end readout: scripted TCP meter -> session -> parser -> staging
//! buffer.
//!
//! Drives the real session and framer over a real socket against the
//! scripted meter, then checks the staged JSON payload byte-for-byte
//! against the expected record list.

use std::time::Duration;

use meter_core::{BatchKey, DataKind, MeterContext, MeterDescriptor, PasswordKind, Record};
use mf_test_utils::{MockMeter, Step, stx_frame};
use poller::session::Session;
use poller::sink::BufferSink;

fn meter_for(mock: &MockMeter, manufacturer: &str) -> MeterDescriptor {
    MeterDescriptor {
        id: 1,
        meter_id: "10067967".to_owned(),
        description: Some("integration".to_owned()),
        manufacturer: manufacturer.to_owned(),
        ip_address: mock.host(),
        port: mock.port(),
        use_meter_id: true,
        timeout: None,
        password: None,
        password_type: PasswordKind::Utility,
        timezone: Some("CET".to_owned()),
        org: Some("Acme".to_owned()),
        is_active: true,
        list1: 10,
        list2: 0,
        list3: 0,
        list4: 0,
        p01: 0,
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

const TABLE1: &[u8] = b"F.F(00000000)\r\n0.0.0(10067967)\r\n1.8.0(01281.6601*kWh)\r\n1.6.1(0.50262*kW)(2211120730)\r\n1.6.1*12(0.39912*kW)(2210130900)\r\n!\r\n";

#[tokio::test]
async fn emh_readout_to_staging_buffer() {
    let mock = MockMeter::start(vec![Step::exchange(stx_frame(TABLE1))])
        .await
        .unwrap();
    let meter = meter_for(&mock, "EMH");

    // Session over a real TCP connection.
    let mut session = Session::open(
        meter.clone(),
        Duration::from_secs(2),
        Duration::from_millis(300),
    )
    .await
    .unwrap();
    let body = session.read_kind(DataKind::List1, None).await.unwrap();

    // The request on the wire addressed the meter by id.
    let received = mock.received();
    assert_eq!(received[0], b"/?10067967!\r\n".to_vec());

    // Parse and stage.
    let ctx = MeterContext::for_meter(&meter).unwrap();
    let records = meter_core::parse(&body, DataKind::List1, &ctx).unwrap();
    assert_eq!(records.len(), 4, "historical 1.6.1*12 must be dropped");
    assert_eq!(records[3], Record::new("1.6.1", "0.50262").with_unit("kW"));

    let dir = tempfile::tempdir().unwrap();
    let sink = BufferSink::open(&dir.path().join("staging.sqlite3"), 0).unwrap();
    let key = BatchKey::new(meter.org(), &meter.meter_id, 1_668_240_000, DataKind::List1);
    assert!(sink.insert(&key, &records).await.unwrap());

    let payload = sink
        .staged("acme:10067967_1668240000:list1")
        .await
        .unwrap()
        .expect("batch staged under the canonical key");
    let staged: Vec<Record> = serde_json::from_str(&payload).unwrap();
    assert_eq!(staged, records);
}

#[tokio::test]
async fn metcom_readout_uses_full_handshake() {
    let mock = MockMeter::start(vec![
        Step::exchange(b"/MCS5\\@V0050710000051\r\n".to_vec()),
        Step::exchange(stx_frame(TABLE1)),
    ])
    .await
    .unwrap();
    let meter = meter_for(&mock, "MetCom");

    let mut session = Session::open(
        meter.clone(),
        Duration::from_secs(2),
        Duration::from_millis(300),
    )
    .await
    .unwrap();
    let body = session.read_kind(DataKind::List1, None).await.unwrap();

    let received = mock.received();
    assert_eq!(received.len(), 2, "request then option select");
    assert_eq!(received[0], b"/?10067967!\r\n".to_vec());
    assert_eq!(received[1], vec![0x06, b'0', b'5', b'0', b'\r', b'\n']);

    let ctx = MeterContext::for_meter(&meter).unwrap();
    let records = meter_core::parse(&body, DataKind::List1, &ctx).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0], Record::new("F.F", "00000000"));
}
