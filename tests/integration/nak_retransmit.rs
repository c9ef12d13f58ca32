//! NAK handling over a real socket: one retransmission of the identical
//! frame, then a hard failure that yields no records.

use std::time::Duration;

use meter_core::{DataKind, MeterDescriptor, PasswordKind};
use mf_test_utils::{MockMeter, Step, stx_frame};
use poller::session::{Session, SessionError, SessionState};

fn meter_for(mock: &MockMeter) -> MeterDescriptor {
    MeterDescriptor {
        id: 3,
        meter_id: "10201787".to_owned(),
        description: None,
        manufacturer: "EMH".to_owned(),
        ip_address: mock.host(),
        port: mock.port(),
        use_meter_id: false,
        timeout: None,
        password: None,
        password_type: PasswordKind::Utility,
        timezone: Some("CET".to_owned()),
        org: Some("acme".to_owned()),
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

#[tokio::test]
async fn second_nak_fails_the_session() {
    let mock = MockMeter::start(vec![Step::nak(), Step::nak()]).await.unwrap();
    let meter = meter_for(&mock);

    let mut session = Session::open(meter, Duration::from_secs(2), Duration::from_millis(300))
        .await
        .unwrap();
    let err = session.read_kind(DataKind::List1, None).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Framing(poller::framer::FramerError::RemoteNak)
    ));
    assert_eq!(session.state(), SessionState::Failed);

    // Exactly two sends, byte-identical.
    let received = mock.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], received[1]);
    assert_eq!(received[0], b"/?!\r\n".to_vec());
}

#[tokio::test]
async fn single_nak_recovers_after_retransmit() {
    let body: &[u8] = b"F.F(00000000)\r\n!\r\n";
    let mock = MockMeter::start(vec![Step::nak(), Step::exchange(stx_frame(body))])
        .await
        .unwrap();
    let meter = meter_for(&mock);

    let mut session = Session::open(meter, Duration::from_secs(2), Duration::from_millis(300))
        .await
        .unwrap();
    let reply = session.read_kind(DataKind::List1, None).await.unwrap();
    assert!(reply.contains("F.F(00000000)"));
    assert_eq!(session.state(), SessionState::SignedOff);
    assert_eq!(mock.received().len(), 2);
}
