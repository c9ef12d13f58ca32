//! File-backed staging buffer: durability across reopen and the staged
//! key/payload contract the mover depends on.

use meter_core::{BatchKey, DataKind, Record};
use poller::sink::BufferSink;

fn records() -> Vec<Record> {
    vec![
        Record::new("100.0.98", "00008020").at(1_661_558_206),
        Record::new("100.0.98", "00000010").at(1_661_990_400),
    ]
}

#[tokio::test]
async fn staged_batches_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staging.sqlite3");
    let key = BatchKey::new("Acme", "08032332", 1_661_990_500, DataKind::P98);

    {
        let sink = BufferSink::open(&path, 0).unwrap();
        assert!(sink.insert(&key, &records()).await.unwrap());
    }

    // A fresh process sees the staged batch.
    let sink = BufferSink::open(&path, 0).unwrap();
    assert_eq!(sink.staged_count().await.unwrap(), 1);
    let payload = sink
        .staged("acme:08032332_1661990500:p98")
        .await
        .unwrap()
        .expect("staged batch");
    let restored: Vec<Record> = serde_json::from_str(&payload).unwrap();
    assert_eq!(restored, records());
}

#[tokio::test]
async fn payload_json_matches_downstream_contract() {
    let dir = tempfile::tempdir().unwrap();
    let sink = BufferSink::open(&dir.path().join("staging.sqlite3"), 0).unwrap();
    let key = BatchKey::new("acme", "10067967", 1_649_100_604, DataKind::List1);
    let batch = vec![
        Record::new("F.F", "00000000"),
        Record::new("1.8.0", "01281.6601").with_unit("kWh"),
    ];
    sink.insert(&key, &batch).await.unwrap();

    let payload = sink.staged(&key.to_string()).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(
        value,
        serde_json::json!([
            {"id": "F.F", "value": "00000000", "unit": null},
            {"id": "1.8.0", "value": "01281.6601", "unit": "kWh"},
        ])
    );
}

#[tokio::test]
async fn rereading_a_window_replaces_the_staged_batch() {
    let dir = tempfile::tempdir().unwrap();
    let sink = BufferSink::open(&dir.path().join("staging.sqlite3"), 0).unwrap();
    let key = BatchKey::new("acme", "08032332", 1_661_990_500, DataKind::P98);

    sink.insert(&key, &records()).await.unwrap();
    let wider = vec![
        Record::new("100.0.98", "00008020").at(1_661_558_206),
        Record::new("100.0.98", "00000010").at(1_661_990_400),
        Record::new("100.0.98", "00000040").at(1_661_990_401),
    ];
    sink.insert(&key, &wider).await.unwrap();

    assert_eq!(sink.staged_count().await.unwrap(), 1);
    let payload = sink.staged(&key.to_string()).await.unwrap().unwrap();
    let restored: Vec<Record> = serde_json::from_str(&payload).unwrap();
    assert_eq!(restored.len(), 3);
}
