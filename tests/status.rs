mod common;

use common::{MockDatabase, numbered};
use locket_migrate::ledger::LedgerTable;
use locket_migrate::status::{ChecksumState, status};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn reports_every_definition_in_order() {
    let defs = numbered(4);
    let db = MockDatabase::new();
    db.record("000_dropped_experiment", Some("abc"));
    db.record("001_m", Some(&defs[0].checksum()));
    db.record("002_m", Some("deadbeef"));
    db.record("003_m", None);

    let report = status(&db, &defs, &LedgerTable::default()).await.unwrap();

    let states: Vec<(&str, &ChecksumState)> = report
        .migrations
        .iter()
        .map(|m| (m.name.as_str(), &m.checksum))
        .collect();
    assert_eq!(
        states,
        vec![
            ("001_m", &ChecksumState::Match),
            (
                "002_m",
                &ChecksumState::Mismatch {
                    recorded: "deadbeef".to_string()
                }
            ),
            ("003_m", &ChecksumState::Unrecorded),
            ("004_m", &ChecksumState::Pending),
        ]
    );

    assert_eq!(report.applied_count(), 3);
    assert_eq!(
        report.pending().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        vec!["004_m"]
    );
    assert!(!report.is_current());
    assert!(report.migrations[3].executed_at.is_none());

    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].name, "000_dropped_experiment");
}

#[tokio::test]
async fn status_never_writes() {
    let defs = numbered(2);
    let db = MockDatabase::new();

    let report = status(&db, &defs, &LedgerTable::default()).await.unwrap();

    assert_eq!(report.pending().count(), 2);
    assert!(report.orphans.is_empty());
    assert!(!db.ledger_exists());
    for sql in db.statements() {
        assert!(sql.starts_with("SELECT"), "status wrote: {sql}");
    }
}

#[tokio::test]
async fn report_serializes_for_tooling() {
    let defs = numbered(2);
    let db = MockDatabase::with_applied(&defs[..1]);

    let report = status(&db, &defs, &LedgerTable::default()).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["migrations"][0]["name"], "001_m");
    assert_eq!(json["migrations"][0]["checksum"]["state"], "match");
    assert_eq!(json["migrations"][1]["checksum"]["state"], "pending");
    assert!(json["migrations"][1]["executed_at"].is_null());
    assert_eq!(json["orphans"], serde_json::json!([]));
}
