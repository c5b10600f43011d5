mod common;

use common::{MockDatabase, syntax_error};
use locket_migrate::config::MigrationsConfig;
use locket_migrate::definitions;
use locket_migrate::runner::Migrator;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn fresh_database_applies_everything_then_nothing() {
    let db = MockDatabase::new();
    let defs = definitions::all();
    let options = MigrationsConfig::default();

    let first = Migrator::new(&db, &defs, &options).run().await.unwrap();
    assert_eq!(first.applied.len(), defs.len());

    db.clear_statements();
    let second = Migrator::new(&db, &defs, &options).run().await.unwrap();
    assert!(second.is_noop());
    assert!(db.statements().iter().all(|s| s.starts_with("SELECT")));
}

#[tokio::test]
async fn crash_in_the_rename_resumes_from_the_rename() {
    let db = MockDatabase::new();
    db.fail_times(
        "ALTER TABLE corner_invites RENAME TO locket_invites",
        1,
        syntax_error("canceling statement due to lock timeout"),
    );
    let defs = definitions::all();
    let options = MigrationsConfig::default();

    let err = Migrator::new(&db, &defs, &options).run().await.unwrap_err();
    assert_eq!(err.migration_name(), Some("006_rename_corner_to_locket"));
    assert_eq!(db.record_names().len(), 5);
    assert_eq!(db.count("ALTER TABLE corners RENAME TO lockets"), 1);

    // The first table was renamed before the crash; its guard now says so.
    db.answer_guard("table_name = 'corners'", false);

    let report = Migrator::new(&db, &defs, &options).run().await.unwrap();
    assert_eq!(report.applied.first().map(String::as_str), Some("006_rename_corner_to_locket"));
    assert_eq!(report.applied.len(), defs.len() - 5);
    assert_eq!(db.count("ALTER TABLE corners RENAME TO lockets"), 1);
    assert_eq!(db.count("ALTER TABLE corner_invites RENAME TO locket_invites"), 2);
}

#[tokio::test]
async fn already_renamed_database_skips_legacy_creates() {
    let db = MockDatabase::new();
    db.answer_guard("table_name = 'lockets'", false);
    let defs = definitions::all();

    Migrator::new(&db, &defs, &MigrationsConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(db.count("CREATE TABLE corners ("), 0);
}

#[tokio::test]
async fn milestone_index_follows_an_early_rename() {
    let db = MockDatabase::new();
    // Renamed by hand before 004 ever ran.
    db.answer_guard("table_name = 'memory_groups' AND column_name = 'corner_id'", false);
    let defs = definitions::all();

    Migrator::new(&db, &defs, &MigrationsConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(db.count("ON memory_groups (corner_id, memory_date) WHERE is_milestone"), 0);
    assert_eq!(db.count("ON memory_groups (locket_id, memory_date) WHERE is_milestone"), 1);
}

#[test]
fn unguarded_steps_guard_themselves() {
    for definition in definitions::all() {
        for step in definition.steps.iter().filter(|s| s.guard.is_none()) {
            let effect = step.effect.as_str();
            let self_guarded = effect.contains("IF NOT EXISTS")
                || effect.starts_with("DO $$")
                || (effect.starts_with("UPDATE") && effect.contains(" WHERE "));
            assert!(
                self_guarded,
                "{} / {}: `{}` is not safe to re-run",
                definition.name, step.description, effect
            );
        }
    }
}
