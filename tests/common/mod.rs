//! In-memory stand-in for PostgreSQL.
//!
//! Understands just enough SQL to drive the migrator: the ledger table,
//! guard queries, advisory locks and `SELECT 1`. Every other statement is
//! recorded and succeeds unless a failure or prerequisite says otherwise.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use locket_migrate::error::{GatewayError, GatewayResult, UNDEFINED_TABLE, UNIQUE_VIOLATION};
use locket_migrate::gateway::{Executor, Row, RowSet, SessionSource, Value};
use locket_migrate::migration::MigrationDefinition;
use locket_migrate::step::Step;

const LEDGER: &str = "schema_migrations";

/// One-step definition whose effect is `effect`.
pub fn definition(name: &str, effect: &str) -> MigrationDefinition {
    MigrationDefinition::new(name).step(Step::sql(format!("{} effect", name), effect))
}

/// `count` definitions named `001_m` .. with effects `EFFECT 001` ..
pub fn numbered(count: usize) -> Vec<MigrationDefinition> {
    (1..=count)
        .map(|i| definition(&format!("{:03}_m", i), &format!("EFFECT {:03}", i)))
        .collect()
}

/// A non-transient database error.
pub fn syntax_error(message: &str) -> GatewayError {
    GatewayError::database("42601", message)
}

struct Failure {
    needle: String,
    remaining: Option<u32>,
    error: GatewayError,
}

struct Prerequisite {
    needle: String,
    requires: String,
}

struct LedgerRow {
    id: i64,
    name: String,
    executed_at: DateTime<Utc>,
    checksum: Option<String>,
}

#[derive(Default)]
struct State {
    statements: Vec<String>,
    ledger_exists: bool,
    ledger_has_checksum: bool,
    ledger: Vec<LedgerRow>,
    failures: Vec<Failure>,
    prerequisites: Vec<Prerequisite>,
    guard_answers: Vec<(String, bool)>,
    lose_ledger_race: bool,
    unavailable_polls: u32,
    probes: u32,
    pins: u32,
    held_locks: Vec<i64>,
    lock_log: Vec<&'static str>,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<State>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A database whose ledger already records every definition in `defs`.
    pub fn with_applied(defs: &[MigrationDefinition]) -> Self {
        let db = Self::new();
        for def in defs {
            db.record(&def.name, Some(&def.checksum()));
        }
        db
    }

    /// A ledger created before the checksum column existed.
    pub fn with_legacy_ledger(names: &[&str]) -> Self {
        let db = Self::new();
        {
            let mut state = db.state();
            state.ledger_exists = true;
            state.ledger_has_checksum = false;
        }
        for name in names {
            db.record(name, None);
        }
        db
    }

    /// Insert a ledger row directly, creating the ledger if needed.
    pub fn record(&self, name: &str, checksum: Option<&str>) {
        let mut state = self.state();
        if !state.ledger_exists {
            state.ledger_exists = true;
            state.ledger_has_checksum = true;
        }
        let id = state.ledger.len() as i64 + 1;
        state.ledger.push(LedgerRow {
            id,
            name: name.to_string(),
            executed_at: Utc::now(),
            checksum: checksum.map(str::to_string),
        });
    }

    /// Every statement containing `needle` fails with `error`.
    pub fn fail_on(&self, needle: &str, error: GatewayError) {
        self.state().failures.push(Failure {
            needle: needle.to_string(),
            remaining: None,
            error,
        });
    }

    /// The next `times` statements containing `needle` fail with `error`.
    pub fn fail_times(&self, needle: &str, times: u32, error: GatewayError) {
        self.state().failures.push(Failure {
            needle: needle.to_string(),
            remaining: Some(times),
            error,
        });
    }

    /// Statements containing `needle` fail with `undefined_column` unless an
    /// earlier statement contained `requires`.
    pub fn require_before(&self, needle: &str, requires: &str) {
        self.state().prerequisites.push(Prerequisite {
            needle: needle.to_string(),
            requires: requires.to_string(),
        });
    }

    /// Answer guards containing `needle` with `applies`. Unmatched guards
    /// answer `true`.
    pub fn answer_guard(&self, needle: &str, applies: bool) {
        self.state().guard_answers.push((needle.to_string(), applies));
    }

    /// The next ledger `CREATE TABLE` behaves as if another session created
    /// the table a moment earlier: the table appears, the statement fails
    /// with a catalog unique violation.
    pub fn lose_ledger_race(&self) {
        self.state().lose_ledger_race = true;
    }

    /// Refuse the next `polls` readiness probes.
    pub fn unavailable_for(&self, polls: u32) {
        self.state().unavailable_polls = polls;
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    pub fn count(&self, needle: &str) -> usize {
        self.state()
            .statements
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    pub fn record_names(&self) -> Vec<String> {
        self.state().ledger.iter().map(|r| r.name.clone()).collect()
    }

    pub fn ledger_exists(&self) -> bool {
        self.state().ledger_exists
    }

    pub fn probes(&self) -> u32 {
        self.state().probes
    }

    pub fn pins(&self) -> u32 {
        self.state().pins
    }

    pub fn held_locks(&self) -> Vec<i64> {
        self.state().held_locks.clone()
    }

    pub fn lock_log(&self) -> Vec<&'static str> {
        self.state().lock_log.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl Executor for MockDatabase {
    async fn execute(&self, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
        // Let concurrent runs interleave at every statement, like a real
        // network round trip would.
        tokio::task::yield_now().await;
        self.state().handle(sql, params)
    }
}

impl SessionSource for MockDatabase {
    type Session = MockDatabase;

    async fn pin(&self) -> GatewayResult<MockDatabase> {
        self.state().pins += 1;
        Ok(self.clone())
    }
}

impl State {
    fn handle(&mut self, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
        self.statements.push(sql.to_string());

        if sql == "SELECT 1" {
            self.probes += 1;
            if self.unavailable_polls > 0 {
                self.unavailable_polls -= 1;
                return Err(GatewayError::Connection("connection refused".into()));
            }
            return Ok(RowSet::new(vec![Row::new().with("?column?", 1i64)]));
        }

        if let Some(failure) = self
            .failures
            .iter_mut()
            .find(|f| sql.contains(&f.needle) && f.remaining != Some(0))
        {
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(failure.error.clone());
        }

        let earlier = &self.statements[..self.statements.len() - 1];
        for prerequisite in &self.prerequisites {
            if sql.contains(&prerequisite.needle)
                && !earlier.iter().any(|s| s.contains(&prerequisite.requires))
            {
                return Err(GatewayError::database(
                    "42703",
                    format!("`{}` has not run yet", prerequisite.requires),
                ));
            }
        }

        if sql.ends_with("AS applies") {
            let applies = self.answer_guard(sql);
            return Ok(RowSet::new(vec![Row::new().with("applies", applies)]));
        }

        if sql.contains("pg_advisory_lock(") {
            self.held_locks.push(int_param(params, 0));
            self.lock_log.push("lock");
            return Ok(RowSet::new(vec![Row::new().with("pg_advisory_lock", Value::Null)]));
        }
        if sql.contains("pg_advisory_unlock(") {
            let key = int_param(params, 0);
            let released = match self.held_locks.iter().position(|k| *k == key) {
                Some(index) => {
                    self.held_locks.remove(index);
                    true
                }
                None => false,
            };
            self.lock_log.push("unlock");
            return Ok(RowSet::new(vec![Row::new().with("released", released)]));
        }

        if sql.contains(&format!("CREATE TABLE IF NOT EXISTS {}", LEDGER)) {
            if std::mem::take(&mut self.lose_ledger_race) {
                self.ledger_exists = true;
                self.ledger_has_checksum = true;
                return Err(GatewayError::database(
                    UNIQUE_VIOLATION,
                    "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"",
                ));
            }
            if !self.ledger_exists {
                self.ledger_exists = true;
                self.ledger_has_checksum = true;
            }
            return Ok(RowSet::empty());
        }
        if sql.contains(&format!("ALTER TABLE {} ADD COLUMN", LEDGER)) {
            self.ledger_has_checksum = true;
            return Ok(RowSet::empty());
        }

        if sql.contains(&format!("FROM {}", LEDGER)) {
            self.require_ledger()?;
            let name = sql.contains("WHERE name = $1").then(|| text_param(params, 0));
            let rows = self
                .ledger
                .iter()
                .filter(|r| name.as_deref().is_none_or(|n| r.name == n))
                .map(|r| {
                    Row::new()
                        .with("id", r.id)
                        .with("name", r.name.as_str())
                        .with("executed_at", r.executed_at)
                        .with("checksum", r.checksum.clone())
                })
                .collect();
            return Ok(RowSet::new(rows));
        }

        if sql.contains(&format!("INSERT INTO {}", LEDGER)) {
            self.require_ledger()?;
            let name = text_param(params, 0);
            if !self.ledger.iter().any(|r| r.name == name) {
                let checksum = self
                    .ledger_has_checksum
                    .then(|| text_param(params, 1));
                self.ledger.push(LedgerRow {
                    id: self.ledger.len() as i64 + 1,
                    name,
                    executed_at: Utc::now(),
                    checksum,
                });
            }
            return Ok(RowSet::empty());
        }

        Ok(RowSet::empty())
    }

    fn answer_guard(&self, sql: &str) -> bool {
        let ledger_table = format!("table_name = '{}'", LEDGER);
        if sql.contains(&ledger_table) && sql.contains("column_name = 'checksum'") {
            return self.ledger_exists && !self.ledger_has_checksum;
        }
        if sql.contains(&ledger_table) {
            return !self.ledger_exists;
        }
        self.guard_answers
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .is_none_or(|(_, applies)| *applies)
    }

    fn require_ledger(&self) -> GatewayResult<()> {
        if self.ledger_exists {
            Ok(())
        } else {
            Err(GatewayError::database(
                UNDEFINED_TABLE,
                format!("relation \"{}\" does not exist", LEDGER),
            ))
        }
    }
}

fn text_param(params: &[Value], index: usize) -> String {
    match params.get(index) {
        Some(Value::Text(s)) => s.clone(),
        other => panic!("expected text parameter ${}, got {:?}", index + 1, other),
    }
}

fn int_param(params: &[Value], index: usize) -> i64 {
    match params.get(index) {
        Some(Value::Int(n)) => *n,
        other => panic!("expected int parameter ${}, got {:?}", index + 1, other),
    }
}
