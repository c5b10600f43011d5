//! Read-only migration status, for operators and health endpoints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MigrationError;
use crate::gateway::Executor;
use crate::ledger::{Ledger, LedgerTable};
use crate::migration::{MigrationDefinition, MigrationRecord};

/// How a definition's compiled checksum compares with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChecksumState {
    Match,
    Mismatch { recorded: String },
    /// Applied before checksums were recorded.
    Unrecorded,
    /// Not applied yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub checksum: ChecksumState,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.executed_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// One entry per definition, in declaration order.
    pub migrations: Vec<MigrationStatus>,
    /// Ledger rows with no compiled definition.
    pub orphans: Vec<MigrationRecord>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &MigrationStatus> {
        self.migrations.iter().filter(|m| !m.is_applied())
    }

    pub fn applied_count(&self) -> usize {
        self.migrations.iter().filter(|m| m.is_applied()).count()
    }

    pub fn is_current(&self) -> bool {
        self.pending().next().is_none()
    }
}

/// Report, for every definition, whether and when it ran.
///
/// Never writes; a missing ledger reports everything as pending.
pub async fn status<E: Executor>(
    executor: &E,
    definitions: &[MigrationDefinition],
    ledger_table: &LedgerTable,
) -> Result<StatusReport, MigrationError> {
    let records = Ledger::new(executor, ledger_table)
        .records()
        .await
        .map_err(MigrationError::Ledger)?;

    let mut by_name: HashMap<&str, &MigrationRecord> =
        records.iter().map(|r| (r.name.as_str(), r)).collect();

    let migrations = definitions
        .iter()
        .map(|definition| match by_name.remove(definition.name.as_str()) {
            Some(record) => MigrationStatus {
                name: definition.name.clone(),
                executed_at: Some(record.executed_at),
                checksum: match &record.checksum {
                    None => ChecksumState::Unrecorded,
                    Some(recorded) if *recorded == definition.checksum() => ChecksumState::Match,
                    Some(recorded) => ChecksumState::Mismatch {
                        recorded: recorded.clone(),
                    },
                },
            },
            None => MigrationStatus {
                name: definition.name.clone(),
                executed_at: None,
                checksum: ChecksumState::Pending,
            },
        })
        .collect();

    let orphans = records
        .iter()
        .filter(|r| by_name.contains_key(r.name.as_str()))
        .cloned()
        .collect();

    Ok(StatusReport { migrations, orphans })
}
