//! Migration runner
//!
//! ```text
//! ENSURE_LEDGER -> for each definition, in declaration order:
//!     recorded?  -> skip
//!     pending    -> apply steps -> record   (any error: abort the run)
//! ```
//!
//! Later definitions may assume everything before them ran, so the runner
//! never reorders, parallelizes, or skips past a failure. Recovery is
//! re-running from the top: recorded definitions are skipped and the failed
//! one is retried, which its guarded steps make safe.

use std::collections::{HashMap, HashSet};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::MigrationsConfig;
use crate::error::MigrationError;
use crate::gateway::{Executor, SessionSource};
use crate::ledger::{Ledger, LedgerTable};
use crate::lock::{LockMode, with_advisory_lock};
use crate::migration::MigrationDefinition;
use crate::step::StepOutcome;

/// What to do when a recorded checksum differs from the compiled one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    Ignore,
    /// Log and keep going.
    #[default]
    Warn,
    /// Refuse to run.
    Strict,
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies definitions through an executor.
pub struct Migrator<'a, E> {
    executor: &'a E,
    definitions: &'a [MigrationDefinition],
    ledger_table: &'a LedgerTable,
    checksum_policy: ChecksumPolicy,
}

impl<'a, E: Executor> Migrator<'a, E> {
    pub fn new(
        executor: &'a E,
        definitions: &'a [MigrationDefinition],
        options: &'a MigrationsConfig,
    ) -> Self {
        Self {
            executor,
            definitions,
            ledger_table: &options.ledger_table,
            checksum_policy: options.checksum_policy,
        }
    }

    pub fn ledger(&self) -> Ledger<'a, E> {
        Ledger::new(self.executor, self.ledger_table)
    }

    /// Apply every pending definition, in order.
    pub async fn run(&self) -> Result<RunReport, MigrationError> {
        check_unique(self.definitions)?;

        let ledger = self.ledger();
        ledger.ensure_exists().await.map_err(MigrationError::Ledger)?;
        self.verify_checksums(&ledger).await?;

        let mut report = RunReport::default();
        for definition in self.definitions {
            if ledger
                .has_run(&definition.name)
                .await
                .map_err(MigrationError::Ledger)?
            {
                debug!(migration = %definition.name, "already applied, skipping");
                report.skipped.push(definition.name.clone());
                continue;
            }

            self.apply(definition).await?;
            ledger
                .record_run(&definition.name, &definition.checksum())
                .await
                .map_err(MigrationError::Ledger)?;
            info!(migration = %definition.name, "migration applied");
            report.applied.push(definition.name.clone());
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migrations complete"
        );
        Ok(report)
    }

    /// Pending definitions in the order `run` would apply them.
    ///
    /// Read-only: never creates the ledger.
    pub async fn plan(&self) -> Result<Vec<&'a MigrationDefinition>, MigrationError> {
        check_unique(self.definitions)?;

        let ledger = self.ledger();
        let mut pending = Vec::new();
        for definition in self.definitions {
            if !ledger
                .has_run(&definition.name)
                .await
                .map_err(MigrationError::Ledger)?
            {
                pending.push(definition);
            }
        }
        Ok(pending)
    }

    async fn apply(&self, definition: &MigrationDefinition) -> Result<(), MigrationError> {
        info!(
            migration = %definition.name,
            steps = definition.steps.len(),
            "applying migration"
        );

        for (index, step) in definition.steps.iter().enumerate() {
            match step.apply(self.executor).await {
                Ok(StepOutcome::Applied) => {
                    debug!(migration = %definition.name, step = index + 1, "{}", step.description);
                }
                Ok(StepOutcome::Skipped) => {
                    debug!(
                        migration = %definition.name,
                        step = index + 1,
                        "{} (already in place)",
                        step.description
                    );
                }
                Err(source) => {
                    error!(
                        migration = %definition.name,
                        step = index + 1,
                        description = %step.description,
                        error = %source,
                        "migration failed"
                    );
                    return Err(MigrationError::Definition {
                        name: definition.name.clone(),
                        step: index + 1,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn verify_checksums(&self, ledger: &Ledger<'a, E>) -> Result<(), MigrationError> {
        if self.checksum_policy == ChecksumPolicy::Ignore {
            return Ok(());
        }

        let records = ledger.records().await.map_err(MigrationError::Ledger)?;
        let recorded_checksums: HashMap<&str, &str> = records
            .iter()
            .filter_map(|r| r.checksum.as_deref().map(|c| (r.name.as_str(), c)))
            .collect();

        for definition in self.definitions {
            let Some(&recorded) = recorded_checksums.get(definition.name.as_str()) else {
                continue;
            };
            let current = definition.checksum();
            if recorded == current {
                continue;
            }

            match self.checksum_policy {
                ChecksumPolicy::Strict => {
                    error!(migration = %definition.name, recorded, current = %current, "checksum mismatch");
                    return Err(MigrationError::ChecksumMismatch {
                        name: definition.name.clone(),
                        recorded: recorded.to_string(),
                        current,
                    });
                }
                _ => {
                    warn!(
                        migration = %definition.name,
                        recorded,
                        current = %current,
                        "migration changed after it was applied"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Reject definition lists that reuse a name.
pub fn check_unique(definitions: &[MigrationDefinition]) -> Result<(), MigrationError> {
    let mut seen = HashSet::new();
    for definition in definitions {
        if !seen.insert(definition.name.as_str()) {
            return Err(MigrationError::DuplicateDefinition(definition.name.clone()));
        }
    }
    Ok(())
}

/// Run pending migrations, taking the advisory lock when configured.
pub async fn run_pending<S: SessionSource>(
    source: &S,
    definitions: &[MigrationDefinition],
    options: &MigrationsConfig,
) -> Result<RunReport, MigrationError> {
    match options.lock {
        LockMode::None => Migrator::new(source, definitions, options).run().await,
        LockMode::Advisory => {
            let session = source.pin().await.map_err(MigrationError::Lock)?;
            let migrator = Migrator::new(&session, definitions, options);
            with_advisory_lock(&session, options.advisory_lock_key, || migrator.run()).await
        }
    }
}
