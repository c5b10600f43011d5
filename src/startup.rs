//! Startup orchestrator
//!
//! Construct one [`Startup`] when the process starts and share it with
//! whatever triggers boot (first request, explicit hook). The first
//! successful [`Startup::initialize`] waits for the database and applies
//! migrations; later calls return immediately. A failed attempt leaves the
//! flag unset so the next call starts over.

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MigrationsConfig;
use crate::error::MigrationError;
use crate::gateway::SessionSource;
use crate::migration::MigrationDefinition;
use crate::readiness::{ReadinessConfig, wait_until_ready};
use crate::runner::{RunReport, run_pending};

/// Result of [`Startup::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initialization {
    /// This call waited for the database and ran the migrations.
    Performed(RunReport),
    /// An earlier call in this process already did.
    AlreadyInitialized,
}

pub struct Startup<S> {
    source: S,
    definitions: Vec<MigrationDefinition>,
    readiness: ReadinessConfig,
    migrations: MigrationsConfig,
    initialized: Mutex<bool>,
}

impl<S: SessionSource> Startup<S> {
    pub fn new(source: S, definitions: Vec<MigrationDefinition>) -> Self {
        Self {
            source,
            definitions,
            readiness: ReadinessConfig::default(),
            migrations: MigrationsConfig::default(),
            initialized: Mutex::new(false),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_migrations(mut self, migrations: MigrationsConfig) -> Self {
        self.migrations = migrations;
        self
    }

    /// Wait for the database, then apply pending migrations, once.
    ///
    /// Concurrent callers in the same process are serialized; only the
    /// first does the work.
    pub async fn initialize(&self) -> Result<Initialization, MigrationError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            debug!("already initialized");
            return Ok(Initialization::AlreadyInitialized);
        }

        info!(definitions = self.definitions.len(), "initializing database");
        wait_until_ready(&self.source, &self.readiness).await?;
        let report = run_pending(&self.source, &self.definitions, &self.migrations).await?;

        *initialized = true;
        info!(applied = report.applied.len(), "database initialized");
        Ok(Initialization::Performed(report))
    }

    /// Forget that initialization happened. Tests and development only.
    pub async fn reset(&self) {
        *self.initialized.lock().await = false;
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    /// The executor, for the rest of the application to share.
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn definitions(&self) -> &[MigrationDefinition] {
        &self.definitions
    }
}
