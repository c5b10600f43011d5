//! locket-migrate - schema migrations for the locket database
//!
//! Ordered, idempotent, self-healing schema evolution that runs against a
//! live PostgreSQL database on every boot.
//!
//! Layers, leaves first:
//! - `gateway`: pooled query execution with transient-failure retry
//! - `readiness`: wait for the database to accept queries
//! - `ledger`: the `schema_migrations` table
//! - `step` / `migration`: guarded schema changes and named definitions
//! - `definitions`: the locket schema, in declaration order
//! - `runner`: apply pending definitions, fail fast
//! - `startup`: once-per-process initialization gate
//! - `status`: read-only view of what has run
//!
//! # Example
//! ```no_run
//! use locket_migrate::prelude::*;
//!
//! # async fn boot() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let gateway = QueryGateway::connect_lazy(config.database_url()?, &config.pool, config.retry)?;
//! let startup = Startup::new(gateway, definitions::all())
//!     .with_readiness(config.readiness)
//!     .with_migrations(config.migrations.clone());
//! startup.initialize().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod definitions;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod lock;
pub mod migration;
pub mod readiness;
pub mod retry;
pub mod runner;
pub mod startup;
pub mod status;
pub mod step;

pub use config::Config;
pub use error::{ConfigError, GatewayError, GatewayResult, MigrationError};
pub use gateway::{Executor, QueryGateway, SessionSource};
pub use migration::{MigrationDefinition, MigrationRecord};
pub use runner::{Migrator, RunReport, run_pending};
pub use startup::{Initialization, Startup};

/// Common imports for embedding the migrator in an application.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::definitions;
    pub use crate::error::{GatewayError, MigrationError};
    pub use crate::gateway::{Executor, QueryGateway, SessionSource, Value};
    pub use crate::migration::{MigrationDefinition, MigrationRecord};
    pub use crate::runner::{ChecksumPolicy, Migrator, RunReport, run_pending};
    pub use crate::startup::{Initialization, Startup};
    pub use crate::status::{StatusReport, status};
    pub use crate::step::{Guard, Step};
}
