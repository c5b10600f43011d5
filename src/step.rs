//! Guarded schema steps
//!
//! An idempotent step is a guard plus an effect. The guard is a boolean
//! catalog query; the effect only runs when it answers `true`. Steps with
//! no guard must carry their own (`IF NOT EXISTS`, `DO $$ ... $$`).
//!
//! Because the runner never wraps a definition in a transaction, every step
//! has to be safe to re-run after a crash between any two steps.

use std::fmt;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Executor;

/// Existence predicate over the current schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    TableExists(String),
    TableMissing(String),
    ColumnExists { table: String, column: String },
    ColumnMissing { table: String, column: String },
    IndexExists(String),
    IndexMissing(String),
    TypeExists(String),
    TypeMissing(String),
    ConstraintExists { table: String, name: String },
    ConstraintMissing { table: String, name: String },
    All(Vec<Guard>),
}

impl Guard {
    pub fn table_exists(table: impl Into<String>) -> Self {
        Guard::TableExists(table.into())
    }

    pub fn table_missing(table: impl Into<String>) -> Self {
        Guard::TableMissing(table.into())
    }

    pub fn column_exists(table: impl Into<String>, column: impl Into<String>) -> Self {
        Guard::ColumnExists {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn column_missing(table: impl Into<String>, column: impl Into<String>) -> Self {
        Guard::ColumnMissing {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn index_exists(index: impl Into<String>) -> Self {
        Guard::IndexExists(index.into())
    }

    pub fn index_missing(index: impl Into<String>) -> Self {
        Guard::IndexMissing(index.into())
    }

    pub fn type_exists(name: impl Into<String>) -> Self {
        Guard::TypeExists(name.into())
    }

    pub fn type_missing(name: impl Into<String>) -> Self {
        Guard::TypeMissing(name.into())
    }

    pub fn constraint_exists(table: impl Into<String>, name: impl Into<String>) -> Self {
        Guard::ConstraintExists {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn constraint_missing(table: impl Into<String>, name: impl Into<String>) -> Self {
        Guard::ConstraintMissing {
            table: table.into(),
            name: name.into(),
        }
    }

    /// Conjunction, flattening nested `All`s.
    pub fn and(self, other: Guard) -> Guard {
        let mut guards = match self {
            Guard::All(guards) => guards,
            guard => vec![guard],
        };
        match other {
            Guard::All(more) => guards.extend(more),
            guard => guards.push(guard),
        }
        Guard::All(guards)
    }

    /// Boolean SQL expression for this guard.
    pub fn predicate(&self) -> String {
        match self {
            Guard::TableExists(table) => table_exists(table),
            Guard::TableMissing(table) => format!("NOT {}", table_exists(table)),
            Guard::ColumnExists { table, column } => column_exists(table, column),
            Guard::ColumnMissing { table, column } => format!("NOT {}", column_exists(table, column)),
            Guard::IndexExists(index) => index_exists(index),
            Guard::IndexMissing(index) => format!("NOT {}", index_exists(index)),
            Guard::TypeExists(name) => type_exists(name),
            Guard::TypeMissing(name) => format!("NOT {}", type_exists(name)),
            Guard::ConstraintExists { table, name } => constraint_exists(table, name),
            Guard::ConstraintMissing { table, name } => {
                format!("NOT {}", constraint_exists(table, name))
            }
            Guard::All(guards) if guards.is_empty() => "TRUE".to_string(),
            Guard::All(guards) => guards
                .iter()
                .map(|g| format!("({})", g.predicate()))
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }

    /// The query the runner sends; one row, one `applies` column.
    pub fn to_sql(&self) -> String {
        format!("SELECT {} AS applies", self.predicate())
    }
}

fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn table_exists(table: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = {})",
        literal(table)
    )
}

fn column_exists(table: &str, column: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM information_schema.columns WHERE table_schema = current_schema() AND table_name = {} AND column_name = {})",
        literal(table),
        literal(column)
    )
}

fn index_exists(index: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = current_schema() AND indexname = {})",
        literal(index)
    )
}

fn type_exists(name: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM pg_type t JOIN pg_namespace n ON n.oid = t.typnamespace WHERE n.nspname = current_schema() AND t.typname = {})",
        literal(name)
    )
}

fn constraint_exists(table: &str, name: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM pg_constraint c JOIN pg_class r ON r.oid = c.conrelid JOIN pg_namespace n ON n.oid = r.relnamespace WHERE n.nspname = current_schema() AND r.relname = {} AND c.conname = {})",
        literal(table),
        literal(name)
    )
}

/// What happened when a step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// The guard said the change is already in place.
    Skipped,
}

/// One idempotent schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub description: String,
    pub guard: Option<Guard>,
    pub effect: String,
}

impl Step {
    /// A self-guarded statement.
    pub fn sql(description: impl Into<String>, effect: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            guard: None,
            effect: effect.into(),
        }
    }

    /// A statement that only runs while `guard` holds.
    pub fn when(guard: Guard, description: impl Into<String>, effect: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            guard: Some(guard),
            effect: effect.into(),
        }
    }

    /// `ALTER TABLE old RENAME TO new`, only if `old` exists and `new` doesn't.
    pub fn rename_table(old: &str, new: &str) -> Self {
        Self::when(
            Guard::table_exists(old).and(Guard::table_missing(new)),
            format!("rename table {} to {}", old, new),
            format!("ALTER TABLE {} RENAME TO {}", old, new),
        )
    }

    pub fn rename_column(table: &str, old: &str, new: &str) -> Self {
        Self::when(
            Guard::column_exists(table, old).and(Guard::column_missing(table, new)),
            format!("rename column {}.{} to {}", table, old, new),
            format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, old, new),
        )
    }

    pub fn rename_index(old: &str, new: &str) -> Self {
        Self::when(
            Guard::index_exists(old).and(Guard::index_missing(new)),
            format!("rename index {} to {}", old, new),
            format!("ALTER INDEX {} RENAME TO {}", old, new),
        )
    }

    pub fn rename_type(old: &str, new: &str) -> Self {
        Self::when(
            Guard::type_exists(old).and(Guard::type_missing(new)),
            format!("rename type {} to {}", old, new),
            format!("ALTER TYPE {} RENAME TO {}", old, new),
        )
    }

    /// Renaming a primary key or unique constraint renames its index too.
    pub fn rename_constraint(table: &str, old: &str, new: &str) -> Self {
        Self::when(
            Guard::constraint_exists(table, old).and(Guard::constraint_missing(table, new)),
            format!("rename constraint {}.{} to {}", table, old, new),
            format!("ALTER TABLE {} RENAME CONSTRAINT {} TO {}", table, old, new),
        )
    }

    /// Add a column to an existing table.
    pub fn add_column(table: &str, column: &str, definition: &str) -> Self {
        Self::when(
            Guard::table_exists(table).and(Guard::column_missing(table, column)),
            format!("add column {}.{}", table, column),
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                table, column, definition
            ),
        )
    }

    /// Guard and effect as one block of SQL; checksums and plans use this.
    pub fn rendered(&self) -> String {
        match &self.guard {
            Some(guard) => format!("-- when: {}\n{};", guard.predicate(), self.effect),
            None => format!("{};", self.effect),
        }
    }

    /// Evaluate the guard and, if it holds, run the effect.
    pub async fn apply<E: Executor>(&self, executor: &E) -> GatewayResult<StepOutcome> {
        if let Some(guard) = &self.guard {
            let rows = executor.execute(&guard.to_sql(), &[]).await?;
            let applies = rows
                .first()
                .ok_or_else(|| GatewayError::Decode("guard returned no rows".to_string()))?
                .bool("applies")?;
            if !applies {
                return Ok(StepOutcome::Skipped);
            }
        }

        executor.execute(&self.effect, &[]).await?;
        Ok(StepOutcome::Applied)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.guard {
            Some(_) => write!(f, "{} (guarded)", self.description),
            None => write!(f, "{}", self.description),
        }
    }
}
