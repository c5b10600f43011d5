//! Migration definitions and ledger records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::step::Step;

/// A named, ordered list of idempotent steps.
///
/// Definitions are compiled into the binary and never edited once shipped.
/// The checksum makes a later edit detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub name: String,
    pub steps: Vec<Step>,
}

impl MigrationDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step (builder style).
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Hex SHA-256 over the rendered SQL of every step, in order.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            hasher.update(step.rendered().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// A row of the ledger table. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub name: String,
    pub executed_at: DateTime<Utc>,
    /// `None` for rows written before checksums were recorded.
    pub checksum: Option<String>,
}
