use serde::{Deserialize, Serialize};

/// Terminal failures of a migration run.
///
/// Every variant aborts the run immediately and carries the raw values the
/// check was made against; the display strings are presentation only.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MigrateError {
    #[error("the ledger auto-increment sequence is {high_water_mark} but the table holds {row_count} rows; the migration table was manipulated by hand and must be repaired before migrating again")]
    LedgerCorrupted { high_water_mark: i64, row_count: i64 },

    #[error("{provided} migrations were provided but {applied} have already run against this database; the desired sequence must include every migration that was ever applied")]
    InsufficientMigrationsProvided { provided: usize, applied: usize },

    #[error("migration at index {index} does not match ledger row {row}\nprovided:\n{provided_source}\nledger:\n{ledger_source}")]
    SourceDrift {
        index: usize,
        row: i64,
        provided_source: String,
        ledger_source: String,
    },

    #[error("error running migration {index}\n{}\n{cause}", render_migration(.migration))]
    ExecutionFailed {
        index: usize,
        migration: Migration,
        cause: String,
    },
}

/// A bind parameter value, mirroring the `SQLite` storage classes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One migration statement with its ordered bind parameters.
///
/// Identity is positional: the Nth migration of the desired sequence
/// corresponds to the Nth ledger row ever recorded. Only `source` is
/// persisted; `parameters` exist for execution and never participate in
/// drift detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Migration {
    pub source: String,
    #[serde(default)]
    pub parameters: Vec<SqlValue>,
}

impl Migration {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), parameters: Vec::new() }
    }

    #[must_use]
    pub fn with_parameters(source: impl Into<String>, parameters: Vec<SqlValue>) -> Self {
        Self { source: source.into(), parameters }
    }
}

/// A ledger row: one migration recorded as applied, ordered by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppliedMigration {
    pub id: i64,
    pub source: String,
}

/// Decide which migrations of `desired` still have to run.
///
/// The ledger's structural integrity is validated before it is trusted for
/// any comparison: the auto-increment high-water-mark must equal the row
/// count, otherwise the table was edited by hand. Only then are lengths
/// checked, and only then the overlapping prefix compared by exact source
/// equality. This order matters: a corrupted ledger must be caught even when
/// `desired` is empty, and a too-short `desired` must be caught before a
/// content comparison that would spuriously pass on an empty overlap.
///
/// On success returns the suffix of `desired` that has not yet been applied,
/// in original order.
///
/// # Errors
/// Returns [`MigrateError::LedgerCorrupted`] when the high-water-mark and
/// row count disagree, [`MigrateError::InsufficientMigrationsProvided`] when
/// the caller supplied fewer migrations than have already run, and
/// [`MigrateError::SourceDrift`] when a previously applied migration's
/// source no longer matches the ledger.
pub fn reconcile<'a>(
    desired: &'a [Migration],
    ledger: &[AppliedMigration],
    high_water_mark: i64,
) -> Result<&'a [Migration], MigrateError> {
    let row_count = i64::try_from(ledger.len()).unwrap_or(i64::MAX);
    if high_water_mark != row_count {
        return Err(MigrateError::LedgerCorrupted { high_water_mark, row_count });
    }

    if desired.len() < ledger.len() {
        return Err(MigrateError::InsufficientMigrationsProvided {
            provided: desired.len(),
            applied: ledger.len(),
        });
    }

    for (index, (provided, applied)) in desired.iter().zip(ledger).enumerate() {
        if provided.source != applied.source {
            return Err(MigrateError::SourceDrift {
                index,
                row: applied.id,
                provided_source: provided.source.clone(),
                ledger_source: applied.source.clone(),
            });
        }
    }

    Ok(&desired[ledger.len()..])
}

fn render_migration(migration: &Migration) -> String {
    serde_json::to_string_pretty(migration).unwrap_or_else(|_| migration.source.clone())
}
