use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use stepwise_core::{reconcile, AppliedMigration, MigrateError, Migration, SqlValue};

const LEDGER_TABLE: &str = "stepwise_migrations";

const CREATE_LEDGER_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS stepwise_migrations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source TEXT NOT NULL
);
";

/// Narrow interface over the bookkeeping table.
///
/// All ledger state lives in the database itself and is re-read on every
/// invocation; this type is only a borrowed view over the caller's
/// connection.
pub struct Ledger<'conn> {
    conn: &'conn Connection,
}

impl<'conn> Ledger<'conn> {
    #[must_use]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Create the bookkeeping table if it does not exist yet. Idempotent.
    ///
    /// # Errors
    /// Returns an error when the table cannot be created.
    pub fn ensure_table(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_LEDGER_TABLE_SQL)
            .context("failed to create migration ledger table")?;
        Ok(())
    }

    /// Read every recorded migration, ordered by ascending id.
    ///
    /// # Errors
    /// Returns an error when the ledger rows cannot be read.
    pub fn read_all(&self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, source FROM stepwise_migrations ORDER BY id ASC")
            .context("failed to prepare migration ledger read")?;

        let rows = stmt
            .query_map([], |row| Ok(AppliedMigration { id: row.get(0)?, source: row.get(1)? }))?;

        let mut applied = Vec::new();
        for row in rows {
            applied.push(row.context("failed to read migration ledger row")?);
        }
        Ok(applied)
    }

    /// The auto-increment high-water-mark for the ledger table: the highest
    /// row id ever issued, or 0 when no row has ever been inserted.
    ///
    /// # Errors
    /// Returns an error when the `sqlite_sequence` counter cannot be read.
    pub fn high_water_mark(&self) -> Result<i64> {
        if !table_exists(self.conn, "sqlite_sequence")? {
            return Ok(0);
        }

        let sequence = self
            .conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                params![LEDGER_TABLE],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read ledger auto-increment sequence")?;

        Ok(sequence.unwrap_or(0))
    }

    /// Record one applied migration and return the id the database assigned.
    ///
    /// # Errors
    /// Returns an error when the row cannot be inserted.
    pub fn append(&self, source: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO stepwise_migrations(source) VALUES (?1)", params![source])
            .context("failed to record applied migration")?;
        Ok(self.conn.last_insert_rowid())
    }
}

/// Bring the database's schema up to date with the desired sequence.
///
/// Ensures the ledger table exists, validates the ledger against the desired
/// sequence, and applies the migrations that have not run yet, in order.
/// Each new migration and its ledger entry are committed as one transaction;
/// a failure after N successes leaves exactly those N rows committed, and a
/// later call with a corrected sequence resumes from that point.
///
/// Returns the number of migrations newly applied.
///
/// # Errors
/// Fails with a [`MigrateError`] when the ledger is corrupted, the desired
/// sequence is shorter than what has already run, an applied migration's
/// source has drifted, or the engine rejects a new migration's statement.
/// Engine-level failures outside migration execution are reported with
/// context.
pub fn migrate(conn: &mut Connection, desired: &[Migration]) -> Result<usize> {
    let pending = {
        let ledger = Ledger::new(conn);
        ledger.ensure_table()?;
        let applied = ledger.read_all()?;
        let high_water_mark = ledger.high_water_mark()?;
        reconcile(desired, &applied, high_water_mark)?
    };

    for (index, migration) in pending.iter().enumerate() {
        apply_one(conn, index, migration)?;
    }

    Ok(pending.len())
}

fn apply_one(conn: &mut Connection, index: usize, migration: &Migration) -> Result<()> {
    let tx = conn.transaction().context("failed to start migration transaction")?;

    // A parameterless migration may be a multi-statement script; a
    // parameterized one must be a single bindable statement.
    let executed = if migration.parameters.is_empty() {
        tx.execute_batch(&migration.source)
    } else {
        tx.execute(&migration.source, params_from_iter(migration.parameters.iter().map(bind_value)))
            .map(|_| ())
    };

    if let Err(err) = executed {
        return Err(MigrateError::ExecutionFailed {
            index,
            migration: migration.clone(),
            cause: err.to_string(),
        }
        .into());
    }

    Ledger::new(&tx).append(&migration.source)?;
    tx.commit().context("failed to commit migration transaction")
}

fn bind_value(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(value) => rusqlite::types::Value::Integer(*value),
        SqlValue::Real(value) => rusqlite::types::Value::Real(*value),
        SqlValue::Text(value) => rusqlite::types::Value::Text(value.clone()),
        SqlValue::Blob(value) => rusqlite::types::Value::Blob(value.clone()),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}
