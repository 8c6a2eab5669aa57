use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, Transaction, params};

use super::{InvoiceRecord, InvoiceState, SHORT_CHAN_ID_HIGH_BIT};

/// Durable catalog of invoice secrets, an sqlite file at
/// `<data_dir>/wallet.db`.
///
/// Records only ever move from `registered` to `used`; nothing is deleted.
/// The stored `short_chan_id` has its high bit cleared, and every record
/// handed back to memory has it restored.
#[derive(Debug)]
pub struct InvoiceDb {
    conn: Connection,
    path: PathBuf,
}

impl InvoiceDb {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create wallet db dir {}", dir.display()))?;
        }

        let mut conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&mut conn).context("migrate wallet db schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts a new record and assigns its id.
    pub fn create(&mut self, record: &mut InvoiceRecord) -> Result<()> {
        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;

        self.conn
            .execute(
                r#"
INSERT INTO invoices (
  created_at,
  updated_at,
  preimage,
  payment_hash,
  payment_secret,
  key_path,
  short_chan_id,
  amount_sat,
  state,
  used_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
)
"#,
                params![
                    record.created_at,
                    record.updated_at,
                    &record.preimage,
                    &record.payment_hash,
                    &record.payment_secret,
                    &record.key_path,
                    stored_short_chan_id(record.short_chan_id),
                    record.amount_sat,
                    state_to_str(record.state),
                    record.used_at,
                ],
            )
            .with_context(|| format!("insert invoice {}", hex::encode(&record.payment_hash)))?;

        record.id = self.conn.last_insert_rowid();
        record.short_chan_id |= SHORT_CHAN_ID_HIGH_BIT;
        Ok(())
    }

    /// Upserts by primary key. A record without an id is inserted.
    pub fn save(&mut self, record: &mut InvoiceRecord) -> Result<()> {
        if record.id == 0 {
            return self.create(record);
        }

        record.updated_at = Utc::now();
        let rows = self
            .conn
            .execute(
                r#"
UPDATE invoices
SET updated_at = ?2,
    preimage = ?3,
    payment_hash = ?4,
    payment_secret = ?5,
    key_path = ?6,
    short_chan_id = ?7,
    amount_sat = ?8,
    state = ?9,
    used_at = ?10
WHERE id = ?1
"#,
                params![
                    record.id,
                    record.updated_at,
                    &record.preimage,
                    &record.payment_hash,
                    &record.payment_secret,
                    &record.key_path,
                    stored_short_chan_id(record.short_chan_id),
                    record.amount_sat,
                    state_to_str(record.state),
                    record.used_at,
                ],
            )
            .with_context(|| format!("save invoice {}", record.id))?;
        anyhow::ensure!(rows == 1, "invoice not found: {}", record.id);

        record.short_chan_id |= SHORT_CHAN_ID_HIGH_BIT;
        Ok(())
    }

    /// Returns a Registered record, or `None` when every secret has been
    /// used. Selection follows rowid order, so it is deterministic for a
    /// given store state.
    pub fn find_first_unused(&self) -> Result<Option<InvoiceRecord>> {
        self.conn
            .query_row(
                &format!("{SELECT_INVOICE} WHERE state = 'registered' ORDER BY id LIMIT 1"),
                [],
                row_to_invoice,
            )
            .optional()
            .context("find first unused invoice")
    }

    pub fn count_unused(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM invoices WHERE state = 'registered'",
                [],
                |row| row.get(0),
            )
            .context("count unused invoices")
    }

    /// Exact-match lookup. Absence is reported as `None`; the caller
    /// decides whether that is a protocol violation.
    pub fn find_by_payment_hash(&self, payment_hash: &[u8]) -> Result<Option<InvoiceRecord>> {
        self.conn
            .query_row(
                &format!("{SELECT_INVOICE} WHERE payment_hash = ?1 LIMIT 1"),
                params![payment_hash],
                row_to_invoice,
            )
            .optional()
            .with_context(|| format!("find invoice by payment hash {}", hex::encode(payment_hash)))
    }

    /// Transitions a record to Used, recording the invoice amount. The
    /// update is conditional on the record still being Registered, which
    /// makes it the linearization point between concurrent callers that
    /// read the same unused record.
    pub fn mark_used(&mut self, id: i64, amount_sat: i64) -> Result<()> {
        let now = Utc::now();
        let rows = self
            .conn
            .execute(
                r#"
UPDATE invoices
SET state = 'used',
    amount_sat = ?2,
    used_at = ?3,
    updated_at = ?3
WHERE id = ?1 AND state = 'registered'
"#,
                params![id, amount_sat, now],
            )
            .with_context(|| format!("mark invoice {id} used"))?;
        anyhow::ensure!(rows == 1, "invoice {id} is missing or already used");
        Ok(())
    }

    /// Best-effort release; failures are logged, not propagated.
    pub fn close(self) {
        if let Err((_conn, err)) = self.conn.close() {
            tracing::warn!(error = %err, "error closing the wallet db");
        }
    }
}

const SELECT_INVOICE: &str = r#"
SELECT
  id,
  created_at,
  updated_at,
  preimage,
  payment_hash,
  payment_secret,
  key_path,
  short_chan_id,
  amount_sat,
  state,
  used_at
FROM invoices
"#;

fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let short_chan_id: i64 = row.get(7)?;
    let state_str: String = row.get(9)?;
    let state = state_from_str(&state_str, 9)?;

    Ok(InvoiceRecord {
        id: row.get(0)?,
        created_at: row.get::<_, DateTime<Utc>>(1)?,
        updated_at: row.get::<_, DateTime<Utc>>(2)?,
        preimage: row.get(3)?,
        payment_hash: row.get(4)?,
        payment_secret: row.get(5)?,
        key_path: row.get(6)?,
        short_chan_id: short_chan_id as u64 | SHORT_CHAN_ID_HIGH_BIT,
        amount_sat: row.get(8)?,
        state,
        used_at: row.get::<_, Option<DateTime<Utc>>>(10)?,
    })
}

// sqlite integers are signed; the high bit is cleared on disk and
// restored on every read.
fn stored_short_chan_id(short_chan_id: u64) -> i64 {
    (short_chan_id & !SHORT_CHAN_ID_HIGH_BIT) as i64
}

fn state_to_str(state: InvoiceState) -> &'static str {
    match state {
        InvoiceState::Registered => "registered",
        InvoiceState::Used => "used",
    }
}

fn state_from_str(s: &str, col: usize) -> rusqlite::Result<InvoiceState> {
    match s {
        "registered" => Ok(InvoiceState::Registered),
        "used" => Ok(InvoiceState::Used),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown invoice state: {other}").into(),
        )),
    }
}

const CREATE_INVOICES_TABLE: &str = r#"
CREATE TABLE invoices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  preimage BLOB NOT NULL,
  payment_hash BLOB NOT NULL,
  payment_secret BLOB NOT NULL,
  key_path TEXT NOT NULL,
  short_chan_id INTEGER NOT NULL,
  state TEXT NOT NULL,
  used_at TEXT
);
CREATE INDEX invoices_payment_hash_idx ON invoices(payment_hash);
"#;

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (id TEXT PRIMARY KEY, applied_at TEXT NOT NULL);",
    )
    .context("create migrations table")?;

    apply_migration(conn, "initial", |tx| {
        // The invoices table can predate its migration marker: migrations
        // once ran outside a transaction and at least one install ended up
        // with the table created but never recorded. Adopt it instead of
        // failing.
        if !table_exists(tx, "invoices")? {
            tx.execute_batch(CREATE_INVOICES_TABLE)
                .context("create invoices table")?;
        }
        Ok(())
    })?;

    apply_migration(conn, "add amount_sat to invoices", |tx| {
        let columns = table_columns(tx, "invoices").context("read invoices columns")?;
        if !columns.contains("amount_sat") {
            tx.execute(
                "ALTER TABLE invoices ADD COLUMN amount_sat INTEGER NOT NULL DEFAULT 0",
                [],
            )
            .context("add column invoices.amount_sat")?;
        }
        Ok(())
    })?;

    Ok(())
}

fn apply_migration(
    conn: &mut Connection,
    id: &str,
    run: impl FnOnce(&Transaction<'_>) -> Result<()>,
) -> Result<()> {
    let applied: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM migrations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .with_context(|| format!("check migration {id:?}"))?;
    if applied > 0 {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .with_context(|| format!("begin migration {id:?}"))?;
    run(&tx).with_context(|| format!("run migration {id:?}"))?;
    tx.execute(
        "INSERT INTO migrations (id, applied_at) VALUES (?1, ?2)",
        params![id, Utc::now()],
    )
    .with_context(|| format!("record migration {id:?}"))?;
    tx.commit().with_context(|| format!("commit migration {id:?}"))
}

fn table_exists(tx: &Transaction<'_>, table: &str) -> Result<bool> {
    let count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .with_context(|| format!("check table {table}"))?;
    Ok(count > 0)
}

fn table_columns(tx: &Transaction<'_>, table: &str) -> Result<HashSet<String>> {
    let mut stmt = tx
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("prepare PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([]).context("query PRAGMA table_info")?;

    let mut out = HashSet::new();
    while let Some(row) = rows.next().context("read PRAGMA row")? {
        let name: String = row.get(1)?;
        out.insert(name);
    }
    Ok(out)
}
