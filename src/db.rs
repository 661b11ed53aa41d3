use crate::error::StoreError;
use crate::models::{Aggregates, Tx};
use crate::parser;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS txs (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  tx_id         TEXT NOT NULL,
  output_no     INTEGER NOT NULL,
  script_asm    TEXT NOT NULL,
  script_hex    TEXT NOT NULL,
  value         INTEGER NOT NULL, -- base units, 1e-8
  confirmations INTEGER NOT NULL,
  time          INTEGER NOT NULL,
  UNIQUE(tx_id, output_no)
);

CREATE INDEX IF NOT EXISTS idx_txs_value ON txs(value);
"#;

const TX_COLUMNS: &str =
    "tx_id, output_no, script_asm, script_hex, value, confirmations, time";

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// The four statistics the aggregate cache publishes.
///
/// `aggregates` runs them in the fixed order total, count, largest,
/// most recent and stops at the first hard failure. An empty ledger is
/// not a failure: the two row lookups just come back as `None`.
pub trait DonationStats: Send + Sync {
    fn total_amount(&self) -> Result<Decimal, StoreError>;
    fn count(&self) -> Result<i64, StoreError>;
    fn largest_donation(&self) -> Result<Tx, StoreError>;
    fn most_recent_donation(&self) -> Result<Tx, StoreError>;

    fn aggregates(&self) -> Result<Aggregates, StoreError> {
        Ok(Aggregates {
            total_amount: self.total_amount()?,
            count: self.count()?,
            largest: found(self.largest_donation())?,
            most_recent: found(self.most_recent_donation())?,
        })
    }
}

fn found(res: Result<Tx, StoreError>) -> Result<Option<Tx>, StoreError> {
    match res {
        Ok(tx) => Ok(Some(tx)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append-only, deduplicated ledger of received outputs.
///
/// One connection behind one mutex: the ingestion writer and every reader
/// are fully serialized, so nobody ever sees a half-written row.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already-migrated connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert one output; `Ok(false)` means it was already recorded.
    ///
    /// The value is converted before the lock is taken, so a malformed
    /// value never reaches the database.
    pub fn ingest(&self, tx: &Tx) -> Result<bool, StoreError> {
        let units = parser::to_base_units(&tx.value)?;

        let db = self.lock()?;
        let inserted = db.execute(
            r#"
            INSERT INTO txs (
                tx_id, output_no, script_asm, script_hex,
                value, confirmations, time
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tx_id, output_no) DO NOTHING
            "#,
            params![
                tx.tx_id,
                tx.output_no,
                tx.script_asm,
                tx.script_hex,
                units,
                tx.confirmations,
                tx.time
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Resumption cursor: tx id of the newest row, if any.
    pub fn last_tx_id(&self) -> Result<Option<String>, StoreError> {
        let db = self.lock()?;
        let id = db
            .query_row("SELECT tx_id FROM txs ORDER BY id DESC LIMIT 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(id)
    }
}

impl DonationStats for SqliteLedger {
    fn total_amount(&self) -> Result<Decimal, StoreError> {
        query_total(&*self.lock()?)
    }

    fn count(&self) -> Result<i64, StoreError> {
        query_count(&*self.lock()?)
    }

    fn largest_donation(&self) -> Result<Tx, StoreError> {
        query_largest(&*self.lock()?)?.ok_or(StoreError::NotFound("largest donation"))
    }

    fn most_recent_donation(&self) -> Result<Tx, StoreError> {
        query_most_recent(&*self.lock()?)?.ok_or(StoreError::NotFound("recent donation"))
    }

    // single lock hold: all four numbers describe the same ledger state
    fn aggregates(&self) -> Result<Aggregates, StoreError> {
        let db = self.lock()?;
        Ok(Aggregates {
            total_amount: query_total(&db)?,
            count: query_count(&db)?,
            largest: query_largest(&db)?,
            most_recent: query_most_recent(&db)?,
        })
    }
}

/// Summed in Rust: SQLite's integer SUM errors out past `i64::MAX`,
/// which any two large accepted rows can reach.
fn query_total(conn: &Connection) -> Result<Decimal, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT value FROM txs")?;
    let mut rows = stmt.query([])?;

    let mut units: i128 = 0;
    while let Some(row) = rows.next()? {
        units += i128::from(row.get::<_, i64>(0)?);
    }
    Ok(parser::total_from_base_units(units)?)
}

fn query_count(conn: &Connection) -> Result<i64, StoreError> {
    let count = conn.query_row("SELECT COUNT(*) FROM txs", [], |r| r.get(0))?;
    Ok(count)
}

/// Ties on value go to the earliest inserted row.
fn query_largest(conn: &Connection) -> Result<Option<Tx>, StoreError> {
    let sql = format!("SELECT {TX_COLUMNS} FROM txs ORDER BY value DESC, id ASC LIMIT 1");
    Ok(conn.query_row(&sql, [], row_to_tx).optional()?)
}

fn query_most_recent(conn: &Connection) -> Result<Option<Tx>, StoreError> {
    let sql = format!("SELECT {TX_COLUMNS} FROM txs ORDER BY id DESC LIMIT 1");
    Ok(conn.query_row(&sql, [], row_to_tx).optional()?)
}

fn row_to_tx(r: &Row<'_>) -> rusqlite::Result<Tx> {
    let units: i64 = r.get(4)?;
    Ok(Tx {
        tx_id: r.get(0)?,
        output_no: r.get(1)?,
        script_asm: r.get(2)?,
        script_hex: r.get(3)?,
        value: parser::from_base_units(units).to_string(),
        confirmations: r.get(5)?,
        time: r.get(6)?,
    })
}
