//! Durable ranking of historical winners backed by SQLite

use crate::error::StoreError;
use log::info;
use rusqlite::{params, Connection, Row};
use shared::RankingEntry;
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS historical_winners (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    time REAL NOT NULL,
    hash_count INTEGER NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

const SELECT_COLUMNS: &str = "SELECT id, username, time, hash_count, created_at FROM historical_winners";

/// One confirmed winner. Never modified after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalRecord {
    pub id: i64,
    pub username: String,
    pub time: f64,
    pub hash_count: u64,
    pub created_at: String,
}

impl From<HistoricalRecord> for RankingEntry {
    fn from(record: HistoricalRecord) -> Self {
        RankingEntry {
            username: record.username,
            time: record.time,
            hash_count: record.hash_count,
        }
    }
}

/// Append-only store of winners, queried fastest first
pub struct ResultStore {
    conn: Connection,
}

impl ResultStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::init(Connection::open(path)?)?;
        info!("Historical results stored in {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Records a winner and returns the stored row
    pub fn append(
        &self,
        username: &str,
        time: f64,
        hash_count: u64,
    ) -> Result<HistoricalRecord, StoreError> {
        let hash_count = i64::try_from(hash_count).unwrap_or(i64::MAX);
        self.conn.execute(
            "INSERT INTO historical_winners (username, time, hash_count) VALUES (?1, ?2, ?3)",
            params![username, time, hash_count],
        )?;
        let id = self.conn.last_insert_rowid();
        let record = self.conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?1"),
            params![id],
            record_from_row,
        )?;
        Ok(record)
    }

    /// Up to `n` records ordered by time ascending; ties keep insertion order
    pub fn top_n(&self, n: usize) -> Result<Vec<HistoricalRecord>, StoreError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY time ASC, id ASC LIMIT ?1"))?;
        let records = stmt
            .query_map(params![limit], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Ranking rows in wire form
    pub fn ranking(&self, n: usize) -> Result<Vec<RankingEntry>, StoreError> {
        Ok(self.top_n(n)?.into_iter().map(RankingEntry::from).collect())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoricalRecord> {
    let hash_count: i64 = row.get(3)?;
    Ok(HistoricalRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        time: row.get(2)?,
        hash_count: u64::try_from(hash_count).unwrap_or(0),
        created_at: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
    })
}
