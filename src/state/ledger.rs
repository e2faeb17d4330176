//! Term/Vote Ledger
//!
//! Durable record of the current term, the vote cast in that term and the
//! last known commit index.

use std::path::PathBuf;
use rusqlite::{params, Connection, OptionalExtension};

use crate::log::{LogIndex, Term};
use crate::error::{Error, Result};

/// State that must survive restarts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    /// Latest term this node has seen
    pub current_term: Term,
    /// Candidate that received our vote in `current_term`
    pub voted_for: Option<String>,
    /// Highest index known committed (may lag behind the cluster)
    pub commit_index: LogIndex,
}

/// Storage seam for [`HardState`]
pub trait Ledger: Send {
    /// Load the persisted state (defaults for a fresh node)
    fn load(&self) -> Result<HardState>;

    /// Atomically persist term and vote
    fn save_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()>;

    /// Persist the commit index
    fn save_commit_index(&mut self, index: LogIndex) -> Result<()>;
}

/// Ledger backed by SQLite
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Create or open the ledger database in `data_dir`
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let conn = Connection::open(data_dir.join("ledger.db"))?;

        // FULL makes every commit fsync before returning
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self { conn })
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_int FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(|e| Error::Ledger(format!("Failed to read {}: {}", key, e)))?;
        Ok(value.flatten())
    }

    fn get_text(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_text FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| Error::Ledger(format!("Failed to read {}: {}", key, e)))?;
        Ok(value.flatten())
    }
}

impl Ledger for SqliteLedger {
    fn load(&self) -> Result<HardState> {
        Ok(HardState {
            current_term: self.get_int("current_term")?.unwrap_or(0) as Term,
            voted_for: self.get_text("voted_for")?,
            commit_index: self.get_int("commit_index")?.unwrap_or(0) as LogIndex,
        })
    }

    fn save_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES ('current_term', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![term as i64],
        )?;
        match voted_for {
            Some(id) => {
                tx.execute(
                    r#"
                    INSERT INTO node_state (key, value_text) VALUES ('voted_for', ?1)
                    ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![id],
                )?;
            }
            None => {
                tx.execute("DELETE FROM node_state WHERE key = 'voted_for'", [])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn save_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES ('commit_index', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = MAX(value_int, ?1), updated_at = CURRENT_TIMESTAMP
            "#,
            params![index as i64],
        )?;
        Ok(())
    }
}

/// In-memory ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: HardState,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn load(&self) -> Result<HardState> {
        Ok(self.state.clone())
    }

    fn save_vote(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        self.state.current_term = term;
        self.state.voted_for = voted_for.map(str::to_string);
        Ok(())
    }

    fn save_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.state.commit_index = self.state.commit_index.max(index);
        Ok(())
    }
}
