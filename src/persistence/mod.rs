//! SQLite persistence for trader state.
//!
//! Every trader owns one JSON document keyed by its id. Documents are written
//! at the end of each cycle and read back when the trader is initialized.

use crate::trader::{TraderError, TraderState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Summary row for `mmbot status`.
#[derive(Debug, Clone)]
pub struct StoredTrader {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub position: f64,
    pub trades: usize,
    pub stopped: bool,
}

/// SQLite-based store of trader documents.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open the store, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("State store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("State store lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trader_state (
                trader_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Write the state document of `id`.
    pub fn save(&self, id: &str, state: &TraderState) -> Result<()> {
        let document = serde_json::to_string(state).context("Failed to serialize trader state")?;
        self.conn()?.execute(
            r#"
            INSERT INTO trader_state (trader_id, document, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(trader_id) DO UPDATE SET
                document = ?2,
                updated_at = ?3
            "#,
            params![id, document, Utc::now().to_rfc3339()],
        )?;
        debug!(trader = %id, position = state.position, "State saved");
        Ok(())
    }

    /// Read the state document of `id`. A document that does not parse is
    /// reported as `TraderError::CorruptState`.
    pub fn load(&self, id: &str) -> Result<Option<TraderState>> {
        let document: Option<String> = self
            .conn()?
            .query_row(
                "SELECT document FROM trader_state WHERE trader_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(document) = document else {
            return Ok(None);
        };

        match serde_json::from_str(&document) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(TraderError::CorruptState {
                id: id.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    pub fn erase(&self, id: &str) -> Result<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM trader_state WHERE trader_id = ?1", params![id])?;
        if removed > 0 {
            info!(trader = %id, "Trader state erased");
        }
        Ok(())
    }

    /// All stored traders; unreadable documents are skipped with a warning.
    pub fn list(&self) -> Result<Vec<StoredTrader>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT trader_id, document, updated_at FROM trader_state ORDER BY trader_id",
        )?;

        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut out = Vec::with_capacity(rows.len());
        for (id, document, updated_at) in rows {
            let state: TraderState = match serde_json::from_str(&document) {
                Ok(s) => s,
                Err(e) => {
                    warn!(trader = %id, error = %e, "Skipping unreadable state");
                    continue;
                }
            };
            out.push(StoredTrader {
                id,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                position: state.position,
                trades: state.trades.len(),
                stopped: state.stopped,
            });
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, id: &str, document: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO trader_state (trader_id, document, updated_at) VALUES (?1, ?2, ?3)",
            params![id, document, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_state() {
        let store = StateStore::in_memory().unwrap();
        let mut state = TraderState::fresh(42, false);
        state.position = 1.25;
        state.trade_lastid = Some("17".to_string());

        store.save("btc", &state).unwrap();
        let loaded = store.load("btc").unwrap().unwrap();
        assert_eq!(loaded, state);

        state.position = 2.0;
        store.save("btc", &state).unwrap();
        assert_eq!(store.load("btc").unwrap().unwrap().position, 2.0);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_and_erased() {
        let store = StateStore::in_memory().unwrap();
        assert!(store.load("nobody").unwrap().is_none());

        store.save("eth", &TraderState::fresh(1, false)).unwrap();
        store.erase("eth").unwrap();
        assert!(store.load("eth").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let store = StateStore::in_memory().unwrap();
        store.put_raw("bad", "{not json").unwrap();

        let err = store.load("bad").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraderError>(),
            Some(TraderError::CorruptState { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }
}
