//! The persistence store: an embedded SQLite database holding the
//! network model and its schema-migration metadata.
//!
//! All operations are synchronous. The store adds no locking of its
//! own beyond the journal; callers share it behind one process-wide
//! mutex and keep lock scopes away from suspension points.

use iqrfd_api::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub mod entity;
mod migrate;

mod device;
mod driver;
mod product;
mod sensor;
mod standards;

pub use entity::*;

/// Shared handle the daemon components hold. The mutex is the
/// process-wide gate required by the store contract.
pub type SharedStore = std::sync::Arc<std::sync::Mutex<Store>>;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (creating if missing) the database at `path`, switches
    /// on write-ahead journaling and foreign keys, and applies any
    /// pending migrations from `migration_dir` in lexical order of
    /// their file stems.
    pub fn open(path: &Path, migration_dir: &Path) -> Result<Store> {
        let conn = Connection::open(path).map_err(|e| {
            Error::StoreError(format!(
                "couldn't open database '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut store = Store { conn };

        store.init()?;

        let applied = migrate::apply(&store.conn, migration_dir)?;

        if applied > 0 {
            info!("applied {} schema migration(s)", applied);
        }
        Ok(store)
    }

    /// An in-memory store with the full schema applied. Backs the
    /// test suite; the journal pragma is skipped since memory
    /// databases don't support WAL.
    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::StoreError(format!("{}", e)))?;
        let store = Store { conn };

        store
            .conn
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| Error::StoreError(format!("{}", e)))?;
        migrate::apply_statements(
            &store.conn,
            include_str!("../../migrations/20230101000000_initial.sql"),
            "initial",
        )?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .and_then(|_| self.conn.pragma_update(None, "foreign_keys", "ON"))
            .map_err(|e| {
                Error::StoreError(format!("couldn't initialize journal: {}", e))
            })
    }

    /// Starts an explicit transaction. The enumerator batches each
    /// device's reconciliation this way so a failure rolls back that
    /// device's mutations only.
    pub fn begin(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN")
            .map_err(|e| Error::StoreError(format!("begin: {}", e)))
    }

    pub fn commit(&self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Error::StoreError(format!("commit: {}", e)))
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::StoreError(format!("rollback: {}", e)))
    }

    /// Runs `body` inside a transaction, committing on `Ok` and
    /// rolling back on `Err`.
    pub fn with_transaction<T>(
        &self,
        body: impl FnOnce(&Store) -> Result<T>,
    ) -> Result<T> {
        self.begin()?;
        match body(self) {
            Ok(v) => {
                self.commit()?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    /// Empties the network model: every device, product, driver,
    /// sensor, and capability row goes, while the schema and the
    /// migration markers stay.
    pub fn reset(&self) -> Result<()> {
        self.with_transaction(|store| {
            for table in [
                "deviceSensor",
                "binaryOutput",
                "dali",
                "light",
                "device",
                "productDriver",
                "driver",
                "product",
                "sensor",
            ] {
                store
                    .conn()
                    .execute(&format!("DELETE FROM {}", table), [])
                    .map_err(|e| {
                        Error::StoreError(format!("reset {}: {}", table, e))
                    })?;
            }
            Ok(())
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// Wraps an engine error with a textual context and the failed entity
// key.

pub(crate) fn wrap<T>(
    res: rusqlite::Result<T>,
    what: &str,
    key: impl std::fmt::Display,
) -> Result<T> {
    res.map_err(|e| Error::StoreError(format!("{} [{}]: {}", what, key, e)))
}
