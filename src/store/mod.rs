//! Embedded key-value store backed by redb.
//!
//! A single string-to-string table holds both registered clients
//! (`client_<id>`) and job records (`job_<id>`). redb serializes transactions
//! internally, so one handle is shared across tasks.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};

use crate::error::StoreError;

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the store at the given filesystem path.
    pub fn new(data_source: &str) -> Result<Self, StoreError> {
        let db = Database::create(Path::new(data_source))
            .map_err(|e| StoreError::failed("failed to open store", e))?;

        // Open the table once so reads on a fresh database don't fail with
        // a missing-table error.
        let txn = db
            .begin_write()
            .map_err(|e| StoreError::failed("failed to begin transaction", e))?;
        txn.open_table(KV_TABLE)
            .map_err(|e| StoreError::failed("failed to open table", e))?;
        txn.commit()
            .map_err(|e| StoreError::failed("failed to commit transaction", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::failed("failed to begin transaction", e))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| StoreError::failed("failed to open table", e))?;
            table
                .insert(key, value)
                .map_err(|e| StoreError::failed("failed to insert", e))?;
        }
        txn.commit()
            .map_err(|e| StoreError::failed("failed to commit transaction", e))
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::failed("failed to begin transaction", e))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|e| StoreError::failed("failed to open table", e))?;
        match table
            .get(key)
            .map_err(|e| StoreError::failed("failed to get", e))?
        {
            Some(value) => Ok(value.value().to_string()),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::failed("failed to begin transaction", e))?;
        let removed = {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| StoreError::failed("failed to open table", e))?;
            let existed = table
                .remove(key)
                .map_err(|e| StoreError::failed("failed to remove", e))?
                .is_some();
            existed
        };
        txn.commit()
            .map_err(|e| StoreError::failed("failed to commit transaction", e))?;

        if !removed {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
