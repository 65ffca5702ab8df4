//! Per-capability JSON scratch space that persists across invocations.

use std::sync::Arc;

use rusqlite::params;
use serde_json::{Map, Value};

use crate::store::Database;
use crate::utils::now_millis;

pub struct StorageStore {
    db: Arc<Database>,
}

impl StorageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// All entries for a capability as a JSON object.
    ///
    /// Values that are not valid JSON come back as plain strings.
    pub fn get(&self, capability_id: &str) -> anyhow::Result<Map<String, Value>> {
        let rows: Vec<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM capability_storage WHERE capability_id = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![capability_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .map(|(k, raw)| {
                let v = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                (k, v)
            })
            .collect())
    }

    /// Upsert each key of `updates`; keys not mentioned are left untouched.
    pub fn merge(&self, capability_id: &str, updates: &Map<String, Value>) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = now_millis();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO capability_storage (capability_id, key, value, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(capability_id, key) DO UPDATE SET
                         value = excluded.value,
                         updated_at = excluded.updated_at",
                )?;
                for (key, value) in updates {
                    stmt.execute(params![capability_id, key, value.to_string(), now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn delete_key(&self, capability_id: &str, key: &str) -> anyhow::Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM capability_storage WHERE capability_id = ?1 AND key = ?2",
                params![capability_id, key],
            )?;
            Ok(n > 0)
        })
    }

    pub fn clear(&self, capability_id: &str) -> anyhow::Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM capability_storage WHERE capability_id = ?1",
                params![capability_id],
            )?)
        })
    }
}
