//! Encrypted per-capability secret store.
//!
//! Values are sealed with [`super::crypto`] before they reach SQLite and are
//! only decrypted into an execution context.  A row that fails to decrypt is
//! logged and left out of the result instead of failing the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::{debug, warn};

use super::crypto;
use crate::store::Database;
use crate::utils::now_millis;

pub struct SecretStore {
    db: Arc<Database>,
    key: [u8; 32],
}

impl SecretStore {
    pub fn new(db: Arc<Database>, key: [u8; 32]) -> Self {
        Self { db, key }
    }

    /// Upsert `key` for a capability (last write wins).
    pub fn set(&self, capability_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        if key.trim().is_empty() {
            anyhow::bail!("secret key must not be empty");
        }
        let sealed = crypto::encrypt(&self.key, value.as_bytes())?;
        let now = now_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO capability_secrets (capability_id, key, encrypted_value, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(capability_id, key) DO UPDATE SET
                     encrypted_value = excluded.encrypted_value,
                     updated_at = excluded.updated_at",
                params![capability_id, key, sealed, now],
            )?;
            Ok(())
        })?;
        debug!(capability_id, key, "secret stored");
        Ok(())
    }

    /// Decrypt every secret of a capability.
    pub fn get_all(&self, capability_id: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, encrypted_value FROM capability_secrets WHERE capability_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![capability_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut out = BTreeMap::new();
        for (key, sealed) in rows {
            let plain = crypto::decrypt(&self.key, &sealed)
                .and_then(|bytes| String::from_utf8(bytes).map_err(anyhow::Error::from));
            match plain {
                Ok(value) => {
                    out.insert(key, value);
                }
                Err(e) => {
                    warn!(capability_id, key = %key, error = %e, "failed to decrypt secret, omitting");
                }
            }
        }
        Ok(out)
    }

    /// Names of stored secrets (no decryption).
    pub fn keys(&self, capability_id: &str) -> anyhow::Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM capability_secrets WHERE capability_id = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![capability_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    pub fn delete(&self, capability_id: &str, key: &str) -> anyhow::Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM capability_secrets WHERE capability_id = ?1 AND key = ?2",
                params![capability_id, key],
            )?;
            Ok(n > 0)
        })
    }
}
