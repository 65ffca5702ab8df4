//! Persistent user memory: SQLite with FTS5 full-text search.
//!
//! Lives in the shared `toolsmith.db`.  Recall ranks by BM25 over content
//! and tags, then by priority.

use std::sync::Arc;

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::store::Database;
use crate::utils::now_millis;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id         TEXT PRIMARY KEY,
    content    TEXT NOT NULL,
    tags       TEXT NOT NULL DEFAULT '[]',
    tier       TEXT NOT NULL CHECK(tier IN ('short_term', 'long_term')),
    priority   REAL NOT NULL DEFAULT 0.5,
    created_at INTEGER NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content, tags,
    content='memories',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content, tags)
    VALUES (new.rowid, new.content, new.tags);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content, tags)
    VALUES ('delete', old.rowid, old.content, old.tags);
END;
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
        }
    }

    /// Starting priority for new entries of this tier.
    pub fn default_priority(&self) -> f64 {
        match self {
            Self::ShortTerm => 0.6,
            Self::LongTerm => 0.9,
        }
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            other => anyhow::bail!("unknown memory tier: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tier: MemoryTier,
    pub priority: f64,
    pub created_at: i64,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, f64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_entry(raw: (String, String, String, String, f64, i64)) -> anyhow::Result<MemoryEntry> {
    let (id, content, tags, tier, priority, created_at) = raw;
    Ok(MemoryEntry {
        id,
        content,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        tier: tier.parse()?,
        priority,
        created_at,
    })
}

/// Build an FTS5 query: every keyword quoted, matched whole or as a prefix.
fn fts_query(keywords: &[String]) -> Option<String> {
    let terms: Vec<String> = keywords
        .iter()
        .flat_map(|k| k.split_whitespace())
        .map(|w| w.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\"*"))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

pub struct MemoryStore {
    db: Arc<Database>,
}

impl MemoryStore {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    pub fn save(&self, content: &str, tags: &[String], tier: MemoryTier) -> anyhow::Result<MemoryEntry> {
        if content.trim().is_empty() {
            anyhow::bail!("memory content must not be empty");
        }
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
            tier,
            priority: tier.default_priority(),
            created_at: now_millis(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (id, content, tags, tier, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.content,
                    serde_json::to_string(&entry.tags)?,
                    tier.as_str(),
                    entry.priority,
                    entry.created_at,
                ],
            )?;
            Ok(())
        })?;
        tracing::debug!(memory_id = %entry.id, tier = tier.as_str(), "memory stored");
        Ok(entry)
    }

    /// Ranked recall.  With no usable keywords, returns the highest-priority entries.
    pub fn recall(&self, keywords: &[String], limit: usize) -> anyhow::Result<Vec<MemoryEntry>> {
        let raws = self.db.with_conn(|conn| {
            let raws = match fts_query(keywords) {
                Some(q) => {
                    let mut stmt = conn.prepare(
                        "SELECT m.id, m.content, m.tags, m.tier, m.priority, m.created_at
                         FROM memories_fts f
                         JOIN memories m ON m.rowid = f.rowid
                         WHERE memories_fts MATCH ?1
                         ORDER BY f.rank, m.priority DESC
                         LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![q, limit as i64], entry_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, content, tags, tier, priority, created_at FROM memories
                         ORDER BY priority DESC, created_at DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit as i64], entry_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(raws)
        })?;
        raws.into_iter().map(into_entry).collect()
    }

    pub fn forget(&self, id: &str) -> anyhow::Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM memories WHERE id = ?1", params![id])? > 0)
        })
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(Database::open_in_memory().unwrap())).unwrap()
    }

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn save_and_recall_by_content() {
        let store = store();
        store
            .save("User is allergic to peanuts", &kw(&["food"]), MemoryTier::LongTerm)
            .unwrap();
        store
            .save("User lives in Lisbon", &kw(&["location"]), MemoryTier::ShortTerm)
            .unwrap();

        let hits = store.recall(&kw(&["peanut"]), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("peanuts"));
        assert_eq!(hits[0].priority, 0.9);
    }

    #[test]
    fn recall_matches_tags() {
        let store = store();
        store
            .save("Prefers window seats", &kw(&["travel"]), MemoryTier::LongTerm)
            .unwrap();
        let hits = store.recall(&kw(&["travel"]), 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_keywords_fall_back_to_priority() {
        let store = store();
        store.save("a", &[], MemoryTier::ShortTerm).unwrap();
        store.save("b", &[], MemoryTier::LongTerm).unwrap();
        let hits = store.recall(&[], 5).unwrap();
        assert_eq!(hits[0].content, "b");
    }

    #[test]
    fn forget_removes_from_search() {
        let store = store();
        let e = store.save("temporary note", &[], MemoryTier::ShortTerm).unwrap();
        assert!(store.forget(&e.id).unwrap());
        assert!(store.recall(&kw(&["temporary"]), 5).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }
}
