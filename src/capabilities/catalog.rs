//! Capability catalog: SQLite registry plus on-disk code directories.
//!
//! Rows live in the `capabilities` table; code lives under
//! `<code_dir>/<id>/` as `main.py`, `requirements.txt`, `manifest.json` and
//! `RUN.md`.  Names are unique; every metadata update bumps `version`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    Capability, CapabilityFiles, CapabilityStatus, CapabilityUpdate, Manifest, NewCapability,
    Registration,
};
use crate::store::Database;
use crate::utils::now_millis;

const COLUMNS: &str = "id, name, description, version, status, input_schema, output_schema, \
                       tags, path, created_at, updated_at";

/// Longest capability name that still fits a 64-char tool name with the prefix.
const MAX_NAME_LEN: usize = 60;

pub struct Catalog {
    db: Arc<Database>,
    code_dir: PathBuf,
}

struct RawRow {
    id: String,
    name: String,
    description: String,
    version: i64,
    status: String,
    input_schema: String,
    output_schema: String,
    tags: String,
    path: String,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            version: row.get(3)?,
            status: row.get(4)?,
            input_schema: row.get(5)?,
            output_schema: row.get(6)?,
            tags: row.get(7)?,
            path: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_capability(self) -> anyhow::Result<Capability> {
        Ok(Capability {
            status: self.status.parse()?,
            input_schema: serde_json::from_str(&self.input_schema).unwrap_or_else(|_| json!({})),
            output_schema: serde_json::from_str(&self.output_schema)
                .unwrap_or_else(|_| json!({})),
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            id: self.id,
            name: self.name,
            description: self.description,
            version: self.version,
            path: self.path,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars {
        anyhow::bail!(
            "invalid capability name {name:?}: use 1-{MAX_NAME_LEN} characters of [A-Za-z0-9_-]"
        );
    }
    Ok(())
}

fn millis_to_rfc3339(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339()
}

impl Catalog {
    pub fn new(db: Arc<Database>, code_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            code_dir: code_dir.into(),
        }
    }

    pub fn code_dir(&self) -> &Path {
        &self.code_dir
    }

    /// Insert a new capability in `building` state.
    pub fn create(&self, input: NewCapability) -> anyhow::Result<Capability> {
        validate_name(&input.name)?;
        if self.get_by_name(&input.name)?.is_some() {
            anyhow::bail!("capability {:?} already exists", input.name);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let cap_path = self.code_dir.join(&id);
        std::fs::create_dir_all(&cap_path)
            .with_context(|| format!("create capability dir {}", cap_path.display()))?;

        let cap = Capability {
            id,
            name: input.name,
            description: input.description,
            version: 1,
            status: CapabilityStatus::Building,
            input_schema: input.input_schema.unwrap_or_else(|| json!({})),
            output_schema: input.output_schema.unwrap_or_else(|| json!({})),
            tags: input.tags,
            path: cap_path.to_string_lossy().to_string(),
            created_at: now,
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO capabilities (id, name, description, version, status, input_schema,
                                           output_schema, tags, path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    cap.id,
                    cap.name,
                    cap.description,
                    cap.status.as_str(),
                    cap.input_schema.to_string(),
                    cap.output_schema.to_string(),
                    serde_json::to_string(&cap.tags)?,
                    cap.path,
                    now,
                ],
            )?;
            Ok(())
        })?;

        info!(capability_id = %cap.id, name = %cap.name, "capability created");
        Ok(cap)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<Capability>> {
        self.query_one(&format!("SELECT {COLUMNS} FROM capabilities WHERE id = ?1"), id)
    }

    pub fn get_by_name(&self, name: &str) -> anyhow::Result<Option<Capability>> {
        self.query_one(&format!("SELECT {COLUMNS} FROM capabilities WHERE name = ?1"), name)
    }

    fn query_one(&self, sql: &str, arg: &str) -> anyhow::Result<Option<Capability>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(sql, params![arg], RawRow::from_row)
                .optional()?)
        })?;
        raw.map(RawRow::into_capability).transpose()
    }

    /// List capabilities; filtered lists are ordered by name, the full list newest first.
    pub fn list(&self, status: Option<CapabilityStatus>) -> anyhow::Result<Vec<Capability>> {
        let rows = self.db.with_conn(|conn| {
            let rows = match status {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM capabilities WHERE status = ?1 ORDER BY name"
                    ))?;
                    let rows = stmt
                        .query_map(params![s.as_str()], RawRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM capabilities ORDER BY created_at DESC, name"
                    ))?;
                    let rows = stmt
                        .query_map([], RawRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(rows)
        })?;
        rows.into_iter().map(RawRow::into_capability).collect()
    }

    /// Substring search over active capabilities' name and description.
    pub fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Capability>> {
        let pattern = format!("%{query}%");
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM capabilities
                 WHERE status = 'active' AND (name LIKE ?1 OR description LIKE ?1)
                 ORDER BY name LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![pattern, limit as i64], RawRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawRow::into_capability).collect()
    }

    /// Move a capability to `status`, enforcing the lifecycle.
    pub fn set_status(&self, id: &str, status: CapabilityStatus) -> anyhow::Result<Capability> {
        let cap = self
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("capability {id} not found"))?;
        if !cap.status.can_transition_to(status) {
            anyhow::bail!(
                "capability {:?} cannot move from {} to {}",
                cap.name,
                cap.status,
                status
            );
        }
        let now = now_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE capabilities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
            Ok(())
        })?;
        info!(capability_id = %id, from = %cap.status, to = %status, "capability status changed");
        Ok(Capability {
            status,
            updated_at: now,
            ..cap
        })
    }

    /// Overwrite metadata and bump the version.
    pub fn update(&self, id: &str, update: CapabilityUpdate) -> anyhow::Result<Capability> {
        let cap = self
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("capability {id} not found"))?;
        let updated = Capability {
            description: update.description.unwrap_or(cap.description),
            input_schema: update.input_schema.unwrap_or(cap.input_schema),
            output_schema: update.output_schema.unwrap_or(cap.output_schema),
            tags: update.tags.unwrap_or(cap.tags),
            version: cap.version + 1,
            updated_at: now_millis(),
            ..cap
        };
        self.write_metadata(&updated)?;
        Ok(updated)
    }

    fn write_metadata(&self, cap: &Capability) -> anyhow::Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE capabilities
                 SET description = ?1, input_schema = ?2, output_schema = ?3, tags = ?4,
                     version = ?5, status = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    cap.description,
                    cap.input_schema.to_string(),
                    cap.output_schema.to_string(),
                    serde_json::to_string(&cap.tags)?,
                    cap.version,
                    cap.status.as_str(),
                    cap.updated_at,
                    cap.id,
                ],
            )?;
            Ok(())
        })
    }

    /// Finalize a capability by name: persist code, manifest and docs,
    /// overwrite metadata, bump the version and mark it `active`.
    ///
    /// Registering a name that was never requested is an error, as is
    /// registering a disabled capability.
    pub fn register(&self, name: &str, reg: Registration) -> anyhow::Result<Capability> {
        let cap = self.get_by_name(name)?.ok_or_else(|| {
            anyhow::anyhow!(
                "Capability \"{name}\" not found in catalog. Was request_capability called first?"
            )
        })?;
        if cap.status == CapabilityStatus::Disabled {
            anyhow::bail!("Capability \"{name}\" is disabled; re-enable it before registering");
        }

        let updated = Capability {
            description: reg.description,
            input_schema: reg.input_schema,
            tags: reg.tags.unwrap_or(cap.tags.clone()),
            version: cap.version + 1,
            status: CapabilityStatus::Active,
            updated_at: now_millis(),
            ..cap
        };

        let manifest = Manifest {
            name: updated.name.clone(),
            description: updated.description.clone(),
            version: updated.version,
            input_schema: updated.input_schema.clone(),
            required_secrets: reg.required_secrets,
            created_at: millis_to_rfc3339(updated.created_at),
            updated_at: millis_to_rfc3339(updated.updated_at),
        };
        self.save_files(
            &updated,
            &CapabilityFiles {
                main_py: reg.main_py,
                requirements_txt: reg.requirements_txt,
            },
            &manifest,
        )?;
        self.write_metadata(&updated)?;

        info!(
            capability_id = %updated.id,
            name = %updated.name,
            version = updated.version,
            "capability registered"
        );
        Ok(updated)
    }

    /// Write code, manifest and RUN.md into the capability directory.
    pub fn save_files(
        &self,
        cap: &Capability,
        files: &CapabilityFiles,
        manifest: &Manifest,
    ) -> anyhow::Result<()> {
        let dir = Path::new(&cap.path);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create capability dir {}", dir.display()))?;

        let schema_pretty = serde_json::to_string_pretty(&manifest.input_schema)?;
        let run_md = format!(
            "# {name}\n\n{description}\n\n## Usage\n\n\
             Exposed to the agent as the `{prefix}{name}` tool once active.\n\n\
             ## Input\n\n```json\n{schema_pretty}\n```\n",
            name = cap.name,
            description = manifest.description,
            prefix = super::TOOL_PREFIX,
        );

        let writes: [(&str, String); 4] = [
            ("main.py", files.main_py.clone()),
            ("requirements.txt", files.requirements_txt.clone()),
            ("manifest.json", serde_json::to_string_pretty(manifest)?),
            ("RUN.md", run_md),
        ];
        for (file, contents) in writes {
            let path = dir.join(file);
            std::fs::write(&path, contents)
                .with_context(|| format!("write {}", path.display()))?;
        }
        debug!(capability_id = %cap.id, dir = %dir.display(), "capability files saved");
        Ok(())
    }

    pub fn load_files(&self, id: &str) -> anyhow::Result<CapabilityFiles> {
        let cap = self
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("capability {id} not found"))?;
        let dir = Path::new(&cap.path);
        let main_py = std::fs::read_to_string(dir.join("main.py"))
            .with_context(|| format!("read main.py for capability {}", cap.name))?;
        // A capability registered without dependencies may lack the file.
        let requirements_txt =
            std::fs::read_to_string(dir.join("requirements.txt")).unwrap_or_default();
        Ok(CapabilityFiles {
            main_py,
            requirements_txt,
        })
    }

    pub fn load_manifest(&self, cap: &Capability) -> anyhow::Result<Option<Manifest>> {
        let path = Path::new(&cap.path).join("manifest.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).context("parse manifest.json")?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Explicitly delete a capability, its secrets and storage, and its code.
    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let Some(cap) = self.get(id)? else {
            return Ok(false);
        };
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM capabilities WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        if let Err(e) = std::fs::remove_dir_all(&cap.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %cap.path, "failed to remove capability dir");
            }
        }
        info!(capability_id = %id, name = %cap.name, "capability deleted");
        Ok(true)
    }
}

/// Model-facing input schema for a capability: always an object schema.
pub fn tool_input_schema(cap: &Capability) -> Value {
    json!({
        "type": "object",
        "properties": cap.input_schema.get("properties").cloned().unwrap_or_else(|| json!({})),
        "required": cap.input_schema.get("required").cloned().unwrap_or_else(|| json!([])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let catalog = Catalog::new(db, dir.path().join("capabilities"));
        (dir, catalog)
    }

    fn new_cap(name: &str) -> NewCapability {
        NewCapability {
            name: name.into(),
            description: format!("{name} description"),
            ..Default::default()
        }
    }

    #[test]
    fn create_starts_building_with_version_one() {
        let (_dir, catalog) = catalog();
        let cap = catalog.create(new_cap("weather_lookup")).unwrap();
        assert_eq!(cap.status, CapabilityStatus::Building);
        assert_eq!(cap.version, 1);
        assert!(Path::new(&cap.path).is_dir());

        let fetched = catalog.get_by_name("weather_lookup").unwrap().unwrap();
        assert_eq!(fetched.id, cap.id);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (_dir, catalog) = catalog();
        catalog.create(new_cap("dup")).unwrap();
        assert!(catalog.create(new_cap("dup")).is_err());
        assert_eq!(catalog.list(None).unwrap().len(), 1);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (_dir, catalog) = catalog();
        assert!(catalog.create(new_cap("has space")).is_err());
        assert!(catalog.create(new_cap("")).is_err());
        assert!(catalog.create(new_cap("../etc")).is_err());
    }

    #[test]
    fn update_bumps_version_and_keeps_unset_fields() {
        let (_dir, catalog) = catalog();
        let cap = catalog.create(new_cap("notes")).unwrap();
        let updated = catalog
            .update(
                &cap.id,
                CapabilityUpdate {
                    tags: Some(vec!["text".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.description, "notes description");
        assert_eq!(catalog.get(&cap.id).unwrap().unwrap().tags, vec!["text"]);
    }

    #[test]
    fn search_only_returns_active() {
        let (_dir, catalog) = catalog();
        let a = catalog.create(new_cap("weather_now")).unwrap();
        catalog.create(new_cap("weather_later")).unwrap();
        catalog.set_status(&a.id, CapabilityStatus::Active).unwrap();

        let hits = catalog.search("weather", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "weather_now");
    }

    #[test]
    fn tool_schema_is_object_shaped() {
        let (_dir, catalog) = catalog();
        let cap = catalog
            .create(NewCapability {
                input_schema: Some(json!({"properties": {"city": {"type": "string"}}})),
                ..new_cap("geo")
            })
            .unwrap();
        let schema = tool_input_schema(&cap);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["type"], "string");
        assert_eq!(schema["required"], json!([]));
    }
}
