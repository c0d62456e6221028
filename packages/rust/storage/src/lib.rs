//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding book projects,
//! the checkpoint store, spreadsheet-like tabs and the LLM response cache.
//! Long-form text lives outside the database in a [`DocumentStore`] so it
//! can be edited by hand between runs.

pub mod documents;
mod migrations;

use std::path::Path;

use bookgen_shared::{BookGenError, ProjectId, Result, Row, cell_text};
use chrono::{DateTime, Duration, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use documents::{Document, DocumentStore};

/// Scope used for tabs that do not belong to a single project.
pub const GLOBAL_SCOPE: &str = "global";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// One tab rewrite at a time; they share the connection's transaction.
    tab_writes: tokio::sync::Mutex<()>,
}

/// A row of the `projects` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub title: String,
    pub author: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BookGenError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            tab_writes: tokio::sync::Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for `show`/`list`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            tab_writes: tokio::sync::Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BookGenError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BookGenError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Project operations
    // -----------------------------------------------------------------------

    /// Insert a new project. `name` is the unique handle used on the CLI.
    pub async fn insert_project(&self, name: &str, title: &str, author: &str) -> Result<ProjectId> {
        self.check_writable()?;
        let id = ProjectId::new();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, title, author, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    name,
                    title,
                    author,
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Look a project up by name.
    pub async fn get_project(&self, name: &str) -> Result<Option<ProjectRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, title, author, created_at, updated_at
                 FROM projects WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_project(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(BookGenError::Storage(e.to_string())),
        }
    }

    /// List all projects ordered by name.
    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, title, author, created_at, updated_at
                 FROM projects ORDER BY name",
                params![],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_project(&row)?);
        }
        Ok(results)
    }

    /// Update a project's `updated_at` timestamp.
    pub async fn touch_project(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
                params![now.as_str(), id],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoint operations
    // -----------------------------------------------------------------------

    /// Load a checkpoint. Entries older than `ttl` are treated as absent.
    pub async fn load_checkpoint(
        &self,
        project_id: &str,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<serde_json::Value>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value_json, saved_at FROM checkpoints WHERE project_id = ?1 AND key = ?2",
                params![project_id, key],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(BookGenError::Storage(e.to_string())),
        };

        let value_json: String = row
            .get(0)
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        let saved_at: String = row
            .get(1)
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        if let Some(ttl) = ttl {
            let saved_at = DateTime::parse_from_rfc3339(&saved_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| BookGenError::Storage(format!("invalid date: {e}")))?;
            if Utc::now() - saved_at > ttl {
                tracing::debug!(key, %saved_at, "checkpoint expired");
                return Ok(None);
            }
        }

        Ok(Some(serde_json::from_str(&value_json)?))
    }

    /// Typed variant of [`Storage::load_checkpoint`]. A checkpoint that no
    /// longer matches `T` is treated as absent.
    pub async fn load_checkpoint_as<T: DeserializeOwned>(
        &self,
        project_id: &str,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<T>> {
        let Some(value) = self.load_checkpoint(project_id, key, ttl).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable checkpoint");
                Ok(None)
            }
        }
    }

    /// Save (upsert) a checkpoint, stamping it with the current time.
    pub async fn save_checkpoint<T: Serialize + ?Sized>(
        &self,
        project_id: &str,
        key: &str,
        value: &T,
    ) -> Result<()> {
        self.check_writable()?;
        let value_json = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO checkpoints (project_id, key, value_json, saved_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, key) DO UPDATE SET
                   value_json = excluded.value_json,
                   saved_at = excluded.saved_at",
                params![project_id, key, value_json, now.as_str()],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Drop a single checkpoint.
    pub async fn invalidate_checkpoint(&self, project_id: &str, key: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM checkpoints WHERE project_id = ?1 AND key = ?2",
                params![project_id, key],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))
    }

    /// Drop every checkpoint whose key starts with `prefix` (empty prefix
    /// drops all of the project's checkpoints).
    ///
    /// The project's cached LLM responses go too, so recomputing a dropped
    /// checkpoint asks the model again. Checkpoints that survive are not
    /// recomputed and never reach the cache.
    pub async fn invalidate_prefix(&self, project_id: &str, prefix: &str) -> Result<u64> {
        self.check_writable()?;
        let dropped = self
            .conn
            .execute(
                "DELETE FROM checkpoints WHERE project_id = ?1 AND substr(key, 1, ?2) = ?3",
                params![project_id, prefix.len() as i64, prefix],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        let cached = self.clear_llm_cache_scope(project_id).await?;
        tracing::debug!(project_id, prefix, dropped, cached, "checkpoints invalidated");
        Ok(dropped)
    }

    /// Keys of all checkpoints stored for a project.
    pub async fn list_checkpoint_keys(&self, project_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM checkpoints WHERE project_id = ?1 ORDER BY key",
                params![project_id],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let mut keys = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            keys.push(
                row.get::<String>(0)
                    .map_err(|e| BookGenError::Storage(e.to_string()))?,
            );
        }
        Ok(keys)
    }

    // -----------------------------------------------------------------------
    // Row store (tabs)
    // -----------------------------------------------------------------------

    /// All rows of a tab in order. A tab that was never written is empty.
    pub async fn read_tab(&self, scope: &str, tab: &str) -> Result<Vec<Row>> {
        let mut rows = self
            .conn
            .query(
                "SELECT row_json FROM sheet_rows WHERE scope = ?1 AND tab = ?2 ORDER BY row_index",
                params![scope, tab],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row
                .get(0)
                .map_err(|e| BookGenError::Storage(e.to_string()))?;
            results.push(serde_json::from_str(&json)?);
        }
        Ok(results)
    }

    /// Write rows to a tab, replacing its contents when `overwrite` is set
    /// and appending otherwise. All or nothing: a failed insert leaves the
    /// tab as it was.
    pub async fn write_tab(
        &self,
        scope: &str,
        tab: &str,
        rows: &[Row],
        overwrite: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let encoded = rows
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let _guard = self.tab_writes.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let written = async {
            let start = if overwrite {
                tx.execute(
                    "DELETE FROM sheet_rows WHERE scope = ?1 AND tab = ?2",
                    params![scope, tab],
                )
                .await
                .map_err(|e| BookGenError::Storage(e.to_string()))?;
                0
            } else {
                self.next_row_index(scope, tab).await?
            };
            for (offset, json) in encoded.into_iter().enumerate() {
                tx.execute(
                    "INSERT INTO sheet_rows (scope, tab, row_index, row_json) VALUES (?1, ?2, ?3, ?4)",
                    params![scope, tab, start + offset as i64, json],
                )
                .await
                .map_err(|e| BookGenError::Storage(e.to_string()))?;
            }
            Ok::<_, BookGenError>(())
        }
        .await;

        if let Err(e) = written {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(scope, tab, error = %rollback, "rollback failed");
            }
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        tracing::debug!(scope, tab, count = rows.len(), overwrite, "wrote tab");
        Ok(())
    }

    /// Merge `updates` into the first row whose `match_column` equals
    /// `match_value`. Returns `false` when no row matched.
    pub async fn update_row(
        &self,
        scope: &str,
        tab: &str,
        match_column: &str,
        match_value: &str,
        updates: &Row,
    ) -> Result<bool> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "SELECT row_index, row_json FROM sheet_rows
                 WHERE scope = ?1 AND tab = ?2 ORDER BY row_index",
                params![scope, tab],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let mut target: Option<(i64, Row)> = None;
        while let Ok(Some(row)) = rows.next().await {
            let index: i64 = row
                .get(0)
                .map_err(|e| BookGenError::Storage(e.to_string()))?;
            let json: String = row
                .get(1)
                .map_err(|e| BookGenError::Storage(e.to_string()))?;
            let parsed: Row = serde_json::from_str(&json)?;
            if cell_text(parsed.get(match_column)) == match_value {
                target = Some((index, parsed));
                break;
            }
        }

        let Some((index, mut row)) = target else {
            return Ok(false);
        };
        for (column, value) in updates {
            row.insert(column.clone(), value.clone());
        }
        let json = serde_json::to_string(&row)?;
        self.conn
            .execute(
                "UPDATE sheet_rows SET row_json = ?1 WHERE scope = ?2 AND tab = ?3 AND row_index = ?4",
                params![json, scope, tab, index],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        Ok(true)
    }

    /// Names of the tabs that hold at least one row.
    pub async fn list_tabs(&self, scope: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT tab FROM sheet_rows WHERE scope = ?1 ORDER BY tab",
                params![scope],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let mut tabs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tabs.push(
                row.get::<String>(0)
                    .map_err(|e| BookGenError::Storage(e.to_string()))?,
            );
        }
        Ok(tabs)
    }

    async fn next_row_index(&self, scope: &str, tab: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(row_index) + 1, 0) FROM sheet_rows WHERE scope = ?1 AND tab = ?2",
                params![scope, tab],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| BookGenError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(BookGenError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // LLM response cache
    // -----------------------------------------------------------------------

    /// Get a cached LLM response. Entries older than `max_age` count as
    /// missing.
    pub async fn get_llm_cache(
        &self,
        prompt_hash: &str,
        model_id: &str,
        max_age: Option<Duration>,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response_json, created_at FROM llm_cache WHERE prompt_hash = ?1 AND model_id = ?2",
                params![prompt_hash, model_id],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(BookGenError::Storage(e.to_string())),
        };
        let response: String = row
            .get(0)
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        let created_at: String = row
            .get(1)
            .map_err(|e| BookGenError::Storage(e.to_string()))?;

        if let Some(max_age) = max_age {
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| BookGenError::Storage(format!("invalid date: {e}")))?;
            if Utc::now() - created_at > max_age {
                tracing::debug!(prompt_hash, %created_at, "cached LLM response expired");
                return Ok(None);
            }
        }
        Ok(Some(response))
    }

    /// Store an LLM response in the cache (upserts). `scope` is the project
    /// the response was produced for, or empty.
    pub async fn set_llm_cache(
        &self,
        prompt_hash: &str,
        model_id: &str,
        scope: &str,
        response_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO llm_cache (prompt_hash, model_id, response_json, created_at, scope)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(prompt_hash, model_id) DO UPDATE SET
                   response_json = excluded.response_json,
                   created_at = excluded.created_at,
                   scope = excluded.scope",
                params![prompt_hash, model_id, response_json, now.as_str(), scope],
            )
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Drop the cached LLM responses of one project.
    pub async fn clear_llm_cache_scope(&self, scope: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM llm_cache WHERE scope = ?1", params![scope])
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))
    }

    /// Drop every cached LLM response.
    pub async fn clear_llm_cache(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM llm_cache", params![])
            .await
            .map_err(|e| BookGenError::Storage(e.to_string()))
    }
}

/// Convert a database row to a [`ProjectRecord`].
fn row_to_project(row: &libsql::Row) -> Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
        name: row
            .get::<String>(1)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
        title: row
            .get::<String>(2)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
        author: row
            .get::<String>(3)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
        created_at: row
            .get::<String>(4)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
        updated_at: row
            .get::<String>(5)
            .map_err(|e| BookGenError::Storage(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("bg_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    async fn test_project(storage: &Storage) -> String {
        storage
            .insert_project(&format!("p-{}", Uuid::now_v7()), "Dune", "Frank Herbert")
            .await
            .expect("insert project")
            .to_string()
    }

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("bg_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn project_crud() {
        let storage = test_storage().await;
        let id = storage
            .insert_project("dune", "Dune", "Frank Herbert")
            .await
            .expect("insert project");

        let project = storage
            .get_project("dune")
            .await
            .expect("get project")
            .expect("project exists");
        assert_eq!(project.id, id.to_string());
        assert_eq!(project.title, "Dune");

        assert!(storage.insert_project("dune", "Dune", "x").await.is_err());
        assert_eq!(storage.list_projects().await.expect("list").len(), 1);
        storage.touch_project(&project.id).await.expect("touch");
    }

    #[tokio::test]
    async fn checkpoint_save_load_invalidate() {
        let storage = test_storage().await;
        let project = test_project(&storage).await;

        assert!(storage
            .load_checkpoint(&project, "source/a", None)
            .await
            .expect("miss")
            .is_none());

        storage
            .save_checkpoint(&project, "source/a", &json!({"status": "fetched"}))
            .await
            .expect("save");
        storage
            .save_checkpoint(&project, "source/b", &json!({"status": "pending"}))
            .await
            .expect("save");
        storage
            .save_checkpoint(&project, "topic/x", &json!(1))
            .await
            .expect("save");

        let loaded = storage
            .load_checkpoint(&project, "source/a", Some(Duration::days(7)))
            .await
            .expect("hit");
        assert_eq!(loaded, Some(json!({"status": "fetched"})));

        let removed = storage
            .invalidate_prefix(&project, "source/")
            .await
            .expect("invalidate prefix");
        assert_eq!(removed, 2);
        assert_eq!(
            storage.list_checkpoint_keys(&project).await.expect("keys"),
            vec!["topic/x".to_string()]
        );

        assert_eq!(
            storage
                .invalidate_checkpoint(&project, "topic/x")
                .await
                .expect("invalidate"),
            1
        );
    }

    #[tokio::test]
    async fn expired_checkpoints_are_absent() {
        let storage = test_storage().await;
        let project = test_project(&storage).await;
        storage
            .save_checkpoint(&project, "k", &json!("v"))
            .await
            .expect("save");

        let expired = storage
            .load_checkpoint(&project, "k", Some(Duration::zero() - Duration::seconds(1)))
            .await
            .expect("load");
        assert!(expired.is_none());

        let fresh = storage
            .load_checkpoint_as::<String>(&project, "k", Some(Duration::days(1)))
            .await
            .expect("load");
        assert_eq!(fresh.as_deref(), Some("v"));

        let mismatched = storage
            .load_checkpoint_as::<Vec<u32>>(&project, "k", None)
            .await
            .expect("load");
        assert!(mismatched.is_none());
    }

    #[tokio::test]
    async fn tab_write_append_update() {
        let storage = test_storage().await;
        let project = test_project(&storage).await;

        assert!(storage.read_tab(&project, "Source URLs").await.expect("read").is_empty());

        storage
            .write_tab(
                &project,
                "Source URLs",
                &[row(&[("url", json!("https://a.org"))])],
                true,
            )
            .await
            .expect("write");
        storage
            .write_tab(
                &project,
                "Source URLs",
                &[row(&[("url", json!("https://b.org"))])],
                false,
            )
            .await
            .expect("append");

        let rows = storage.read_tab(&project, "Source URLs").await.expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["url"], json!("https://b.org"));

        let updated = storage
            .update_row(
                &project,
                "Source URLs",
                "url",
                "https://b.org",
                &row(&[("status", json!("done"))]),
            )
            .await
            .expect("update");
        assert!(updated);
        let rows = storage.read_tab(&project, "Source URLs").await.expect("read");
        assert_eq!(rows[1]["status"], json!("done"));
        assert_eq!(rows[1]["url"], json!("https://b.org"));

        let missed = storage
            .update_row(&project, "Source URLs", "url", "nope", &Row::new())
            .await
            .expect("update");
        assert!(!missed);

        storage
            .write_tab(&project, "Source URLs", &[row(&[("url", json!("c"))])], true)
            .await
            .expect("overwrite");
        assert_eq!(storage.read_tab(&project, "Source URLs").await.expect("read").len(), 1);
        assert_eq!(
            storage.list_tabs(&project).await.expect("tabs"),
            vec!["Source URLs".to_string()]
        );
    }

    #[tokio::test]
    async fn tabs_are_scoped() {
        let storage = test_storage().await;
        storage
            .write_tab(GLOBAL_SCOPE, "Queue", &[row(&[("ASIN", json!("B0"))])], true)
            .await
            .expect("write");
        let project = test_project(&storage).await;
        assert!(storage.read_tab(&project, "Queue").await.expect("read").is_empty());
        assert_eq!(storage.read_tab(GLOBAL_SCOPE, "Queue").await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_previous_rows() {
        let storage = test_storage().await;
        let project = test_project(&storage).await;
        storage
            .write_tab(&project, "Topics", &[row(&[("Name", json!("Plot"))])], true)
            .await
            .expect("write");
        storage
            .conn
            .execute(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON sheet_rows
                 WHEN NEW.row_json LIKE '%boom%'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END",
                params![],
            )
            .await
            .expect("trigger");

        let result = storage
            .write_tab(
                &project,
                "Topics",
                &[row(&[("Name", json!("Legacy"))]), row(&[("Name", json!("boom"))])],
                true,
            )
            .await;
        assert!(result.is_err());

        let rows = storage.read_tab(&project, "Topics").await.expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Name"], json!("Plot"));

        storage
            .write_tab(&project, "Topics", &[row(&[("Name", json!("Legacy"))])], true)
            .await
            .expect("write after rollback");
        assert_eq!(storage.read_tab(&project, "Topics").await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn llm_cache_roundtrip() {
        let storage = test_storage().await;

        // Miss
        let cached = storage
            .get_llm_cache("hash1", "model-a", None)
            .await
            .expect("get cache miss");
        assert!(cached.is_none());

        // Set
        storage
            .set_llm_cache("hash1", "model-a", "", r#"{"text": "test"}"#)
            .await
            .expect("set cache");

        // Hit
        let cached = storage
            .get_llm_cache("hash1", "model-a", Some(Duration::days(1)))
            .await
            .expect("get cache hit");
        assert!(cached.unwrap_or_default().contains("test"));

        assert_eq!(storage.clear_llm_cache().await.expect("clear"), 1);
    }

    #[tokio::test]
    async fn llm_cache_honours_max_age() {
        let storage = test_storage().await;
        let old = (Utc::now() - Duration::days(10)).to_rfc3339();
        storage
            .conn
            .execute(
                "INSERT INTO llm_cache (prompt_hash, model_id, response_json, created_at)
                 VALUES ('h', 'm', '{}', ?1)",
                params![old.as_str()],
            )
            .await
            .expect("insert");

        let expired = storage
            .get_llm_cache("h", "m", Some(Duration::days(7)))
            .await
            .expect("get");
        assert!(expired.is_none());
        let kept = storage.get_llm_cache("h", "m", None).await.expect("get");
        assert_eq!(kept.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn invalidation_drops_the_projects_cached_responses() {
        let storage = test_storage().await;
        let project = test_project(&storage).await;
        storage
            .save_checkpoint(&project, "project/dune/lead_in", &json!("text"))
            .await
            .expect("save");
        storage
            .set_llm_cache("mine", "m", &project, "{}")
            .await
            .expect("cache");
        storage
            .set_llm_cache("other", "m", "another-project", "{}")
            .await
            .expect("cache");

        storage
            .invalidate_prefix(&project, "project/dune/lead_in")
            .await
            .expect("invalidate");

        assert!(storage.get_llm_cache("mine", "m", None).await.expect("get").is_none());
        assert!(storage.get_llm_cache("other", "m", None).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("bg_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_project("one", "Dune", "Frank Herbert")
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_project("two", "Emma", "Jane Austen").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert_eq!(ro.list_projects().await.unwrap().len(), 1);
    }
}
