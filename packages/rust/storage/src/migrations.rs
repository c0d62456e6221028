//! SQL migration definitions for the bookgen database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: projects, checkpoints, sheet_rows, llm_cache",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Book projects
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    title       TEXT NOT NULL,
    author      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Keyed stage/item checkpoints
CREATE TABLE IF NOT EXISTS checkpoints (
    project_id  TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    key         TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    saved_at    TEXT NOT NULL,
    PRIMARY KEY (project_id, key)
);

-- Spreadsheet-like tabs, one JSON object per row.
-- scope is a project id, or "global" for workspace-wide tabs (the queue).
CREATE TABLE IF NOT EXISTS sheet_rows (
    scope       TEXT NOT NULL,
    tab         TEXT NOT NULL,
    row_index   INTEGER NOT NULL,
    row_json    TEXT NOT NULL,
    PRIMARY KEY (scope, tab, row_index)
);

-- LLM response cache
CREATE TABLE IF NOT EXISTS llm_cache (
    prompt_hash   TEXT NOT NULL,
    model_id      TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (prompt_hash, model_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Scope cached LLM responses to the project that asked",
            sql: r#"
ALTER TABLE llm_cache ADD COLUMN scope TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_llm_cache_scope ON llm_cache(scope);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
