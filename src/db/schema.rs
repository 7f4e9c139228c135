//! SQL DDL for the platform tables of one target database.
//! Entity tables are rendered from each module's `TableSpec` at install time.

/// SQLite platform schema:
/// - `module`, `module_dependency`, `module_table`: installed modules and what they own
/// - `operation`: audit log; the partial unique index allows one running operation per target
/// - `account`, `account_region`: credentials and the regions entity rows may live in
pub const PLATFORM_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Module registry (a row exists only while the module is installed)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS module (
    name TEXT PRIMARY KEY NOT NULL,
    version TEXT NOT NULL,
    installed INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1,
    installed_at TEXT NOT NULL -- RFC3339
);

CREATE TABLE IF NOT EXISTS module_dependency (
    module TEXT NOT NULL REFERENCES module(name) ON DELETE CASCADE,
    dependency TEXT NOT NULL,
    PRIMARY KEY (module, dependency)
);

CREATE TABLE IF NOT EXISTS module_table (
    table_name TEXT PRIMARY KEY NOT NULL,
    module TEXT NOT NULL REFERENCES module(name) ON DELETE CASCADE
);

-- ---------------------------------------------------------------------------
-- Operation log
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS operation (
    opid TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    params TEXT NOT NULL, -- JSON
    output TEXT NULL, -- JSON
    err TEXT NULL, -- JSON {"message": [..]}
    start_date TEXT NOT NULL, -- RFC3339
    end_date TEXT NULL, -- RFC3339, NULL while running
    holder TEXT NOT NULL,
    heartbeat_ms INTEGER NOT NULL, -- unix epoch millis
    lock_slot INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_operation_running ON operation(lock_slot) WHERE end_date IS NULL;

-- ---------------------------------------------------------------------------
-- Cloud account
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
    access_key_id TEXT NOT NULL,
    secret_access_key TEXT NOT NULL,
    default_region TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS account_region (
    region TEXT PRIMARY KEY NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);
"#;
