/// SQL DDL for the roost-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    session_id TEXT NOT NULL,
    category TEXT NOT NULL,
    key_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, category, key_id)
);

CREATE INDEX IF NOT EXISTS idx_credentials_session ON credentials(session_id);
CREATE INDEX IF NOT EXISTS idx_credentials_category ON credentials(session_id, category);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
