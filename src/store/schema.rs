/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 2;

/// Schema for the offline store. Every statement is safe to re-run.
pub const SCHEMA: &str = r#"
-- Reference snapshot (resident directory), replaced wholesale on refresh
CREATE TABLE IF NOT EXISTS residents (
    id INTEGER PRIMARY KEY,
    data BLOB NOT NULL
);

-- Pending captures; AUTOINCREMENT keeps temp ids monotonic and never reused
CREATE TABLE IF NOT EXISTS pending_visitors (
    temp_id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at TEXT NOT NULL,
    operator TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_packages (
    temp_id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at TEXT NOT NULL,
    operator TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_requests (
    temp_id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at TEXT NOT NULL,
    operator TEXT NOT NULL,
    data BLOB NOT NULL
);

-- String preferences (last known operator)
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
