//! Store configuration sourced from the environment.

use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// File extensions accepted for database files. Anything else gets the default.
pub const DBMS_EXTENSIONS: &[&str] = &["db", "sdb", "sqlite", "db3", "s3db", "sqlite3", "sl3"];
pub const DEFAULT_DBMS_EXTENSION: &str = "db";

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Name and query-index column of one tier of the ownership hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub db_name: String,
    pub query_index: String,
}

impl TierConfig {
    pub fn new(db_name: impl Into<String>, query_index: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            query_index: query_index.into(),
        }
    }

    fn from_env(prefix: &str, db_name: &str, query_index: &str) -> Self {
        Self {
            db_name: env::var(format!("ASSEMBLIT_{prefix}_DB_NAME"))
                .unwrap_or_else(|_| db_name.to_owned()),
            query_index: env::var(format!("ASSEMBLIT_{prefix}_DB_QUERY_INDEX"))
                .unwrap_or_else(|_| query_index.to_owned()),
        }
    }
}

/// Where the database files live and how connections to them behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub root_dir: PathBuf,
    pub busy_timeout: Duration,
    pub max_connections: u32,
    pub users: TierConfig,
    pub sessions: TierConfig,
    pub data: TierConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./db"),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            users: TierConfig::new("users", "user_id"),
            sessions: TierConfig::new("sessions", "session_id"),
            data: TierConfig::new("data", "dataset_id"),
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Reads `ASSEMBLIT_*` variables, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root_dir: env::var("ASSEMBLIT_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            busy_timeout: env::var("ASSEMBLIT_DB_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
            max_connections: env::var("ASSEMBLIT_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|value| value.parse().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_connections),
            users: TierConfig::from_env("USERS", "users", "user_id"),
            sessions: TierConfig::from_env("SESSIONS", "sessions", "session_id"),
            data: TierConfig::from_env("DATA", "data", "dataset_id"),
        }
    }

    /// Path of the file backing `db_name`.
    pub fn path_for(&self, db_name: &str) -> PathBuf {
        self.root_dir.join(parse_db_name(db_name))
    }
}

/// Ensures `db_name` carries a supported DBMS extension, lower-casing it.
pub fn parse_db_name(db_name: &str) -> String {
    if let Some((stem, extension)) = db_name.rsplit_once('.') {
        let extension = extension.to_ascii_lowercase();
        if !stem.is_empty() && DBMS_EXTENSIONS.contains(&extension.as_str()) {
            return format!("{stem}.{extension}");
        }
    }
    format!("{db_name}.{DEFAULT_DBMS_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_database_names() {
        assert_eq!(parse_db_name("users"), "users.db");
        assert_eq!(parse_db_name("users.SQLITE3"), "users.sqlite3");
        assert_eq!(parse_db_name("users.csv"), "users.csv.db");
        assert_eq!(parse_db_name(".db"), ".db.db");
    }

    #[test]
    fn path_for_joins_root() {
        let config = StoreConfig::with_root("/tmp/assemblit");
        assert_eq!(
            config.path_for("sessions"),
            PathBuf::from("/tmp/assemblit/sessions.db")
        );
        assert_eq!(config.data.query_index, "dataset_id");
    }
}
