//! Server configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_AUTO_ADVANCE_MS: u64 = 1500;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// `*.json` flow documents, one flow per file
    pub flows_dir: PathBuf,
    /// SQLite file backing the durable storage scope
    pub db_path: PathBuf,
    pub auto_advance_delay: Duration,
    /// Upper bound for outbound requests made by option sources
    pub http_timeout: Duration,
    /// Completed sessions are dropped this long after they finish
    pub completed_retention: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let db_path = lookup("CHATFLOW_DB_PATH").map_or_else(
            || {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".chatflow").join("storage.db")
            },
            PathBuf::from,
        );

        Self {
            port: lookup("CHATFLOW_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            flows_dir: lookup("CHATFLOW_FLOWS_DIR").map_or_else(|| PathBuf::from("./flows"), PathBuf::from),
            db_path,
            auto_advance_delay: Duration::from_millis(number("CHATFLOW_AUTO_ADVANCE_MS", DEFAULT_AUTO_ADVANCE_MS)),
            http_timeout: Duration::from_secs(number("CHATFLOW_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)),
            completed_retention: Duration::from_secs(number(
                "CHATFLOW_COMPLETED_RETENTION_SECS",
                DEFAULT_COMPLETED_RETENTION_SECS,
            )),
        }
    }
}
