//! Process settings read from the environment.

use crate::error::ConfigError;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Upper bound on a single statement (or a delete transaction).
    pub statement_timeout: Duration,
    pub bind_addr: String,
    /// JSON file or directory of JSON files with resource declarations.
    pub resources_path: PathBuf,
    pub body_limit_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "postgres://localhost/resources".into(),
            max_connections: 5,
            acquire_timeout: Duration::from_millis(5_000),
            statement_timeout: Duration::from_millis(30_000),
            bind_addr: "127.0.0.1:3000".into(),
            resources_path: PathBuf::from("resources"),
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl Settings {
    /// Loads `.env` when present, then reads the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_ACQUIRE_TIMEOUT_MS`,
    /// `STATEMENT_TIMEOUT_MS`, `BIND_ADDR`, `RESOURCES_PATH`, `BODY_LIMIT_BYTES`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        Ok(Settings {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: Duration::from_millis(parse_or(
                &lookup,
                "DB_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout.as_millis() as u64,
            )?),
            statement_timeout: Duration::from_millis(parse_or(
                &lookup,
                "STATEMENT_TIMEOUT_MS",
                defaults.statement_timeout.as_millis() as u64,
            )?),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            resources_path: lookup("RESOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.resources_path),
            body_limit_bytes: parse_or(&lookup, "BODY_LIMIT_BYTES", defaults.body_limit_bytes)?,
        })
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let s = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(s.max_connections, 5);
        assert_eq!(s.statement_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reads_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://db/shop"),
            ("DB_MAX_CONNECTIONS", "12"),
            ("STATEMENT_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.database_url, "postgres://db/shop");
        assert_eq!(s.max_connections, 12);
        assert_eq!(s.statement_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = Settings::from_lookup(|k| (k == "DB_MAX_CONNECTIONS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "DB_MAX_CONNECTIONS", .. }));
    }
}
