use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::coordinator::CoordinatorSettings;
use crate::limits::*;

/// Server settings read from `ALLOCD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub default_chunk_size: usize,
    pub async_threshold: usize,
    pub operation_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable or out-of-range values keep
    /// the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let chunk_size = parsed(&lookup, "ALLOCD_DEFAULT_CHUNK_SIZE", d.default_chunk_size);
        Self {
            bind: lookup("ALLOCD_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "ALLOCD_PORT", d.port),
            data_dir: lookup("ALLOCD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: positive(parsed(&lookup, "ALLOCD_MAX_CONNECTIONS", d.max_connections), d.max_connections),
            compact_threshold: positive(parsed(&lookup, "ALLOCD_COMPACT_THRESHOLD", d.compact_threshold), d.compact_threshold),
            metrics_port: lookup("ALLOCD_METRICS_PORT").and_then(|s| s.parse().ok()),
            default_chunk_size: if (1..=MAX_CHUNK_SIZE).contains(&chunk_size) {
                chunk_size
            } else {
                warn!(chunk_size, "ALLOCD_DEFAULT_CHUNK_SIZE out of range, using default");
                d.default_chunk_size
            },
            async_threshold: parsed(&lookup, "ALLOCD_ASYNC_THRESHOLD", d.async_threshold),
            operation_timeout_secs: positive(
                parsed(&lookup, "ALLOCD_OPERATION_TIMEOUT_SECS", d.operation_timeout_secs),
                d.operation_timeout_secs,
            ),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("allocd.wal")
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            async_threshold: self.async_threshold,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            default_chunk_size: self.default_chunk_size,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
    }
}

fn positive<T: PartialOrd + Default>(value: T, default: T) -> T {
    if value > T::default() { value } else { default }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
        let config = Config::default();
        assert_eq!(config.addr(), "0.0.0.0:5480");
        assert_eq!(config.wal_path(), PathBuf::from("./data/allocd.wal"));
    }

    #[test]
    fn reads_every_key() {
        let config = Config::from_lookup(lookup(&[
            ("ALLOCD_BIND", "127.0.0.1"),
            ("ALLOCD_PORT", "6000"),
            ("ALLOCD_DATA_DIR", "/var/lib/allocd"),
            ("ALLOCD_MAX_CONNECTIONS", "16"),
            ("ALLOCD_COMPACT_THRESHOLD", "50"),
            ("ALLOCD_METRICS_PORT", "9100"),
            ("ALLOCD_DEFAULT_CHUNK_SIZE", "250"),
            ("ALLOCD_ASYNC_THRESHOLD", "10"),
            ("ALLOCD_OPERATION_TIMEOUT_SECS", "60"),
        ]));
        assert_eq!(config.addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/allocd"));
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));

        let settings = config.coordinator_settings();
        assert_eq!(settings.default_chunk_size, 250);
        assert_eq!(settings.async_threshold, 10);
        assert_eq!(settings.operation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("ALLOCD_PORT", "not-a-port"),
            ("ALLOCD_MAX_CONNECTIONS", "0"),
            ("ALLOCD_DEFAULT_CHUNK_SIZE", "20000"),
            ("ALLOCD_OPERATION_TIMEOUT_SECS", "-5"),
            ("ALLOCD_METRICS_PORT", "70000"),
        ]));
        let d = Config::default();
        assert_eq!(config.port, d.port);
        assert_eq!(config.max_connections, d.max_connections);
        assert_eq!(config.default_chunk_size, d.default_chunk_size);
        assert_eq!(config.operation_timeout_secs, d.operation_timeout_secs);
        assert_eq!(config.metrics_port, None);
    }
}
