//! Startup configuration, loaded once from the JSON file named on the
//! command line. Field names are fixed for compatibility with existing
//! deployments (spec §6) and must not be renamed even when they read
//! awkwardly in Rust.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// A hundred years, used as the "effectively infinite" stand-in for any
/// `*_s` field configured at or below zero.
const EFFECTIVELY_INFINITE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Smallest and largest chunk size we will accept, in bytes. 15 MiB matches
/// the historical cap of the document store's large-object chunking.
const MIN_CHUNK_SIZE: i64 = 1;
const MAX_CHUNK_SIZE: i64 = 15 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RawConfig {
    mongo: RawMongo,
    lock: RawLock,
    cache: RawCache,
    data_cache: RawCache,
    host: String,
    #[serde(default)]
    development: bool,
    default_root_mode: String,
    #[serde(default)]
    force_root_mode: bool,
    #[serde(default)]
    legacy_lock_errno: bool,
}

#[derive(Debug, Deserialize)]
struct RawMongo {
    hosts: Vec<String>,
    database: String,
    prefix: String,
    access_attempt_s: i64,
    #[serde(default)]
    write_acknowledgement: i64,
    #[serde(default)]
    write_j: bool,
    chunk_size: i64,
}

#[derive(Debug, Deserialize)]
struct RawLock {
    timeout_s: i64,
    access_attempt_s: i64,
}

#[derive(Debug, Deserialize)]
struct RawCache {
    timeout_s: i64,
    max_elements: i64,
}

/// Validated, ready-to-use configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mongo_hosts: Vec<String>,
    pub mongo_database: String,
    /// Collection name prefix, already containing any separator.
    pub mongo_prefix: String,
    pub mongo_access_attempt: Duration,
    pub mongo_write_acknowledgement: i64,
    pub mongo_write_journal: bool,
    pub chunk_size: u32,
    pub lock_timeout: Duration,
    pub lock_access_attempt: Duration,
    pub cache_timeout: Duration,
    pub cache_max_elements: usize,
    pub data_cache_timeout: Duration,
    pub data_cache_max_elements: usize,
    pub host: String,
    pub development: bool,
    pub default_root_mode: u32,
    pub force_root_mode: bool,
    /// Surfaces lock contention as `EDEADLK` instead of `EAGAIN`, matching
    /// deployments that still expect the old master-lock semantics. See
    /// spec §9.
    pub legacy_lock_errno: bool,
}

fn seconds_or_infinite(value: i64) -> Duration {
    if value <= 0 {
        EFFECTIVELY_INFINITE
    } else {
        Duration::from_secs(value as u64)
    }
}

fn elements_or_unbounded(value: i64) -> usize {
    if value <= 0 { 0 } else { value as usize }
}

impl Config {
    /// Parse and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Config> {
        let raw: RawConfig = serde_json::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("malformed config: {e}")))?;

        if raw.mongo.hosts.is_empty() {
            return Err(Error::InvalidConfig("mongo.hosts must not be empty".into()));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&raw.mongo.chunk_size) {
            return Err(Error::InvalidConfig(format!(
                "mongo.chunk_size must be in [1, {MAX_CHUNK_SIZE}], got {}",
                raw.mongo.chunk_size
            )));
        }
        let default_root_mode = u32::from_str_radix(
            raw.default_root_mode.trim_start_matches("0o"),
            8,
        )
        .map_err(|e| Error::InvalidConfig(format!("default_root_mode must be octal: {e}")))?;

        Ok(Config {
            mongo_hosts: raw.mongo.hosts,
            mongo_database: raw.mongo.database,
            mongo_prefix: raw.mongo.prefix,
            mongo_access_attempt: seconds_or_infinite(raw.mongo.access_attempt_s),
            mongo_write_acknowledgement: raw.mongo.write_acknowledgement,
            mongo_write_journal: raw.mongo.write_j,
            chunk_size: raw.mongo.chunk_size as u32,
            lock_timeout: seconds_or_infinite(raw.lock.timeout_s),
            lock_access_attempt: seconds_or_infinite(raw.lock.access_attempt_s),
            cache_timeout: seconds_or_infinite(raw.cache.timeout_s),
            cache_max_elements: elements_or_unbounded(raw.cache.max_elements),
            data_cache_timeout: seconds_or_infinite(raw.data_cache.timeout_s),
            data_cache_max_elements: elements_or_unbounded(raw.data_cache.max_elements),
            host: raw.host,
            development: raw.development,
            default_root_mode,
            force_root_mode: raw.force_root_mode,
            legacy_lock_errno: raw.legacy_lock_errno,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(chunk_size: i64) -> String {
        format!(
            r#"{{
                "mongo": {{"hosts": ["localhost:27017"], "database": "mongofs", "prefix": "",
                            "access_attempt_s": 30, "write_acknowledgement": 1,
                            "write_j": false, "chunk_size": {chunk_size}}},
                "lock": {{"timeout_s": 60, "access_attempt_s": 10}},
                "cache": {{"timeout_s": 5, "max_elements": 1000}},
                "data_cache": {{"timeout_s": 5, "max_elements": 1000}},
                "host": "node-a", "development": true,
                "default_root_mode": "0755", "force_root_mode": false
            }}"#
        )
    }

    #[test]
    fn parses_valid_config() {
        let cfg = Config::parse(&sample(262144)).unwrap();
        assert_eq!(cfg.chunk_size, 262144);
        assert_eq!(cfg.default_root_mode, 0o755);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_or_negative_seconds_become_effectively_infinite() {
        let text = sample(1024).replace("\"access_attempt_s\": 30", "\"access_attempt_s\": 0");
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.mongo_access_attempt, EFFECTIVELY_INFINITE);
    }

    #[test]
    fn rejects_oversized_chunk() {
        let err = Config::parse(&sample(16 * 1024 * 1024)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_chunk() {
        let err = Config::parse(&sample(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
