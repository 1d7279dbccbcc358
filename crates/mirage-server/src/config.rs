//! Environment-driven configuration.

use std::time::Duration;

use crate::storage::LocalStorageConfig;
use crate::store::CacheStrategy;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: &str = "8896";
const DEFAULT_GRPC_PORT: &str = "8897";

/// Database settings, accepted for compatibility with relational deployments.
/// The default build runs the in-memory store; these values are surfaced so a
/// store backend can be wired in without changing the env contract.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub server: String,
    pub schema: String,
    pub user: String,
    pub password: String,
}

/// Application configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub grpc_address: String,
    pub db: DbConfig,
    pub file_storage_type: String,
    pub file_storage: LocalStorageConfig,
    pub stub_cache_ttl: Duration,
    pub stub_cache_strategy: CacheStrategy,

    /// Bodies above this many bytes are not persisted with the capture.
    /// Zero means unlimited.
    pub body_store_threshold: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_address: format!("{DEFAULT_HOST}:{}", ev_string("SERVER_PORT", DEFAULT_HTTP_PORT)),
            grpc_address: format!("{DEFAULT_HOST}:{}", ev_string("GRPC_PORT", DEFAULT_GRPC_PORT)),
            db: DbConfig {
                server: ev_string("DB_SERVER", "0.0.0.0:3306"),
                schema: ev_string("DB_SCHEMA", "mirage_services"),
                user: ev_string("DB_USER", "admin"),
                password: ev_string("DB_PASSWORD", "password"),
            },
            file_storage_type: ev_string("FILE_STORAGE_TYPE", "local"),
            file_storage: LocalStorageConfig {
                storage_path: ev_string("FILE_DIR", "uploaded_files"),
                use_temp_dir: true,
            },
            stub_cache_ttl: ev_duration("STUB_CACHE_TTL", Duration::from_secs(3600)),
            stub_cache_strategy: CacheStrategy::parse(&ev_string("STUB_CACHE_STRATEGY", "default")),
            body_store_threshold: ev_usize("BODY_STORE_THRESHOLD", 1 << 20),
        }
    }
}

fn ev_string(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn ev_usize(name: &str, fallback: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("invalid integer for {name}: {v}")),
        Err(_) => fallback,
    }
}

/// Durations accept either plain seconds (`300`) or a unit suffix
/// (`90s`, `15m`, `1h`).
fn ev_duration(name: &str, fallback: Duration) -> Duration {
    let raw = match std::env::var(name) {
        Ok(v) => v,
        Err(_) => return fallback,
    };

    parse_duration(&raw).unwrap_or_else(|| panic!("invalid duration for {name}: {raw}"))
}

fn parse_duration(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}
