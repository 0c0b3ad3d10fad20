//! Process configuration, read from environment variables.
//!
//! Blank values count as unset. Malformed numbers and booleans fall back to
//! their defaults; only an unknown store backend is rejected.

use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;

use crate::connection::ConnectionConfig;
use crate::presence::DEFAULT_KEY_PREFIX;
use crate::store::{RedisConfig, StoreBackend, StoreConfig};

const DEFAULT_ALLOW_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS";
const DEFAULT_ALLOW_HEADERS: &str = "Origin,Content-Type,Accept,Authorization";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown store backend {0:?} (expected redis, rocksdb or memory)")]
    UnknownStore(String),
}

/// Cross-origin policy for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    /// Allowed origins; a single `*` allows any
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime; zero disables the header
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_methods: split_list(DEFAULT_ALLOW_METHODS),
            allow_headers: split_list(DEFAULT_ALLOW_HEADERS),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: Duration::from_secs(600),
        }
    }
}

impl CorsConfig {
    /// Whether any origin is accepted.
    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.len() == 1 && self.allow_origins[0] == "*"
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Presence store backend
    pub store: StoreBackend,
    /// Prefix for every presence store key
    pub key_prefix: String,
    /// Per-connection transport limits
    pub connection: ConnectionConfig,
    pub cors: CorsConfig,
    pub log_level: LevelFilter,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            store: StoreBackend::Redis(RedisConfig::default()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connection: ConnectionConfig::default(),
            cors: CorsConfig::default(),
            log_level: LevelFilter::Info,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let bind_addr = get("WSRELAY_ADDR")
            .map(|addr| normalize_bind_addr(&addr))
            .unwrap_or(defaults.bind_addr);

        let ws_path = match get("WSRELAY_WS_PATH") {
            Some(path) if path.starts_with('/') => path,
            Some(path) => format!("/{path}"),
            None => defaults.ws_path,
        };

        let backend = get("WSRELAY_STORE").unwrap_or_else(|| "redis".to_string());
        let store = match backend.to_ascii_lowercase().as_str() {
            "redis" => StoreBackend::Redis(RedisConfig {
                addr: get("REDIS_ADDR").unwrap_or_else(|| RedisConfig::default().addr),
                password: get("REDIS_PASSWORD"),
                db: parse_or(get("REDIS_DB"), 0),
                ..RedisConfig::default()
            }),
            "rocksdb" | "rocks" => StoreBackend::Rocks(StoreConfig {
                path: get("WSRELAY_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| StoreConfig::default().path),
                ..StoreConfig::default()
            }),
            "memory" => StoreBackend::Memory,
            _ => return Err(ConfigError::UnknownStore(backend)),
        };

        let connection = ConnectionConfig {
            send_queue_capacity: parse_or(
                get("WSRELAY_SEND_QUEUE"),
                defaults.connection.send_queue_capacity,
            )
            .max(1),
            ..defaults.connection
        };

        let cors = CorsConfig {
            allow_origins: get("CORS_ALLOW_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.cors.allow_origins),
            allow_methods: get("CORS_ALLOW_METHODS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.cors.allow_methods),
            allow_headers: get("CORS_ALLOW_HEADERS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.cors.allow_headers),
            expose_headers: get("CORS_EXPOSE_HEADERS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            allow_credentials: get("CORS_ALLOW_CREDENTIALS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            max_age: Duration::from_secs(parse_or(
                get("CORS_MAX_AGE"),
                defaults.cors.max_age.as_secs(),
            )),
        };

        Ok(Self {
            bind_addr,
            ws_path,
            store,
            key_prefix: get("WSRELAY_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            connection,
            cors,
            log_level: parse_log_level(get("LOG_LEVEL").as_deref().unwrap_or("")),
        })
    }
}

/// Map a `LOG_LEVEL` value to a filter. Unknown values mean `info`.
pub fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// `:8080` binds every interface.
fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Comma-separated list, entries trimmed, blanks dropped.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.key_prefix, "kv");
        assert_eq!(config.store, StoreBackend::Redis(RedisConfig::default()));
        assert_eq!(config.cors.allow_methods.len(), 6);
        assert_eq!(config.cors.max_age, Duration::from_secs(600));
        assert!(config.cors.allows_any_origin());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WSRELAY_ADDR", ":9000"),
            ("WSRELAY_WS_PATH", "live"),
            ("REDIS_ADDR", "cache:6380"),
            ("REDIS_PASSWORD", "pw"),
            ("REDIS_DB", "3"),
            ("WSRELAY_KEY_PREFIX", "demo"),
            ("WSRELAY_SEND_QUEUE", "16"),
            ("LOG_LEVEL", "WARNING"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.ws_path, "/live");
        assert_eq!(
            config.store,
            StoreBackend::Redis(RedisConfig {
                addr: "cache:6380".into(),
                password: Some("pw".into()),
                db: 3,
                ..RedisConfig::default()
            })
        );
        assert_eq!(config.key_prefix, "demo");
        assert_eq!(config.connection.send_queue_capacity, 16);
        assert_eq!(config.log_level, LevelFilter::Warn);
    }

    #[test]
    fn test_store_selection() {
        let config = load(&[("WSRELAY_STORE", "RocksDB"), ("WSRELAY_DATA_DIR", "/tmp/kv")]).unwrap();
        let StoreBackend::Rocks(rocks) = config.store else {
            panic!("expected rocksdb backend");
        };
        assert_eq!(rocks.path, PathBuf::from("/tmp/kv"));

        let config = load(&[("WSRELAY_STORE", "memory")]).unwrap();
        assert_eq!(config.store, StoreBackend::Memory);

        assert_eq!(
            load(&[("WSRELAY_STORE", "etcd")]),
            Err(ConfigError::UnknownStore("etcd".into()))
        );
    }

    #[test]
    fn test_cors_lists() {
        let config = load(&[
            ("CORS_ALLOW_ORIGINS", " https://a.example , ,https://b.example "),
            ("CORS_EXPOSE_HEADERS", "X-Request-Id"),
            ("CORS_ALLOW_CREDENTIALS", "TRUE"),
            ("CORS_MAX_AGE", "0"),
        ])
        .unwrap();
        assert_eq!(
            config.cors.allow_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert!(!config.cors.allows_any_origin());
        assert_eq!(config.cors.expose_headers, vec!["X-Request-Id"]);
        assert!(config.cors.allow_credentials);
        assert_eq!(config.cors.max_age, Duration::ZERO);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = load(&[
            ("REDIS_DB", "two"),
            ("WSRELAY_SEND_QUEUE", "-5"),
            ("CORS_ALLOW_CREDENTIALS", "yes"),
            ("CORS_MAX_AGE", "-1"),
            ("LOG_LEVEL", "verbose"),
            ("WSRELAY_ADDR", "   "),
        ])
        .unwrap();
        assert_eq!(config.store, StoreBackend::Redis(RedisConfig::default()));
        assert_eq!(config.connection.send_queue_capacity, 256);
        assert!(!config.cors.allow_credentials);
        assert_eq!(config.cors.max_age, Duration::from_secs(600));
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_log_level(" Info "), LevelFilter::Info);
        assert_eq!(parse_log_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_log_level("ERROR"), LevelFilter::Error);
        assert_eq!(parse_log_level(""), LevelFilter::Info);
    }
}
