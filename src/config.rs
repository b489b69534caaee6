use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variables that together select the remote backend.
pub const REMOTE_ENV_VARS: [&str; 4] = [
    "CONTACTS_INSTANCE_CONNECTION_NAME",
    "CONTACTS_DB_USER",
    "CONTACTS_DB_PASS",
    "CONTACTS_DB_NAME",
];

const DEFAULT_SECRET_KEY: &str = "fallback-dev-key";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub backend: BackendConfig,
    pub pool: PoolConfig,
    pub seed_sample_contacts: bool,
    /// Signing secret for the routing layer; the storage core never reads it.
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local(LocalConfig),
    Remote(RemoteConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub database_path: PathBuf,
    /// Remote variables that were set but ignored because the set was incomplete.
    pub ignored_remote_vars: Vec<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub instance_connection_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub db_name: String,
    pub private_ip: bool,
    pub proxy_bin: String,
    pub proxy_port: u16,
    pub proxy_startup_timeout: Duration,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("instance_connection_name", &self.instance_connection_name)
            .field("db_user", &self.db_user)
            .field("db_pass", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("private_ip", &self.private_ip)
            .field("proxy_bin", &self.proxy_bin)
            .field("proxy_port", &self.proxy_port)
            .field("proxy_startup_timeout", &self.proxy_startup_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8000u16, "must be a valid u16")?;

        let bind_addr = non_blank(&env_map, "BIND_ADDR")
            .unwrap_or("0.0.0.0")
            .to_string();

        let backend = select_backend(&env_map)?;

        let max_connections = parse_or(
            &env_map,
            "DB_MAX_CONNECTIONS",
            PoolConfig::default().max_connections,
            "must be a positive u32",
        )?;
        if max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "DB_MAX_CONNECTIONS".to_string(),
                "must be a positive u32".to_string(),
            ));
        }

        let acquire_timeout_ms = parse_or(
            &env_map,
            "DB_ACQUIRE_TIMEOUT_MS",
            30_000u64,
            "must be a valid u64",
        )?;

        let seed_sample_contacts = match non_blank(&env_map, "SEED_SAMPLE_CONTACTS") {
            None => true,
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "SEED_SAMPLE_CONTACTS".to_string(),
                    format!("must be true or false, got {}", raw),
                )
            })?,
        };

        let secret_key = non_blank(&env_map, "SECRET_KEY")
            .unwrap_or(DEFAULT_SECRET_KEY)
            .to_string();

        Ok(Config {
            port,
            bind_addr,
            backend,
            pool: PoolConfig {
                max_connections,
                acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            },
            seed_sample_contacts,
            secret_key,
        })
    }

    /// Configuration for a local database file with default settings.
    pub fn local(database_path: impl Into<PathBuf>) -> Self {
        Config {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            backend: BackendConfig::Local(LocalConfig {
                database_path: database_path.into(),
                ignored_remote_vars: Vec::new(),
            }),
            pool: PoolConfig::default(),
            seed_sample_contacts: true,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
        }
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }
}

/// Decide the storage backend from the environment.
///
/// The remote backend is chosen only when all four `CONTACTS_*` variables are
/// present and non-blank. Any partial set falls back to the local file and
/// records which variables were ignored, so the resolver can warn about it.
pub fn select_backend(env_map: &HashMap<String, String>) -> Result<BackendConfig, ConfigError> {
    let present: Vec<&str> = REMOTE_ENV_VARS
        .iter()
        .copied()
        .filter(|key| non_blank(env_map, key).is_some())
        .collect();

    if present.len() == REMOTE_ENV_VARS.len() {
        let get = |key: &str| non_blank(env_map, key).unwrap_or_default().to_string();
        let proxy_port = parse_or(env_map, "CLOUD_SQL_PROXY_PORT", 3307u16, "must be a valid u16")?;
        let startup_ms = parse_or(
            env_map,
            "CLOUD_SQL_PROXY_STARTUP_TIMEOUT_MS",
            30_000u64,
            "must be a valid u64",
        )?;

        return Ok(BackendConfig::Remote(RemoteConfig {
            instance_connection_name: get("CONTACTS_INSTANCE_CONNECTION_NAME"),
            db_user: get("CONTACTS_DB_USER"),
            db_pass: get("CONTACTS_DB_PASS"),
            db_name: get("CONTACTS_DB_NAME"),
            private_ip: non_blank(env_map, "PRIVATE_IP").is_some(),
            proxy_bin: non_blank(env_map, "CLOUD_SQL_PROXY_BIN")
                .unwrap_or("cloud-sql-proxy")
                .to_string(),
            proxy_port,
            proxy_startup_timeout: Duration::from_millis(startup_ms),
        }));
    }

    let database_path = non_blank(env_map, "DATABASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("contacts.db"));

    Ok(BackendConfig::Local(LocalConfig {
        database_path,
        ignored_remote_vars: present.into_iter().map(str::to_string).collect(),
    }))
}

fn non_blank<'a>(env_map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env_map
        .get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expectation: &str,
) -> Result<T, ConfigError> {
    match non_blank(env_map, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), expectation.to_string())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
