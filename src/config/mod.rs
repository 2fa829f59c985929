//! Proxy configuration: a TOML file with the listener, client credentials,
//! routing knobs, shared backend settings, pool sizing and the server list.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::router::UseSqlVariablesIn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub backend: BackendSettings,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub servers: Vec<ServerTarget>,
}

impl Config {
    /// Load one configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse { path: shown, source })
    }

    /// Try candidate paths in order and return the first that loads.
    /// Missing files move on to the next candidate; a file that exists but
    /// does not parse is an error, never silently skipped.
    pub fn load_first(candidates: &[&str]) -> Result<Option<Config>, ConfigError> {
        for path in candidates {
            match Self::load(path) {
                Ok(config) => {
                    info!(path, "loaded configuration");
                    return Ok(Some(config));
                }
                Err(ConfigError::Read { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    3307
}

/// Credentials connecting clients must present
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    /// Where statements touching SQL variables may execute
    #[serde(default)]
    pub use_sql_variables_in: UseSqlVariablesIn,
    /// Offer CLIENT_MULTI_STATEMENTS to clients and backends
    #[serde(default)]
    pub multi_statements: bool,
}

/// Per-backend connection settings shared by every server target
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Queries executed after authentication on every new connection
    #[serde(default)]
    pub init_queries: Vec<String>,
    /// Prepend a proxy-protocol v1 header before the handshake
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Request a TLS upgrade during the handshake
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub multi_statements: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    30
}

impl BackendSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Role of a configured server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Primary,
    Replica,
}

/// One upstream database server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerTarget {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default)]
    pub role: ServerRole,
}

fn default_mysql_port() -> u16 {
    3306
}

impl ServerTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_primary(&self) -> bool {
        self.role == ServerRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        self.role == ServerRole::Replica
    }
}

/// Reusable backend connection pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Maximum connection age before recycling, seconds
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Maximum idle time before closing, seconds
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_max_idle() -> usize {
    10
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_max_idle_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_age_secs: default_max_age_secs(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 3307,
            },
            client: ClientConfig::default(),
            routing: RoutingConfig::default(),
            backend: BackendSettings {
                user: "root".to_string(),
                password: String::new(),
                database: None,
                init_queries: vec![],
                proxy_protocol: false,
                ssl: false,
                multi_statements: false,
                connect_timeout_secs: default_connect_timeout_secs(),
                write_timeout_secs: default_write_timeout_secs(),
            },
            pool: PoolConfig::default(),
            servers: vec![ServerTarget {
                name: "primary-1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 3306,
                role: ServerRole::Primary,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 4000

            [client]
            user = "app"
            password = "secret"

            [routing]
            use_sql_variables_in = "primary"
            multi_statements = true

            [backend]
            user = "proxy"
            password = "proxypw"
            database = "shop"
            init_queries = ["SET NAMES utf8mb4"]

            [pool]
            max_idle = 4

            [[servers]]
            name = "db-1"
            host = "10.0.0.1"
            role = "primary"

            [[servers]]
            name = "db-2"
            host = "10.0.0.2"
            port = 3307
            role = "replica"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 4000);
        assert_eq!(config.client.user, "app");
        assert_eq!(
            config.routing.use_sql_variables_in,
            UseSqlVariablesIn::Primary
        );
        assert!(config.routing.multi_statements);
        assert_eq!(config.backend.init_queries.len(), 1);
        assert_eq!(config.pool.max_idle, 4);
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].is_primary());
        assert!(config.servers[1].is_replica());
        assert_eq!(config.servers[1].addr(), "10.0.0.2:3307");
    }

    #[test]
    fn defaults_apply() {
        let toml = r#"
            [server]
            listen_addr = "127.0.0.1"

            [backend]
            user = "root"
            password = ""
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 3307);
        assert_eq!(config.routing.use_sql_variables_in, UseSqlVariablesIn::All);
        assert!(!config.backend.ssl);
        assert_eq!(config.pool.max_idle, 10);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/hermes.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parse_failure_names_the_file() {
        let path = std::env::temp_dir().join(format!("hermes-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "server = [not, valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("hermes-bad"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_first_skips_missing_candidates() {
        let found = Config::load_first(&["/nonexistent/a.toml", "/nonexistent/b.toml"]).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn load_first_does_not_skip_broken_files() {
        let path = std::env::temp_dir().join(format!("hermes-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "???").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let result = Config::load_first(&["/nonexistent/a.toml", &path_str]);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));

        let _ = std::fs::remove_file(&path);
    }
}
