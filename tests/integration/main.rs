//! Integration test entry point.
//!
//! These tests drive a running hermes proxy in front of a real
//! MariaDB/MySQL primary (and optionally replicas). They are skipped unless
//! explicitly enabled:
//!
//! Run with: HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod prepared;
mod rw_split;
mod session_state;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration testing is enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("skipping: set HERMES_RUN_INTEGRATION_TESTS=1 to enable");
            return;
        }
    };
}

/// Proxy endpoint configuration from the environment
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Open a pooled connection through the proxy
    pub fn conn(&self) -> mysql::PooledConn {
        let pool = mysql::Pool::new(self.connection_string().as_str())
            .expect("connecting through the proxy should succeed");
        pool.get_conn().expect("getting a connection should succeed")
    }
}

pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}
