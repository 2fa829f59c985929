//! Reusable backend connections.
//!
//! Established connections whose session went away are parked here, keyed
//! by server index, and handed to the next session targeting the same
//! server without re-handshaking.

use std::collections::HashMap;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::BackendConnection;
use crate::config::PoolConfig;

/// Pool of idle, established backend connections
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<usize, Vec<BackendConnection<TcpStream>>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take an idle connection for the given server, discarding stale ones
    pub async fn checkout(&self, server: usize) -> Option<BackendConnection<TcpStream>> {
        let mut idle = self.idle.lock().await;
        let conns = idle.get_mut(&server)?;

        while let Some(conn) = conns.pop() {
            if conn.is_expired(self.config.max_age()) {
                debug!(server, "pooled connection expired, discarding");
                continue;
            }
            if conn.is_idle_too_long(self.config.max_idle_time()) {
                debug!(server, "pooled connection idle too long, discarding");
                continue;
            }
            debug!(server, thread_id = conn.thread_id(), "reusing pooled connection");
            return Some(conn);
        }

        None
    }

    /// Return a connection to the pool. Only connections that are safe to
    /// detach (routing, idle, no cursor, no transaction) are kept; the
    /// server-side state reset happens at checkout via `reuse()`.
    pub async fn checkin(&self, server: usize, conn: BackendConnection<TcpStream>) {
        if !conn.can_close() {
            debug!(server, "connection not reusable, dropping");
            return;
        }

        let mut idle = self.idle.lock().await;
        let conns = idle.entry(server).or_default();
        if conns.len() >= self.config.max_idle {
            debug!(server, "pool full, dropping connection");
            return;
        }
        conns.push(conn);
    }

    /// Number of idle connections for a server
    pub async fn idle_count(&self, server: usize) -> usize {
        self.idle.lock().await.get(&server).map_or(0, Vec::len)
    }
}
