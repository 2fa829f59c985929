//! Backend instance selection: resolves a role bitfield to one concrete
//! server from the configured set.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{ServerRole, ServerTarget};

use super::RouteTarget;

/// Strategy for selecting an instance from a candidate list
pub trait InstanceSelector: Send + Sync {
    /// Select one index from the candidates, None if the list is empty
    fn select(&self, candidates: &[usize]) -> Option<usize>;
}

/// Select the first candidate (default strategy for primaries)
#[derive(Debug, Default)]
pub struct FirstSelector;

impl InstanceSelector for FirstSelector {
    fn select(&self, candidates: &[usize]) -> Option<usize> {
        candidates.first().copied()
    }
}

/// Round-robin selection (default strategy for replicas)
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl InstanceSelector for RoundRobinSelector {
    fn select(&self, candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx])
    }
}

/// Resolves the role portion of a route target to a server index.
///
/// `ALL` is not resolved here: broadcast fan-out is the session's job.
pub struct TargetResolver {
    primary_selector: Box<dyn InstanceSelector>,
    replica_selector: Box<dyn InstanceSelector>,
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self {
            primary_selector: Box::new(FirstSelector),
            replica_selector: Box::new(RoundRobinSelector::new()),
        }
    }
}

impl TargetResolver {
    pub fn new(
        primary_selector: Box<dyn InstanceSelector>,
        replica_selector: Box<dyn InstanceSelector>,
    ) -> Self {
        Self {
            primary_selector,
            replica_selector,
        }
    }

    /// Resolve a target to an index into `servers`.
    ///
    /// A replica target falls back to a primary when no replica is
    /// configured; LAST_USED falls back to the primary when no previous
    /// server exists.
    pub fn resolve(
        &self,
        servers: &[ServerTarget],
        target: RouteTarget,
        named_server: Option<&str>,
        last_used: Option<usize>,
    ) -> Option<usize> {
        if target.contains(RouteTarget::NAMED_SERVER) {
            if let Some(name) = named_server {
                if let Some(idx) = servers.iter().position(|s| s.name == name) {
                    return Some(idx);
                }
            }
        }

        if target.contains(RouteTarget::LAST_USED) {
            if let Some(idx) = last_used {
                return Some(idx);
            }
            return self.primary_selector.select(&by_role(servers, ServerRole::Primary));
        }

        if target.contains(RouteTarget::REPLICA) {
            let replicas = by_role(servers, ServerRole::Replica);
            if replicas.is_empty() {
                // Fallback to a primary if no replicas are available
                return self.primary_selector.select(&by_role(servers, ServerRole::Primary));
            }
            return self.replica_selector.select(&replicas);
        }

        self.primary_selector.select(&by_role(servers, ServerRole::Primary))
    }
}

fn by_role(servers: &[ServerTarget], role: ServerRole) -> Vec<usize> {
    servers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.role == role)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, role: ServerRole) -> ServerTarget {
        ServerTarget {
            name: name.to_string(),
            host: name.to_string(),
            port: 3306,
            role,
        }
    }

    fn test_servers() -> Vec<ServerTarget> {
        vec![
            server("primary-1", ServerRole::Primary),
            server("replica-1", ServerRole::Replica),
            server("replica-2", ServerRole::Replica),
        ]
    }

    #[test]
    fn primary_resolution() {
        let resolver = TargetResolver::default();
        let servers = test_servers();
        assert_eq!(
            resolver.resolve(&servers, RouteTarget::PRIMARY, None, None),
            Some(0)
        );
    }

    #[test]
    fn replicas_round_robin() {
        let resolver = TargetResolver::default();
        let servers = test_servers();
        let a = resolver.resolve(&servers, RouteTarget::REPLICA, None, None);
        let b = resolver.resolve(&servers, RouteTarget::REPLICA, None, None);
        let c = resolver.resolve(&servers, RouteTarget::REPLICA, None, None);
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(2));
        assert_eq!(c, Some(1)); // wraps around
    }

    #[test]
    fn replica_falls_back_to_primary() {
        let resolver = TargetResolver::default();
        let servers = vec![server("primary-1", ServerRole::Primary)];
        assert_eq!(
            resolver.resolve(&servers, RouteTarget::REPLICA, None, None),
            Some(0)
        );
    }

    #[test]
    fn named_server_wins() {
        let resolver = TargetResolver::default();
        let servers = test_servers();
        let target = RouteTarget::REPLICA | RouteTarget::NAMED_SERVER;
        assert_eq!(
            resolver.resolve(&servers, target, Some("replica-2"), None),
            Some(2)
        );
    }

    #[test]
    fn last_used_prefers_previous_server() {
        let resolver = TargetResolver::default();
        let servers = test_servers();
        assert_eq!(
            resolver.resolve(&servers, RouteTarget::LAST_USED, None, Some(2)),
            Some(2)
        );
        // Without history, fall back to the primary
        assert_eq!(
            resolver.resolve(&servers, RouteTarget::LAST_USED, None, None),
            Some(0)
        );
    }

    #[test]
    fn empty_server_list() {
        let resolver = TargetResolver::default();
        assert_eq!(resolver.resolve(&[], RouteTarget::PRIMARY, None, None), None);
    }
}
