//! Concurrent route registry: two DashMaps (HTTP hostname, TCP port), each
//! guarded independently so a lookup never blocks on an unrelated kind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::types::{HttpRoute, RouteKey, TcpRoute};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route already exists for {0:?}")]
    AlreadyExists(RouteKey),
    #[error("no route for {0:?}")]
    NotFound(RouteKey),
}

#[derive(Clone)]
pub struct RouteRegistry {
    http: Arc<DashMap<String, HttpRoute>>,
    tcp: Arc<DashMap<u16, TcpRoute>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            http: Arc::new(DashMap::new()),
            tcp: Arc::new(DashMap::new()),
        }
    }

    pub fn register_http(&self, host: String, route: HttpRoute) -> Result<(), RouteError> {
        if self.http.contains_key(&host) {
            return Err(RouteError::AlreadyExists(RouteKey::HttpHost(host)));
        }
        self.http.insert(host, route);
        Ok(())
    }

    pub fn lookup_http(&self, host: &str) -> Option<HttpRoute> {
        self.http.get(host).map(|r| r.value().clone())
    }

    pub fn unregister_http(&self, host: &str) -> Option<HttpRoute> {
        self.http.remove(host).map(|(_, r)| r)
    }

    pub fn register_tcp(&self, port: u16, route: TcpRoute) -> Result<(), RouteError> {
        if self.tcp.contains_key(&port) {
            return Err(RouteError::AlreadyExists(RouteKey::TcpPort(port)));
        }
        self.tcp.insert(port, route);
        Ok(())
    }

    pub fn lookup_tcp(&self, port: u16) -> Option<TcpRoute> {
        self.tcp.get(&port).map(|r| r.value().clone())
    }

    pub fn unregister_tcp(&self, port: u16) -> Option<TcpRoute> {
        self.tcp.remove(&port).map(|(_, r)| r)
    }

    /// Replaces the full route set atomically from a freshly validated
    /// config snapshot. Returns the set of HTTP hostnames and TCP ports
    /// that were present before and are absent after, for the caller
    /// (`TunnelManager::update_config`) to stop the corresponding tunnels.
    pub fn replace(
        &self,
        new_http: HashMap<String, HttpRoute>,
        new_tcp: HashMap<u16, TcpRoute>,
    ) -> (HashSet<String>, HashSet<u16>) {
        let removed_http: HashSet<String> = self
            .http
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| !new_http.contains_key(k))
            .collect();
        let removed_tcp: HashSet<u16> = self
            .tcp
            .iter()
            .map(|r| *r.key())
            .filter(|k| !new_tcp.contains_key(k))
            .collect();

        self.http.clear();
        for (host, route) in new_http {
            self.http.insert(host, route);
        }
        self.tcp.clear();
        for (port, route) in new_tcp {
            self.tcp.insert(port, route);
        }

        (removed_http, removed_tcp)
    }

    pub fn http_count(&self) -> usize {
        self.http.len()
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PodOrService, Scheme, TcpDirectRoute};

    fn http_route() -> HttpRoute {
        HttpRoute {
            context: "ctxA".into(),
            namespace: "nsA".into(),
            target: PodOrService::Service("svcA".into()),
            port: 80,
            scheme: Scheme::Http,
        }
    }

    fn tcp_route(port: u16) -> TcpRoute {
        TcpRoute::Direct(TcpDirectRoute {
            context: "ctxA".into(),
            namespace: "nsA".into(),
            target: PodOrService::Service("svcA".into()),
            port,
        })
    }

    #[test]
    fn register_and_lookup_http() {
        let registry = RouteRegistry::new();
        registry
            .register_http("app.local".into(), http_route())
            .unwrap();
        assert!(registry.lookup_http("app.local").is_some());
        assert!(registry.lookup_http("other.local").is_none());
    }

    #[test]
    fn duplicate_http_registration_errors() {
        let registry = RouteRegistry::new();
        registry
            .register_http("app.local".into(), http_route())
            .unwrap();
        let err = registry.register_http("app.local".into(), http_route());
        assert!(matches!(err, Err(RouteError::AlreadyExists(_))));
    }

    #[test]
    fn register_and_lookup_tcp() {
        let registry = RouteRegistry::new();
        registry.register_tcp(5432, tcp_route(5432)).unwrap();
        assert!(registry.lookup_tcp(5432).is_some());
        assert!(registry.lookup_tcp(5433).is_none());
    }

    #[test]
    fn unregister_removes_entries() {
        let registry = RouteRegistry::new();
        registry
            .register_http("app.local".into(), http_route())
            .unwrap();
        assert!(registry.unregister_http("app.local").is_some());
        assert!(registry.lookup_http("app.local").is_none());
    }

    #[test]
    fn replace_reports_removed_keys() {
        let registry = RouteRegistry::new();
        registry
            .register_http("old.local".into(), http_route())
            .unwrap();
        registry.register_tcp(1000, tcp_route(1000)).unwrap();

        let mut new_http = HashMap::new();
        new_http.insert("new.local".into(), http_route());
        let new_tcp = HashMap::new();

        let (removed_http, removed_tcp) = registry.replace(new_http, new_tcp);
        assert!(removed_http.contains("old.local"));
        assert!(removed_tcp.contains(&1000));
        assert!(registry.lookup_http("new.local").is_some());
        assert!(registry.lookup_tcp(1000).is_none());
    }
}
