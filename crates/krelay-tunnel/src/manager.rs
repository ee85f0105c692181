//! `TunnelManager` (spec §4.5): the registry of tunnels keyed by HTTP
//! hostname or TCP port, the idle reaper, and config-driven lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use krelay_k8s::ClusterApi;
use krelay_router::{parse_dynamic_hostname, HttpRoute, RouteRegistry, Scheme, TcpRoute};

use crate::state::TunnelState;
use crate::tunnel::{RouteTarget, Tunnel, TunnelError};

const REAP_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no route for host {0:?}")]
    NoRouteForKey(String),
    #[error("no route for TCP port {0}")]
    NoRouteForPort(u16),
    #[error("TCP port {0} is a jump route, not a tunnel-backed route")]
    NotDirectRoute(u16),
    #[error("tunnel failed to start: {0}")]
    TunnelFailed(#[from] TunnelError),
}

/// Routes and idle-timeout settings supplied by `krelay-config` at load and
/// reload time. `TunnelManager` folds the route tables into its
/// `RouteRegistry` (spec §3: the manager and the config snapshot key routes
/// identically, reusing the same registry `krelay-router` exposes).
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    pub http: HashMap<String, HttpRoute>,
    pub tcp: HashMap<u16, TcpRoute>,
    pub dynamic_host_suffix: Option<String>,
    pub http_idle_timeout: Duration,
    pub tcp_idle_timeout: Option<Duration>,
}

#[derive(Clone)]
struct Settings {
    dynamic_host_suffix: Option<String>,
    http_idle_timeout: Duration,
    tcp_idle_timeout: Option<Duration>,
}

impl Settings {
    /// Spec §4.5.2: TCP tunnels use the TCP idle timeout; "unset" (`None`,
    /// which the config layer also uses for a literal `0`) inherits the
    /// HTTP timeout.
    fn tcp_idle_timeout(&self) -> Duration {
        self.tcp_idle_timeout.unwrap_or(self.http_idle_timeout)
    }
}

impl From<&RouteSnapshot> for Settings {
    fn from(snapshot: &RouteSnapshot) -> Self {
        Settings {
            dynamic_host_suffix: snapshot.dynamic_host_suffix.clone(),
            http_idle_timeout: snapshot.http_idle_timeout,
            tcp_idle_timeout: snapshot.tcp_idle_timeout,
        }
    }
}

pub struct TunnelManager {
    cluster: Arc<dyn ClusterApi>,
    client_cache: Arc<krelay_k8s::ClientCache>,
    registry: RouteRegistry,
    http_tunnels: DashMap<String, Tunnel>,
    tcp_tunnels: DashMap<u16, Tunnel>,
    settings: tokio::sync::RwLock<Settings>,
    reaper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        client_cache: Arc<krelay_k8s::ClientCache>,
        snapshot: RouteSnapshot,
    ) -> Arc<Self> {
        let registry = RouteRegistry::new();
        let settings = Settings::from(&snapshot);
        registry.replace(snapshot.http, snapshot.tcp);

        Arc::new(Self {
            cluster,
            client_cache,
            registry,
            http_tunnels: DashMap::new(),
            tcp_tunnels: DashMap::new(),
            settings: tokio::sync::RwLock::new(settings),
            reaper: tokio::sync::Mutex::new(None),
        })
    }

    /// Launches the idle-reaper background task (spec §4.5 `start()`).
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.reaper.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            this.reap_loop().await;
        }));
    }

    async fn reap_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REAP_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.reap_once().await;
        }
    }

    /// One idle-reaper sweep (spec §4.5.2). Exposed separately from the
    /// periodic loop so tests can drive it deterministically.
    pub async fn reap_once(&self) {
        let (http_idle, tcp_idle) = {
            let settings = self.settings.read().await;
            (settings.http_idle_timeout, settings.tcp_idle_timeout())
        };

        let mut stale_http = Vec::new();
        for entry in self.http_tunnels.iter() {
            if entry.value().is_running().await && entry.value().idle_duration().await > http_idle {
                stale_http.push(entry.key().clone());
            }
        }
        for host in stale_http {
            if let Some((_, tunnel)) = self.http_tunnels.remove(&host) {
                let idle = tunnel.idle_duration().await;
                tunnel.stop().await;
                info!(host, idle_secs = idle.as_secs(), "reaped idle tunnel");
            }
        }

        let mut stale_tcp = Vec::new();
        for entry in self.tcp_tunnels.iter() {
            if entry.value().is_running().await && entry.value().idle_duration().await > tcp_idle {
                stale_tcp.push(*entry.key());
            }
        }
        for port in stale_tcp {
            if let Some((_, tunnel)) = self.tcp_tunnels.remove(&port) {
                let idle = tunnel.idle_duration().await;
                tunnel.stop().await;
                info!(port, idle_secs = idle.as_secs(), "reaped idle tunnel");
            }
        }
    }

    /// Spec §4.5 `get_or_open`: returns a tunnel guaranteed `Running`
    /// (or an error), creating and/or starting it as needed. Concurrent
    /// callers for the same host collapse onto the single `Tunnel`
    /// instance's own `ensure_running` single-flight.
    pub async fn get_or_open(&self, host: &str, scheme: Scheme) -> Result<Tunnel, ManagerError> {
        let tunnel = match self.existing_http(host).await {
            Some(tunnel) => tunnel,
            None => self.create_http(host, scheme).await?,
        };
        tunnel.touch().await;
        tunnel.ensure_running().await?;
        Ok(tunnel)
    }

    async fn existing_http(&self, host: &str) -> Option<Tunnel> {
        let tunnel = self.http_tunnels.get(host)?.value().clone();
        if tunnel.state().await == TunnelState::Failed {
            self.http_tunnels.remove(host);
            return None;
        }
        Some(tunnel)
    }

    async fn create_http(&self, host: &str, scheme: Scheme) -> Result<Tunnel, ManagerError> {
        let route = self.resolve_http_route(host).await?;
        self.client_cache
            .client_for(&route.context)
            .await
            .map_err(|_| ManagerError::NoRouteForKey(host.to_string()))?;

        let tunnel = Tunnel::new(
            krelay_router::RouteKey::HttpHost(host.to_string()),
            RouteTarget {
                context: route.context,
                namespace: route.namespace,
                target: route.target,
                port: route.port,
                scheme: Some(scheme),
            },
            self.cluster.clone(),
        );
        // A concurrent caller may have inserted first; DashMap::entry keeps
        // only one winner so every caller observes the same Tunnel.
        let winner = self
            .http_tunnels
            .entry(host.to_string())
            .or_insert(tunnel)
            .value()
            .clone();
        Ok(winner)
    }

    async fn resolve_http_route(&self, host: &str) -> Result<HttpRoute, ManagerError> {
        if let Some(route) = self.registry.lookup_http(host) {
            return Ok(route);
        }

        let suffix = self.settings.read().await.dynamic_host_suffix.clone();
        if let Some(suffix) = suffix {
            if let Ok(resolved) = parse_dynamic_hostname(host, &suffix) {
                return Ok(HttpRoute {
                    context: resolved.context,
                    namespace: resolved.namespace,
                    target: resolved.target,
                    port: resolved.port,
                    scheme: Scheme::Http,
                });
            }
        }

        Err(ManagerError::NoRouteForKey(host.to_string()))
    }

    /// Spec §4.5 `get_or_open_tcp`. Only direct TCP routes are tunnel-backed
    /// (spec §4.7); jump routes are handled upstream by the caller before a
    /// lookup ever reaches this path, but a jump key here is still a
    /// well-typed error rather than a silent no-op.
    pub async fn get_or_open_tcp(&self, port: u16) -> Result<Tunnel, ManagerError> {
        let tunnel = match self.existing_tcp(port).await {
            Some(tunnel) => tunnel,
            None => self.create_tcp(port).await?,
        };
        tunnel.touch().await;
        tunnel.ensure_running().await?;
        Ok(tunnel)
    }

    async fn existing_tcp(&self, port: u16) -> Option<Tunnel> {
        let tunnel = self.tcp_tunnels.get(&port)?.value().clone();
        if tunnel.state().await == TunnelState::Failed {
            self.tcp_tunnels.remove(&port);
            return None;
        }
        Some(tunnel)
    }

    async fn create_tcp(&self, port: u16) -> Result<Tunnel, ManagerError> {
        let route = match self.registry.lookup_tcp(port) {
            Some(TcpRoute::Direct(route)) => route,
            Some(TcpRoute::Jump(_)) => return Err(ManagerError::NotDirectRoute(port)),
            None => return Err(ManagerError::NoRouteForPort(port)),
        };

        self.client_cache
            .client_for(&route.context)
            .await
            .map_err(|_| ManagerError::NoRouteForPort(port))?;

        let tunnel = Tunnel::new(
            krelay_router::RouteKey::TcpPort(port),
            RouteTarget {
                context: route.context,
                namespace: route.namespace,
                target: route.target,
                port: route.port,
                scheme: None,
            },
            self.cluster.clone(),
        );
        let winner = self.tcp_tunnels.entry(port).or_insert(tunnel).value().clone();
        Ok(winner)
    }

    /// Returns the jump route for `port`, if the registry has one, so the
    /// proxy's `TcpListener` can dispatch without duplicating lookups.
    pub fn lookup_tcp_route(&self, port: u16) -> Option<TcpRoute> {
        self.registry.lookup_tcp(port)
    }

    /// Spec §4.5: diffs old vs. new routes and stops tunnels whose keys were
    /// removed, leaving every other tunnel's state untouched.
    pub async fn update_config(&self, snapshot: RouteSnapshot) {
        let new_settings = Settings::from(&snapshot);
        let (removed_http, removed_tcp) = self.registry.replace(snapshot.http, snapshot.tcp);

        for host in removed_http {
            if let Some((_, tunnel)) = self.http_tunnels.remove(&host) {
                tunnel.stop().await;
                debug!(host, "stopped tunnel removed from config");
            }
        }
        for port in removed_tcp {
            if let Some((_, tunnel)) = self.tcp_tunnels.remove(&port) {
                tunnel.stop().await;
                debug!(port, "stopped tunnel removed from config");
            }
        }

        *self.settings.write().await = new_settings;
    }

    /// Spec §4.5 `shutdown()`: cancels all tunnels, clears the client
    /// cache, joins the reaper.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reaper.lock().await.take() {
            task.abort();
        }
        for entry in self.http_tunnels.iter() {
            entry.value().stop().await;
        }
        for entry in self.tcp_tunnels.iter() {
            entry.value().stop().await;
        }
        self.http_tunnels.clear();
        self.tcp_tunnels.clear();
        self.client_cache.clear();
        info!("tunnel manager shut down");
    }

    pub fn http_tunnel_count(&self) -> usize {
        self.http_tunnels.len()
    }

    pub fn tcp_tunnel_count(&self) -> usize {
        self.tcp_tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krelay_k8s::{ClientCache, ClientHandle, FakeClusterApi, KubeconfigSource};
    use krelay_router::PodOrService;

    fn manager_with_http_route(host: &str, api: Arc<FakeClusterApi>) -> Arc<TunnelManager> {
        let mut http = HashMap::new();
        http.insert(
            host.to_string(),
            HttpRoute {
                context: "ctx".into(),
                namespace: "ns".into(),
                target: PodOrService::Pod("debugger".into()),
                port: 22,
                scheme: Scheme::Http,
            },
        );
        let snapshot = RouteSnapshot {
            http,
            tcp: HashMap::new(),
            dynamic_host_suffix: None,
            http_idle_timeout: Duration::from_secs(600),
            tcp_idle_timeout: None,
        };
        let client_cache = ClientCache::new(KubeconfigSource { kubeconfig: None });
        client_cache.inject("ctx", ClientHandle::for_test("ctx"));
        TunnelManager::new(api, Arc::new(client_cache), snapshot)
    }

    #[tokio::test]
    async fn get_or_open_starts_a_tunnel_for_a_configured_host() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let manager = manager_with_http_route("app.local", api);

        let tunnel = manager.get_or_open("app.local", Scheme::Http).await.unwrap();
        assert!(tunnel.is_running().await);
        assert_eq!(manager.http_tunnel_count(), 1);
    }

    #[tokio::test]
    async fn get_or_open_is_idempotent_for_concurrent_callers() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let manager = manager_with_http_route("app.local", api);

        let (a, b) = tokio::join!(
            manager.get_or_open("app.local", Scheme::Http),
            manager.get_or_open("app.local", Scheme::Http)
        );
        assert_eq!(a.unwrap().local_port(), b.unwrap().local_port());
        assert_eq!(manager.http_tunnel_count(), 1);
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        let api = Arc::new(FakeClusterApi::new());
        let manager = manager_with_http_route("app.local", api);
        let err = manager.get_or_open("unknown.local", Scheme::Http).await.unwrap_err();
        assert!(matches!(err, ManagerError::NoRouteForKey(_)));
    }

    #[tokio::test]
    async fn reap_once_evicts_only_tunnels_past_their_idle_timeout() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let manager = manager_with_http_route("app.local", api);
        manager.get_or_open("app.local", Scheme::Http).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        {
            let mut settings = manager.settings.write().await;
            settings.http_idle_timeout = Duration::from_secs(0);
        }
        manager.reap_once().await;
        assert_eq!(manager.http_tunnel_count(), 0);
    }

    #[tokio::test]
    async fn update_config_stops_tunnels_whose_routes_were_removed() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let manager = manager_with_http_route("app.local", api);
        manager.get_or_open("app.local", Scheme::Http).await.unwrap();

        manager
            .update_config(RouteSnapshot {
                http: HashMap::new(),
                tcp: HashMap::new(),
                dynamic_host_suffix: None,
                http_idle_timeout: Duration::from_secs(600),
                tcp_idle_timeout: None,
            })
            .await;
        assert_eq!(manager.http_tunnel_count(), 0);
    }
}
