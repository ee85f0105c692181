//! `Tunnel`: one port-forward session (spec §4.6).
//!
//! A single implementation serves both HTTP and TCP-direct routes (spec §9
//! "polymorphic tunnel handle"): the only difference between the two is
//! what `RouteTarget` carries and whether `scheme()` returns anything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use krelay_k8s::ClusterApi;
use krelay_router::{PodOrService, RouteKey, Scheme};

use crate::discovery::discover;
use crate::state::TunnelState;

const START_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_GRANULARITY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] crate::discovery::DiscoveryError),
    #[error("upstream open failed: {0}")]
    UpstreamOpenFailed(String),
    #[error("tunnel start timed out")]
    Timeout,
    #[error("tunnel is in a terminal state and must be replaced")]
    Failed,
}

/// The immutable target a tunnel bridges to: a context/namespace/target/port
/// tuple plus, for HTTP routes, the scheme to report to `HttpProxy`.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub context: String,
    pub namespace: String,
    pub target: PodOrService,
    pub port: u16,
    pub scheme: Option<Scheme>,
}

struct Shared {
    key: RouteKey,
    route: RouteTarget,
    cluster: Arc<dyn ClusterApi>,
    state: AsyncMutex<TunnelState>,
    notify: Notify,
    local_bridge_port: AtomicU16,
    last_access: AsyncMutex<Instant>,
    last_error: AsyncMutex<Option<String>>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

/// A handle to a tunnel entry; cloned freely, reference-counted. Exposes
/// the capability set from spec §9: `is_running`, `ensure_running`, `stop`,
/// `touch`, `local_port`, `scheme`, `idle_duration`, `state`, `last_error`.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

impl Tunnel {
    pub fn new(key: RouteKey, route: RouteTarget, cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                route,
                cluster,
                state: AsyncMutex::new(TunnelState::Idle),
                notify: Notify::new(),
                local_bridge_port: AtomicU16::new(0),
                last_access: AsyncMutex::new(Instant::now()),
                last_error: AsyncMutex::new(None),
                accept_task: AsyncMutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.shared.key
    }

    pub fn route(&self) -> &RouteTarget {
        &self.shared.route
    }

    pub async fn touch(&self) {
        *self.shared.last_access.lock().await = Instant::now();
    }

    pub async fn idle_duration(&self) -> Duration {
        self.shared.last_access.lock().await.elapsed()
    }

    pub async fn state(&self) -> TunnelState {
        *self.shared.state.lock().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.state().await, TunnelState::Running)
    }

    pub fn local_port(&self) -> Option<u16> {
        match self.shared.local_bridge_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn scheme(&self) -> Option<Scheme> {
        self.shared.route.scheme
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().await.clone()
    }

    /// Spec §4.6: transitions `Idle -> Starting`, performs discovery and
    /// opens the bridge listener, transitions to `Running` or `Failed`.
    /// Already-`Running` is a no-op. Concurrent callers observing
    /// `Starting` cooperatively wait; they retry once if the state
    /// collapses back to `Idle`.
    pub async fn ensure_running(&self) -> Result<(), TunnelError> {
        let mut retried = false;
        loop {
            let mut state = self.shared.state.lock().await;
            match *state {
                TunnelState::Running => return Ok(()),
                TunnelState::Failed => {
                    return Err(TunnelError::Failed);
                }
                TunnelState::Idle => {
                    *state = TunnelState::Starting;
                    drop(state);
                    return self.start().await;
                }
                TunnelState::Starting | TunnelState::Stopping => {
                    drop(state);
                    match self.wait_for_transition().await {
                        TunnelState::Running => return Ok(()),
                        TunnelState::Failed => return Err(TunnelError::Failed),
                        TunnelState::Idle if !retried => {
                            retried = true;
                            continue;
                        }
                        other => {
                            debug!(?other, "ensure_running gave up waiting");
                            return Err(TunnelError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Polls at the 100ms granularity spec §5 prescribes, bounded by the
    /// same start timeout so a wedged peer can't hang callers forever.
    async fn wait_for_transition(&self) -> TunnelState {
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            let state = self.state().await;
            if !matches!(state, TunnelState::Starting | TunnelState::Stopping) {
                return state;
            }
            if Instant::now() >= deadline {
                return state;
            }
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(POLL_GRANULARITY) => {}
            }
        }
    }

    async fn start(&self) -> Result<(), TunnelError> {
        let result = timeout(START_TIMEOUT, self.start_inner()).await;

        match result {
            Ok(Ok(port)) => {
                self.shared.local_bridge_port.store(port, Ordering::Release);
                *self.shared.state.lock().await = TunnelState::Running;
                self.shared.notify.notify_waiters();
                info!(key = ?self.shared.key, port, "tunnel started");
                Ok(())
            }
            Ok(Err(err)) => {
                self.fail(err.to_string()).await;
                Err(err)
            }
            Err(_) => {
                self.fail("tunnel start timed out".to_string()).await;
                Err(TunnelError::Timeout)
            }
        }
    }

    async fn fail(&self, reason: String) {
        warn!(key = ?self.shared.key, reason, "tunnel failed to start");
        *self.shared.last_error.lock().await = Some(reason);
        *self.shared.state.lock().await = TunnelState::Failed;
        self.shared.notify.notify_waiters();
    }

    async fn start_inner(&self) -> Result<u16, TunnelError> {
        let route = &self.shared.route;
        let resolved = discover(
            self.shared.cluster.as_ref(),
            &route.context,
            &route.namespace,
            &route.target,
            route.port,
        )
        .await?;

        // Probe the port-forward once to fail fast on an unreachable pod
        // before we bind a local listener for it (spec §4.6: "block until
        // ready or 30s timeout").
        self.shared
            .cluster
            .open_port_forward(&route.context, &route.namespace, &resolved.pod, resolved.port)
            .await
            .map_err(|e| TunnelError::UpstreamOpenFailed(e.to_string()))?;

        let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| TunnelError::UpstreamOpenFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::UpstreamOpenFailed(e.to_string()))?;

        let cluster = self.shared.cluster.clone();
        let ctx = route.context.clone();
        let ns = route.namespace.clone();
        let pod = resolved.pod.clone();
        let port = resolved.port;
        let this = self.clone();

        let task = tokio::spawn(async move {
            this.accept_loop(listener, cluster, ctx, ns, pod, port).await;
        });
        *self.shared.accept_task.lock().await = Some(task);

        Ok(local_addr.port())
    }

    /// Accepts local connections on the bridge listener and, for each,
    /// opens a fresh port-forward stream to the resolved pod (spec §4.6:
    /// "launch a background task that observes stream errors").
    async fn accept_loop(
        &self,
        listener: TcpListener,
        cluster: Arc<dyn ClusterApi>,
        ctx: String,
        ns: String,
        pod: String,
        port: u16,
    ) {
        loop {
            let (local_stream, peer): (tokio::net::TcpStream, SocketAddr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, key = ?self.shared.key, "bridge listener accept failed, marking tunnel failed");
                    self.fail(format!("bridge listener error: {err}")).await;
                    return;
                }
            };

            let cluster = cluster.clone();
            let ctx = ctx.clone();
            let ns = ns.clone();
            let pod = pod.clone();

            tokio::spawn(async move {
                debug!(%peer, "bridging local connection to pod port-forward");
                let upstream = match cluster.open_port_forward(&ctx, &ns, &pod, port).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%err, %peer, "port-forward open failed for bridged connection");
                        return;
                    }
                };
                let mut upstream = upstream;
                let mut local_stream = local_stream;
                if let Err(err) = tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await {
                    debug!(%err, %peer, "bridge connection ended");
                }
            });
        }
    }

    /// Spec §4.6 `stop()`: if `Running`, signals teardown and transitions
    /// to `Idle`; otherwise a no-op. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut state = self.shared.state.lock().await;
        if !matches!(*state, TunnelState::Running) {
            return;
        }
        *state = TunnelState::Stopping;
        drop(state);

        if let Some(task) = self.shared.accept_task.lock().await.take() {
            task.abort();
        }
        self.shared.local_bridge_port.store(0, Ordering::Release);

        *self.shared.state.lock().await = TunnelState::Idle;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krelay_k8s::FakeClusterApi;

    fn pod_route(key: &str) -> (RouteKey, RouteTarget) {
        (
            RouteKey::HttpHost(key.to_string()),
            RouteTarget {
                context: "ctx".into(),
                namespace: "ns".into(),
                target: PodOrService::Pod("debugger".into()),
                port: 22,
                scheme: Some(Scheme::Http),
            },
        )
    }

    #[tokio::test]
    async fn starts_idle_and_reports_no_local_port() {
        let api = Arc::new(FakeClusterApi::new());
        let (key, route) = pod_route("app.local");
        let tunnel = Tunnel::new(key, route, api);
        assert_eq!(tunnel.state().await, TunnelState::Idle);
        assert_eq!(tunnel.local_port(), None);
    }

    #[tokio::test]
    async fn ensure_running_fails_when_port_forward_is_denied() {
        let api = Arc::new(FakeClusterApi::new());
        let (key, route) = pod_route("app.local");
        let tunnel = Tunnel::new(key, route, api);

        let err = tunnel.ensure_running().await.unwrap_err();
        assert!(matches!(err, TunnelError::UpstreamOpenFailed(_)));
        assert_eq!(tunnel.state().await, TunnelState::Failed);
        assert!(tunnel.last_error().await.is_some());
    }

    #[tokio::test]
    async fn ensure_running_succeeds_and_binds_a_real_listener() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let (key, route) = pod_route("app.local");
        let tunnel = Tunnel::new(key, route, api);

        tunnel.ensure_running().await.unwrap();
        assert!(tunnel.is_running().await);
        let port = tunnel.local_port().expect("running tunnel has a local port");
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn stop_on_idle_tunnel_is_a_no_op() {
        let api = Arc::new(FakeClusterApi::new());
        let (key, route) = pod_route("app.local");
        let tunnel = Tunnel::new(key, route, api);
        tunnel.stop().await;
        assert_eq!(tunnel.state().await, TunnelState::Idle);
    }

    #[tokio::test]
    async fn stop_after_running_frees_the_local_port() {
        let api = Arc::new(FakeClusterApi::new());
        api.allow_port_forward();
        let (key, route) = pod_route("app.local");
        let tunnel = Tunnel::new(key, route, api);
        tunnel.ensure_running().await.unwrap();

        tunnel.stop().await;
        assert_eq!(tunnel.state().await, TunnelState::Idle);
        assert_eq!(tunnel.local_port(), None);
    }

    #[tokio::test]
    async fn service_route_discovery_failure_marks_tunnel_failed() {
        let api = Arc::new(FakeClusterApi::new());
        let key = RouteKey::HttpHost("app.local".into());
        let route = RouteTarget {
            context: "ctx".into(),
            namespace: "ns".into(),
            target: PodOrService::Service("missing-svc".into()),
            port: 80,
            scheme: Some(Scheme::Http),
        };
        let tunnel = Tunnel::new(key, route, api);
        let err = tunnel.ensure_running().await.unwrap_err();
        assert!(matches!(err, TunnelError::Discovery(_)));
    }
}
