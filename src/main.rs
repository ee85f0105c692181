//! krelay: an on-demand reverse proxy that exposes Kubernetes workloads
//! under local hostnames and ports, multiplexing HTTP/TLS traffic by
//! hostname/SNI onto lazily-created port-forward tunnels, plus raw TCP and
//! jump-pod exec routes (spec §1-§2).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use krelay_cert::ErrorCertProvider;
use krelay_config::{Config, ConfigLoader, ConfigWatcher};
use krelay_k8s::{ClientCache, ClusterApi, KubeClusterApi, KubeconfigSource};
use krelay_proxy::{
    classify, Classified, HttpProxy, JumpHandler, TcpPortHandler, TlsErrorResponder, TlsPassthrough,
};
use krelay_tunnel::{RouteSnapshot, TunnelManager};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
const CONFIG_RECONCILE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "krelay")]
#[command(about = "On-demand reverse proxy that exposes Kubernetes workloads under local hostnames and ports")]
#[command(version)]
struct Cli {
    /// Path to the YAML config file (default: ~/.krelay.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn route_snapshot(config: &Config) -> RouteSnapshot {
    RouteSnapshot {
        http: config.http_routes.clone(),
        tcp: config.tcp_routes.clone(),
        dynamic_host_suffix: config.dynamic_host_suffix.clone(),
        http_idle_timeout: config.http_idle_timeout,
        tcp_idle_timeout: config.tcp_idle_timeout,
    }
}

/// `http.k8s.kubeconfig` is a colon-joined path list (spec §6); `kube`
/// already merges such a list when it's exposed as `KUBECONFIG`, so we set
/// the env var rather than re-implementing kubeconfig merging.
fn build_kubeconfig_source(config: &Config) -> Result<KubeconfigSource> {
    match &config.kubeconfig {
        Some(paths) => {
            std::env::set_var("KUBECONFIG", paths);
            let kubeconfig = kube::config::Kubeconfig::read()
                .context("failed to read http.k8s.kubeconfig")?;
            Ok(KubeconfigSource {
                kubeconfig: Some(kubeconfig),
            })
        }
        None => Ok(KubeconfigSource { kubeconfig: None }),
    }
}

fn prepend_exec_path(exec_path: &[String]) {
    if exec_path.is_empty() {
        return;
    }
    let extra = exec_path.join(":");
    let joined = match std::env::var("PATH") {
        Ok(existing) => format!("{extra}:{existing}"),
        Err(_) => extra,
    };
    std::env::set_var("PATH", joined);
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    }
}

/// Accepts connections on `listener` forever, dispatching each one to the
/// HTTP or TLS-passthrough path per the protocol byte (spec §4.1).
async fn run_demux_listener(listener: TcpListener, http_proxy: Arc<HttpProxy>, tls_passthrough: Arc<TlsPassthrough>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed on http/tls listener");
                continue;
            }
        };
        let http_proxy = http_proxy.clone();
        let tls_passthrough = tls_passthrough.clone();
        tokio::spawn(async move {
            match classify(stream).await {
                Ok(Classified::Http(stream)) => http_proxy.serve(stream, peer).await,
                Ok(Classified::Tls(stream)) => tls_passthrough.serve(stream).await,
                Err(err) => debug!(%peer, error = %err, "connection demux failed"),
            }
        });
    }
}

/// Accepts connections on one configured TCP port forever (spec §4.7).
async fn run_tcp_port_listener(listener: TcpListener, handler: Arc<TcpPortHandler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed on tcp port listener");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            debug!(%peer, "accepted tcp connection");
            handler.serve(stream).await;
        });
    }
}

/// Polls the watcher's snapshot and folds reloaded configs into the
/// manager's route registry (SPEC_FULL §6: `ConfigWatcher` publishes via
/// `arc-swap`; this loop is the only reader that needs to react to it).
async fn run_config_reconciler(watcher: Arc<ConfigWatcher>, manager: Arc<TunnelManager>) {
    let mut last = watcher.current();
    let mut interval = tokio::time::interval(CONFIG_RECONCILE_INTERVAL);
    loop {
        interval.tick().await;
        let current = watcher.current();
        if !Arc::ptr_eq(&last, &current) {
            info!("applying reloaded config");
            manager.update_config(route_snapshot(&current)).await;
            last = current;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path =
        ConfigLoader::discover_path(cli.config.as_deref()).context("failed to resolve config path")?;

    if !config_path.exists() {
        ConfigLoader::write_default_template(&config_path)
            .context("failed to write default config template")?;
        println!("wrote default config to {}", config_path.display());
        return Ok(());
    }

    let config = ConfigLoader::load(&config_path).context("failed to load config")?;
    setup_logging(cli.verbose || config.verbose);
    info!(path = %config_path.display(), "loaded config");

    prepend_exec_path(&config.exec_path);
    let kubeconfig_source = build_kubeconfig_source(&config)?;

    let client_cache = Arc::new(ClientCache::new(kubeconfig_source));
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client_cache.clone()));

    let manager = TunnelManager::new(cluster.clone(), client_cache, route_snapshot(&config));
    manager.start().await;

    let cert_provider = Arc::new(ErrorCertProvider::new());
    let error_responder = Arc::new(TlsErrorResponder::new(cert_provider));
    let http_proxy = Arc::new(HttpProxy::new(manager.clone()));
    let tls_passthrough = Arc::new(TlsPassthrough::new(manager.clone(), error_responder));
    let jump_handler = Arc::new(JumpHandler::new(cluster));

    let listen_addr: SocketAddr = config
        .http_listen
        .parse()
        .with_context(|| format!("invalid http.listen address {:?}", config.http_listen))?;
    let demux_listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind http.listen {listen_addr}"))?;
    info!(%listen_addr, "listening for http/tls connections");

    let mut tasks = JoinSet::new();
    tasks.spawn(run_demux_listener(demux_listener, http_proxy, tls_passthrough));

    for port in config.tcp_routes.keys().copied().collect::<Vec<_>>() {
        let tcp_listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind tcp port {port}"))?;
        info!(port, "listening for tcp connections");
        let handler = Arc::new(TcpPortHandler::new(manager.clone(), jump_handler.clone(), port));
        tasks.spawn(run_tcp_port_listener(tcp_listener, handler));
    }

    if config.auto_reload_config {
        match ConfigWatcher::spawn(config_path.clone(), config.clone()) {
            Ok(watcher) => {
                let watcher = Arc::new(watcher);
                tasks.spawn(run_config_reconciler(watcher, manager.clone()));
            }
            Err(err) => {
                warn!(error = %err, "failed to start config watcher; continuing without hot-reload");
            }
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutting down");

    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    if tokio::time::timeout(SHUTDOWN_DEADLINE, manager.shutdown()).await.is_err() {
        warn!("graceful shutdown deadline elapsed");
    }

    info!("krelay shut down");
    Ok(())
}
