//! `JumpHandler` (spec §4.7): streams a TCP conversation through an in-pod
//! process reached via `ClusterApi::open_exec`, for hosts unreachable
//! directly from the operator's machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use krelay_k8s::{ClusterApi, ClusterError, JumpPodSpec};
use krelay_router::{JumpRoute, PodOrService};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MANAGED_BY_LABEL: &str = "krelay.dev/managed-by";
const MANAGED_BY_VALUE: &str = "krelay";

#[derive(Debug, Error)]
pub enum JumpError {
    #[error("jump pod creation failed: {0}")]
    CreateFailed(ClusterError),
    #[error("jump pod never became ready: {0}")]
    NeverReady(String),
    #[error("jump pod was deleted while waiting for it to become ready")]
    DeletedWhileWaiting,
    #[error("service lookup failed: {0}")]
    ServiceLookupFailed(ClusterError),
    #[error("no ready pod found for the jump route")]
    NoPodFound,
    #[error("target host {0:?} is not a valid hostname or IP literal")]
    InvalidTargetHost(String),
    #[error("exec session failed to open: {0}")]
    ExecFailed(ClusterError),
}

pub struct JumpHandler {
    cluster: Arc<dyn ClusterApi>,
}

impl JumpHandler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn serve(&self, mut client: TcpStream, route: JumpRoute) {
        if let Err(err) = self.bridge(&mut client, &route).await {
            warn!(
                context = %route.context,
                namespace = %route.namespace,
                target_host = %route.target_host,
                error = %err,
                "jump handler failed"
            );
        }
    }

    async fn bridge(&self, client: &mut TcpStream, route: &JumpRoute) -> Result<(), JumpError> {
        validate_host(&route.target_host)?;
        let bracketed_host = bracket_host(&route.target_host);

        let pod = self.resolve_pod(route).await?;

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "socat - TCP:{h}:{p} || nc {h} {p}",
                h = bracketed_host,
                p = route.target_port
            ),
        ];

        let mut exec = self
            .cluster
            .open_exec(&route.context, &route.namespace, &pod, route.via.container.as_deref(), &argv)
            .await
            .map_err(JumpError::ExecFailed)?;

        let (mut client_read, mut client_write) = client.split();

        let client_to_stdin = async {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = match client_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if exec.stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = exec.stdin.shutdown().await;
        };

        let stdout_to_client = async {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = match exec.stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if client_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = client_write.shutdown().await;
        };

        let drain_stderr = async {
            let mut buf = [0u8; 4096];
            loop {
                match exec.stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => log_stderr_line(&buf[..n]),
                }
            }
        };

        // The read loop cancels the exec context on client disconnection
        // (spec §4.7 step 5); whichever direction finishes first triggers
        // teardown of the others via the join, then we cancel explicitly.
        tokio::join!(client_to_stdin, stdout_to_client, drain_stderr);
        exec.cancel.cancel();

        Ok(())
    }

    async fn resolve_pod(&self, route: &JumpRoute) -> Result<String, JumpError> {
        self.ensure_pod_exists(route).await?;

        match &route.via.target {
            PodOrService::Pod(name) => {
                self.wait_until_ready(route, name).await?;
                Ok(name.clone())
            }
            PodOrService::Service(svc) => {
                let service = self
                    .cluster
                    .get_service(&route.context, &route.namespace, svc)
                    .await
                    .map_err(JumpError::ServiceLookupFailed)?;
                let pods = self
                    .cluster
                    .list_pods(&route.context, &route.namespace, &service.selector)
                    .await
                    .map_err(JumpError::ServiceLookupFailed)?;
                let chosen = pods
                    .iter()
                    .find(|p| p.ready)
                    .or_else(|| pods.iter().find(|p| p.is_running()))
                    .ok_or(JumpError::NoPodFound)?;
                Ok(chosen.name.clone())
            }
        }
    }

    async fn ensure_pod_exists(&self, route: &JumpRoute) -> Result<(), JumpError> {
        let PodOrService::Pod(name) = &route.via.target else {
            return Ok(());
        };
        let Some(create_spec) = &route.via.create_spec else {
            return Ok(());
        };

        let existing = self
            .cluster
            .get_pod(&route.context, &route.namespace, name)
            .await
            .map_err(JumpError::CreateFailed)?;
        if existing.is_some() {
            return Ok(());
        }

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let spec = JumpPodSpec {
            name: name.clone(),
            image: create_spec.image.clone(),
            command: create_spec.command.clone(),
            ready_timeout: create_spec.timeout.unwrap_or(DEFAULT_READY_TIMEOUT),
            labels,
        };
        self.cluster
            .create_pod(&route.context, &route.namespace, &spec)
            .await
            .map_err(JumpError::CreateFailed)
    }

    async fn wait_until_ready(&self, route: &JumpRoute, name: &str) -> Result<(), JumpError> {
        let ready_timeout = route
            .via
            .create_spec
            .as_ref()
            .and_then(|c| c.timeout)
            .unwrap_or(DEFAULT_READY_TIMEOUT);

        timeout(ready_timeout, async {
            loop {
                match self.cluster.get_pod(&route.context, &route.namespace, name).await {
                    Ok(Some(pod)) if pod.ready => return Ok(()),
                    Ok(Some(_)) => {}
                    Ok(None) => return Err(JumpError::DeletedWhileWaiting),
                    Err(err) => debug!(%err, "transient error while waiting for jump pod"),
                }
                sleep(READY_POLL_INTERVAL).await;
            }
        })
        .await
        .unwrap_or_else(|_| Err(JumpError::NeverReady(name.to_string())))
    }
}

/// Defense-in-depth grammar check, mirroring the config-layer validation for
/// `target.host` (spec §6): RFC-1123 hostname or IP literal, nothing that
/// could break out of the `sh -c` argv we build.
fn validate_host(host: &str) -> Result<(), JumpError> {
    if host.is_empty() || host.len() > 253 {
        return Err(JumpError::InvalidTargetHost(host.to_string()));
    }
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if !valid {
        return Err(JumpError::InvalidTargetHost(host.to_string()));
    }
    Ok(())
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn log_stderr_line(bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("connection refused") || lower.contains("no route to host") {
            info!(line, "jump exec stderr");
        } else {
            debug!(line, "jump exec stderr");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_semicolon_in_target_host() {
        assert!(validate_host("evil;rm -rf /").is_err());
    }

    #[test]
    fn accepts_plain_hostname() {
        assert!(validate_host("db.internal.svc.cluster.local").is_ok());
    }

    #[test]
    fn accepts_ipv4_literal() {
        assert!(validate_host("10.0.0.5").is_ok());
    }

    #[test]
    fn brackets_ipv6_literal() {
        assert_eq!(bracket_host("fe80::1"), "[fe80::1]");
    }

    #[test]
    fn does_not_double_bracket() {
        assert_eq!(bracket_host("[fe80::1]"), "[fe80::1]");
    }

    #[test]
    fn leaves_hostnames_and_ipv4_unbracketed() {
        assert_eq!(bracket_host("db.local"), "db.local");
        assert_eq!(bracket_host("10.0.0.5"), "10.0.0.5");
    }
}
