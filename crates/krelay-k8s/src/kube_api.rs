//! `KubeClusterApi`: the one production `ClusterApi` adapter, built on
//! `kube` + `k8s-openapi` (spec §4.9).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, AttachParams, ListParams, PostParams};
use tracing::{debug, warn};

use crate::api::ClusterApi;
use crate::cache::ClientCache;
use crate::error::ClusterError;
use crate::types::{
    ExecCancelHandle, ExecStream, JumpPodSpec, PodInfo, PortForwardStream, ServiceInfo, ServicePort,
    TargetPort,
};

const MANAGED_BY_LABEL: &str = "krelay.dev/managed-by";
const MANAGED_BY_VALUE: &str = "krelay";

pub struct KubeClusterApi {
    clients: Arc<ClientCache>,
}

impl KubeClusterApi {
    /// Takes a shared cache rather than owning one outright so
    /// `TunnelManager` can be built against the same cache (spec §4.5,
    /// §4.8: the manager's own `client_for`/`shutdown` bookkeeping must see
    /// the handles this adapter already built).
    pub fn new(clients: Arc<ClientCache>) -> Self {
        Self { clients }
    }

    pub fn client_cache(&self) -> Arc<ClientCache> {
        self.clients.clone()
    }

    async fn pod_api(&self, ctx: &str, ns: &str) -> Result<Api<Pod>, ClusterError> {
        let handle = self
            .clients
            .client_for(ctx)
            .await
            .map_err(|e| ClusterError::Other(e.to_string()))?;
        Ok(Api::namespaced(handle.client().clone(), ns))
    }

    async fn service_api(&self, ctx: &str, ns: &str) -> Result<Api<Service>, ClusterError> {
        let handle = self
            .clients
            .client_for(ctx)
            .await
            .map_err(|e| ClusterError::Other(e.to_string()))?;
        Ok(Api::namespaced(handle.client().clone(), ns))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_service(&self, ctx: &str, ns: &str, name: &str) -> Result<ServiceInfo, ClusterError> {
        let api = self.service_api(ctx, ns).await?;
        let svc = api.get(name).await?;
        let spec = svc
            .spec
            .ok_or_else(|| ClusterError::Other(format!("service {ns}/{name} has no spec")))?;

        let selector = spec.selector.unwrap_or_default().into_iter().collect();
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| ServicePort {
                name: p.name,
                port: p.port as u16,
                target_port: match p.target_port {
                    Some(IntOrString::Int(n)) => TargetPort::Number(n as u16),
                    Some(IntOrString::String(s)) => TargetPort::Name(s),
                    None => TargetPort::Number(p.port as u16),
                },
            })
            .collect();

        Ok(ServiceInfo {
            name: name.to_string(),
            selector,
            ports,
        })
    }

    async fn list_pods(
        &self,
        ctx: &str,
        ns: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        let api = self.pod_api(ctx, ns).await?;
        let selector_str = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&selector_str);
        let list = api.list(&params).await?;

        Ok(list.items.into_iter().map(pod_info_from).collect())
    }

    async fn open_port_forward(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        port: u16,
    ) -> Result<PortForwardStream, ClusterError> {
        let api = self.pod_api(ctx, ns).await?;
        let mut forwarder = api.portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| ClusterError::Other(format!("no port-forward stream for port {port}")))?;
        // The Portforwarder itself must outlive the stream for the stream
        // to stay readable; `take_stream` detaches it, so we leak the
        // forwarder's background driver onto a task that exits when the
        // stream it serves is dropped.
        tokio::spawn(async move {
            if let Err(err) = forwarder.join().await {
                debug!(%err, "port-forward driver task ended");
            }
        });
        Ok(Box::pin(stream))
    }

    async fn open_exec(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecStream, ClusterError> {
        let api = self.pod_api(ctx, ns).await?;
        let mut params = AttachParams::default().stdin(true).stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }
        let mut attached = api.exec(pod, argv.to_vec(), &params).await?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| ClusterError::Other("exec session has no stdin".into()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| ClusterError::Other("exec session has no stdout".into()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| ClusterError::Other("exec session has no stderr".into()))?;

        let mut status_handle = attached.take_status();
        let cancel = ExecCancelHandle::new(move || {
            drop(attached);
            if let Some(status) = status_handle.take() {
                drop(status);
            }
        });

        Ok(ExecStream {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            cancel,
        })
    }

    async fn create_pod(&self, ctx: &str, ns: &str, spec: &JumpPodSpec) -> Result<(), ClusterError> {
        let api = self.pod_api(ctx, ns).await?;

        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let command = spec
            .command
            .clone()
            .unwrap_or_else(|| vec!["sleep".to_string(), "infinity".to_string()]);

        let manifest: Pod = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": spec.name,
                "labels": labels,
            },
            "spec": {
                "restartPolicy": "Always",
                "containers": [{
                    "name": "jump",
                    "image": spec.image,
                    "command": command,
                    "resources": {
                        "requests": {"cpu": "10m", "memory": "16Mi"},
                        "limits": {"cpu": "100m", "memory": "64Mi"},
                    },
                }],
            },
        }))
        .map_err(|e| ClusterError::Other(format!("invalid jump pod manifest: {e}")))?;

        match api.create(&PostParams::default(), &manifest).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                warn!(pod = %spec.name, "jump pod already exists, reusing it");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_pod(&self, ctx: &str, ns: &str, name: &str) -> Result<Option<PodInfo>, ClusterError> {
        let api = self.pod_api(ctx, ns).await?;
        match api.get(name).await {
            Ok(pod) => Ok(Some(pod_info_from(pod))),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn pod_info_from(pod: Pod) -> PodInfo {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });

    let container_ports = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .map(|p| (p.name.clone(), p.container_port as u16))
                .collect()
        })
        .unwrap_or_default();

    PodInfo {
        name,
        phase,
        ready,
        container_ports,
    }
}

#[cfg(test)]
mod tests {
    use super::pod_info_from;
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    #[test]
    fn ready_condition_true_marks_pod_ready() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let info = pod_info_from(pod);
        assert!(info.ready);
        assert_eq!(info.phase, "Running");
    }

    #[test]
    fn missing_status_defaults_to_unknown_and_not_ready() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-2".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let info = pod_info_from(pod);
        assert!(!info.ready);
        assert_eq!(info.phase, "Unknown");
    }
}
