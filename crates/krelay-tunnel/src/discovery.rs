//! Service/pod discovery (spec §4.6 "Discovery"): resolves a route's
//! `{service | pod}` target down to a concrete `(pod name, target port)`
//! pair a port-forward can be opened against.

use krelay_k8s::{ClusterApi, TargetPort};
use krelay_router::PodOrService;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("service {service} has no port {port}")]
    ServicePortNotFound { service: String, port: u16 },
    #[error("no running pods match service {0}'s selector")]
    NoRunningPods(String),
    #[error("named container port {name:?} not found on pod {pod}")]
    NamedPortNotFound { pod: String, name: String },
    #[error("cluster API error: {0}")]
    Cluster(#[from] krelay_k8s::ClusterError),
}

/// The concrete pod and port a `Tunnel` should open a port-forward against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub pod: String,
    pub port: u16,
}

/// Resolves a route's `{service | pod}` target (spec §4.6).
pub async fn discover(
    cluster: &dyn ClusterApi,
    ctx: &str,
    ns: &str,
    target: &PodOrService,
    route_port: u16,
) -> Result<ResolvedTarget, DiscoveryError> {
    match target {
        PodOrService::Pod(name) => Ok(ResolvedTarget {
            pod: name.clone(),
            port: route_port,
        }),
        PodOrService::Service(name) => {
            let service = cluster
                .get_service(ctx, ns, name)
                .await
                .map_err(|_| DiscoveryError::ServiceNotFound(name.clone()))?;

            let service_port = service
                .port_for(route_port)
                .ok_or_else(|| DiscoveryError::ServicePortNotFound {
                    service: name.clone(),
                    port: route_port,
                })?
                .clone();

            let pods = cluster.list_pods(ctx, ns, &service.selector).await?;
            let running: Vec<_> = pods.into_iter().filter(|p| p.is_running()).collect();
            if running.is_empty() {
                return Err(DiscoveryError::NoRunningPods(name.clone()));
            }

            // Prefer a pod whose Ready condition is True; fall back to the
            // first running pod (spec §4.6 step 3).
            let chosen = running
                .iter()
                .find(|p| p.ready)
                .or_else(|| running.first())
                .cloned()
                .expect("running is non-empty");

            let port = match &service_port.target_port {
                TargetPort::Number(n) => *n,
                TargetPort::Name(port_name) => {
                    chosen
                        .port_by_name(port_name)
                        .ok_or_else(|| DiscoveryError::NamedPortNotFound {
                            pod: chosen.name.clone(),
                            name: port_name.clone(),
                        })?
                }
            };

            Ok(ResolvedTarget {
                pod: chosen.name,
                port,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krelay_k8s::{FakeClusterApi, PodInfo, ServiceInfo, ServicePort};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn pod_route_resolves_directly_without_a_cluster_call() {
        let api = FakeClusterApi::new();
        let resolved = discover(&api, "ctx", "ns", &PodOrService::Pod("debugger".into()), 22)
            .await
            .unwrap();
        assert_eq!(resolved.pod, "debugger");
        assert_eq!(resolved.port, 22);
        assert!(api.calls.lock().unwrap().get_service.is_empty());
    }

    #[tokio::test]
    async fn service_route_prefers_ready_pod() {
        let api = FakeClusterApi::new();
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        api.with_service(
            "ctx",
            "ns",
            "web",
            ServiceInfo {
                name: "web".into(),
                selector: selector.clone(),
                ports: vec![ServicePort {
                    name: None,
                    port: 80,
                    target_port: TargetPort::Number(8080),
                }],
            },
        );
        api.with_pods(
            "ctx",
            "ns",
            vec![
                PodInfo {
                    name: "web-not-ready".into(),
                    phase: "Running".into(),
                    ready: false,
                    container_ports: vec![],
                },
                PodInfo {
                    name: "web-ready".into(),
                    phase: "Running".into(),
                    ready: true,
                    container_ports: vec![],
                },
            ],
        );

        let resolved = discover(&api, "ctx", "ns", &PodOrService::Service("web".into()), 80)
            .await
            .unwrap();
        assert_eq!(resolved.pod, "web-ready");
        assert_eq!(resolved.port, 8080);
    }

    #[tokio::test]
    async fn named_target_port_resolves_against_chosen_pod() {
        let api = FakeClusterApi::new();
        api.with_service(
            "ctx",
            "ns",
            "web",
            ServiceInfo {
                name: "web".into(),
                selector: BTreeMap::new(),
                ports: vec![ServicePort {
                    name: None,
                    port: 80,
                    target_port: TargetPort::Name("http".into()),
                }],
            },
        );
        api.with_pods(
            "ctx",
            "ns",
            vec![PodInfo {
                name: "web-1".into(),
                phase: "Running".into(),
                ready: true,
                container_ports: vec![(Some("http".into()), 8080)],
            }],
        );

        let resolved = discover(&api, "ctx", "ns", &PodOrService::Service("web".into()), 80)
            .await
            .unwrap();
        assert_eq!(resolved.port, 8080);
    }

    #[tokio::test]
    async fn no_running_pods_is_an_error() {
        let api = FakeClusterApi::new();
        api.with_service(
            "ctx",
            "ns",
            "web",
            ServiceInfo {
                name: "web".into(),
                selector: BTreeMap::new(),
                ports: vec![ServicePort {
                    name: None,
                    port: 80,
                    target_port: TargetPort::Number(8080),
                }],
            },
        );
        let err = discover(&api, "ctx", "ns", &PodOrService::Service("web".into()), 80)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoRunningPods(_)));
    }
}
