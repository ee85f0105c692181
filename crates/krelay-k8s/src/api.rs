//! The `ClusterApi` trait (spec §4.9): the one seam between the proxy core
//! and the orchestrator. `krelay-tunnel` and `krelay-proxy::JumpHandler`
//! depend only on this trait, never on `kube` directly.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::types::{ExecStream, JumpPodSpec, PodInfo, PortForwardStream, ServiceInfo};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_service(
        &self,
        ctx: &str,
        ns: &str,
        name: &str,
    ) -> Result<ServiceInfo, ClusterError>;

    async fn list_pods(
        &self,
        ctx: &str,
        ns: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, ClusterError>;

    async fn open_port_forward(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        port: u16,
    ) -> Result<PortForwardStream, ClusterError>;

    async fn open_exec(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecStream, ClusterError>;

    async fn create_pod(
        &self,
        ctx: &str,
        ns: &str,
        spec: &JumpPodSpec,
    ) -> Result<(), ClusterError>;

    async fn get_pod(
        &self,
        ctx: &str,
        ns: &str,
        name: &str,
    ) -> Result<Option<PodInfo>, ClusterError>;
}
