//! Plain data returned by `ClusterApi`, independent of `kube`'s own wire
//! types so callers never need to depend on `k8s-openapi` directly.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

/// Either a literal target port or the name of a container port to be
/// resolved against the chosen pod (spec §4.6 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: TargetPort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

impl ServiceInfo {
    /// Finds the `ServicePort` whose `port` matches the route's configured
    /// service port (spec §4.6 step 2).
    pub fn port_for(&self, port: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.port == port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    /// `(container port name, port number)`, flattened across all
    /// containers in the pod.
    pub container_ports: Vec<(Option<String>, u16)>,
}

impl PodInfo {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    /// Resolves a named container port (spec §4.6 step 4); used when a
    /// service's `target_port` is a name rather than a number.
    pub fn port_by_name(&self, name: &str) -> Option<u16> {
        self.container_ports
            .iter()
            .find(|(n, _)| n.as_deref() == Some(name))
            .map(|(_, p)| *p)
    }
}

/// A bidirectional byte stream to a forwarded pod port, returned by
/// `ClusterApi::open_port_forward`. One call yields one logical connection;
/// callers that need to serve many local connections call this repeatedly
/// (see `krelay-tunnel`'s listener-per-tunnel bridge).
pub type PortForwardStream = Pin<Box<dyn AsyncRead2Write>>;

/// Sealed convenience bound so `PortForwardStream`'s definition stays
/// readable; not exported beyond this module's `pub type` alias.
pub trait AsyncRead2Write: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncRead2Write for T {}

/// The three standard streams of an exec session, plus a cancellation
/// handle that aborts the remote process when dropped or invoked
/// explicitly (spec §4.7 step 6).
pub struct ExecStream {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    pub cancel: ExecCancelHandle,
}

/// One-shot cancellation for an in-flight exec session (spec §4.7 step 5:
/// "the read loop must cancel the exec context on client disconnection").
pub struct ExecCancelHandle {
    inner: Box<dyn FnOnce() + Send>,
}

impl ExecCancelHandle {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { inner: Box::new(f) }
    }

    pub fn cancel(self) {
        (self.inner)();
    }
}

/// Parameters for creating an on-demand jump pod (spec §3, `create_spec`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpPodSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub ready_timeout: Duration,
    pub labels: BTreeMap<String, String>,
}
