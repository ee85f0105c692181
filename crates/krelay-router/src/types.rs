//! The route data model (spec §3).

use std::time::Duration;

/// Either side of the `service XOR pod` invariant that every route target
/// must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOrService {
    Pod(String),
    Service(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Identifies a tunnel in the manager's map: either the hostname carried by
/// an HTTP `Host` header / TLS SNI, or a local TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    HttpHost(String),
    TcpPort(u16),
}

/// A route reachable over HTTP or TLS-passthrough, keyed by hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRoute {
    pub context: String,
    pub namespace: String,
    pub target: PodOrService,
    pub port: u16,
    pub scheme: Scheme,
}

/// A route that bridges a local TCP port directly to a pod/service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpDirectRoute {
    pub context: String,
    pub namespace: String,
    pub target: PodOrService,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePodSpec {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpVia {
    pub target: PodOrService,
    pub container: Option<String>,
    pub create_spec: Option<CreatePodSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpMethod {
    Socat,
}

/// A route that chains through an in-cluster pod via `open_exec` to reach a
/// host:port unreachable directly from the operator's machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpRoute {
    pub context: String,
    pub namespace: String,
    pub via: JumpVia,
    pub target_host: String,
    pub target_port: u16,
    pub method: JumpMethod,
}

/// A TCP route is either a direct bridge or a jump-pod tunnel; both are
/// keyed by the same local-port namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpRoute {
    Direct(TcpDirectRoute),
    Jump(JumpRoute),
}
