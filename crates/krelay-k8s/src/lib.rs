//! The `ClusterApi` trait and its production adapter (spec §4.9).
//!
//! Everything above this crate — `krelay-tunnel`'s discovery and
//! port-forward logic, `krelay-proxy`'s `JumpHandler` — talks to the
//! cluster exclusively through the `ClusterApi` trait object. This crate
//! owns the one production implementation (`KubeClusterApi`, built on
//! `kube`/`k8s-openapi`) and the per-context client cache that makes
//! `ClusterApi` handles cheap to hand out repeatedly.

pub mod api;
pub mod cache;
pub mod error;
pub mod kube_api;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use api::ClusterApi;
pub use cache::{ClientCache, ClientHandle, ClientInitError, KubeconfigSource};
pub use error::ClusterError;
pub use kube_api::KubeClusterApi;
pub use types::{
    ExecCancelHandle, ExecStream, JumpPodSpec, PodInfo, PortForwardStream, ServiceInfo, ServicePort,
    TargetPort,
};

#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeClusterApi;
