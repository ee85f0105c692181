//! Connection demultiplexing, HTTP/TLS-passthrough proxying, and the
//! jump-pod TCP handler (spec §4.1–§4.4, §4.7).
//!
//! Everything here operates on tunnels vended by
//! [`krelay_tunnel::TunnelManager`]; this crate owns no cluster state of
//! its own beyond the jump handler's direct [`krelay_k8s::ClusterApi`] use
//! for routes that are not tunnel-backed.

pub mod demux;
pub mod http_proxy;
pub mod jump_handler;
pub mod tcp_listener;
pub mod tls_error;
pub mod tls_passthrough;

pub use demux::{classify, Classified, DemuxError};
pub use http_proxy::{HttpProxy, HttpProxyError};
pub use jump_handler::{JumpError, JumpHandler};
pub use tcp_listener::TcpPortHandler;
pub use tls_error::{ErrorReason, TlsErrorResponder};
pub use tls_passthrough::{TlsPassthrough, TlsPassthroughError};
