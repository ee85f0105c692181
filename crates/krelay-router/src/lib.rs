//! Route data model, registry, and the pure parsers (`Host` header, TLS SNI,
//! dynamic hostname) used to resolve an accepted connection to a route.

pub mod dynamic_hostname;
pub mod http;
pub mod registry;
pub mod sni;
pub mod types;

pub use dynamic_hostname::{parse_dynamic_hostname, DynamicHostnameError, ResolvedDynamicHost};
pub use http::{extract_host, normalize_host, HttpRouterError};
pub use registry::{RouteError, RouteRegistry};
pub use sni::{extract_sni, SniError};
pub use types::{
    CreatePodSpec, HttpRoute, JumpMethod, JumpRoute, JumpVia, PodOrService, RouteKey, Scheme,
    TcpDirectRoute, TcpRoute,
};
