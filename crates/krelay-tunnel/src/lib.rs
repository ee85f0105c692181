//! Tunnel state machine and `TunnelManager` registry (spec §4.5/§4.6).
//!
//! A [`Tunnel`] is the polymorphic handle shared by HTTP and TCP-direct
//! routes (spec §9): the only difference between the two is what
//! [`RouteTarget`] carries. [`TunnelManager`] owns the registry keyed by
//! [`krelay_router::RouteKey`], the dynamic-hostname fallback, and the
//! idle reaper.

pub mod discovery;
pub mod manager;
pub mod state;
pub mod tunnel;

pub use discovery::{discover, DiscoveryError, ResolvedTarget};
pub use manager::{ManagerError, RouteSnapshot, TunnelManager};
pub use state::TunnelState;
pub use tunnel::{RouteTarget, Tunnel, TunnelError};
