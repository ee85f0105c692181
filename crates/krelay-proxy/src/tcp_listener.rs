//! `TcpListener` (spec §4.7): one listener per configured TCP port, bridging
//! direct routes straight to a tunnel and delegating jump routes to
//! `JumpHandler`.

use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use krelay_router::TcpRoute;
use krelay_tunnel::TunnelManager;

use crate::jump_handler::JumpHandler;

pub struct TcpPortHandler {
    manager: Arc<TunnelManager>,
    jump_handler: Arc<JumpHandler>,
    port: u16,
}

impl TcpPortHandler {
    pub fn new(manager: Arc<TunnelManager>, jump_handler: Arc<JumpHandler>, port: u16) -> Self {
        Self {
            manager,
            jump_handler,
            port,
        }
    }

    pub async fn serve(&self, stream: TcpStream) {
        match self.manager.lookup_tcp_route(self.port) {
            Some(TcpRoute::Direct(_)) => self.serve_direct(stream).await,
            Some(TcpRoute::Jump(route)) => self.jump_handler.serve(stream, route).await,
            None => {
                debug!(port = self.port, "tcp connection for an unconfigured port");
            }
        }
    }

    async fn serve_direct(&self, mut stream: TcpStream) {
        let tunnel = match self.manager.get_or_open_tcp(self.port).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                warn!(port = self.port, error = %err, "tcp tunnel failed to start");
                return;
            }
        };
        tunnel.touch().await;

        let port = tunnel.local_port().unwrap_or(0);
        let mut upstream = match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(port = self.port, error = %err, "tcp bridge dial failed");
                return;
            }
        };

        match copy_bidirectional(&mut stream, &mut upstream).await {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) => {}
            Err(err) => warn!(port = self.port, error = %err, "tcp bridge forwarding failed"),
        }
    }
}
