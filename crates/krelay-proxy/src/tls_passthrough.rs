//! `TlsPassthrough` (spec §4.3): SNI-based routing without terminating TLS.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use krelay_router::{extract_sni, Scheme, SniError};
use krelay_tunnel::{ManagerError, TunnelManager};

use crate::tls_error::{ErrorReason, TlsErrorResponder};

const CLIENT_HELLO_READ_DEADLINE: Duration = Duration::from_secs(10);
const BACKEND_DIAL_DEADLINE: Duration = Duration::from_secs(10);
const MAX_CLIENT_HELLO_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TlsPassthroughError {
    #[error("reading the ClientHello timed out")]
    ReadTimeout,
    #[error("io error reading the ClientHello: {0}")]
    Io(std::io::Error),
    #[error("SNI extraction failed: {0}")]
    SniExtraction(SniError),
    #[error("no route for SNI: {0}")]
    RouteNotFound(ManagerError),
    #[error("backend dial failed: {0}")]
    BackendDial(std::io::Error),
    #[error("forwarding the connection failed: {0}")]
    Forwarding(std::io::Error),
}

impl TlsPassthroughError {
    fn reason(&self) -> ErrorReason {
        match self {
            TlsPassthroughError::ReadTimeout
            | TlsPassthroughError::Io(_)
            | TlsPassthroughError::SniExtraction(_) => ErrorReason::SniExtractionFailed,
            // `get_or_open` also surfaces `ManagerError::TunnelFailed` when the
            // route resolves but discovery/port-forward setup itself fails;
            // that is a startup failure (502), distinct from no route existing
            // for the SNI at all (404) (spec §4.3 reason codes).
            TlsPassthroughError::RouteNotFound(ManagerError::NoRouteForKey(_))
            | TlsPassthroughError::RouteNotFound(ManagerError::NoRouteForPort(_))
            | TlsPassthroughError::RouteNotFound(ManagerError::NotDirectRoute(_)) => {
                ErrorReason::RouteNotFound
            }
            TlsPassthroughError::RouteNotFound(ManagerError::TunnelFailed(_)) => {
                ErrorReason::TunnelStartupFailed
            }
            TlsPassthroughError::BackendDial(_) => ErrorReason::BackendDialFailed,
            TlsPassthroughError::Forwarding(_) => ErrorReason::ForwardingFailed,
        }
    }
}

pub struct TlsPassthrough {
    manager: Arc<TunnelManager>,
    error_responder: Arc<TlsErrorResponder>,
}

impl TlsPassthrough {
    pub fn new(manager: Arc<TunnelManager>, error_responder: Arc<TlsErrorResponder>) -> Self {
        Self {
            manager,
            error_responder,
        }
    }

    /// Handles one accepted TLS connection start to finish: on any failure
    /// before the ClientHello is forwarded, hands the connection (with the
    /// bytes already read) to the error responder instead of closing it.
    pub async fn serve(&self, mut stream: TcpStream) {
        let hello = match read_client_hello(&mut stream).await {
            Ok(hello) => hello,
            Err(err) => {
                debug!(error = %err, "failed reading ClientHello");
                self.error_responder
                    .respond(stream, Vec::new(), None, ErrorReason::SniExtractionFailed)
                    .await;
                return;
            }
        };

        if let Err(err) = self.forward(&mut stream, &hello).await {
            let sni = extract_sni(&hello).ok();
            info!(error = %err, sni = sni.as_deref(), "tls passthrough failed");
            self.error_responder
                .respond(stream, hello, sni, err.reason())
                .await;
        }
    }

    async fn forward(&self, stream: &mut TcpStream, hello: &[u8]) -> Result<(), TlsPassthroughError> {
        let sni = extract_sni(hello).map_err(TlsPassthroughError::SniExtraction)?;

        let tunnel = self
            .manager
            .get_or_open(&sni, Scheme::Https)
            .await
            .map_err(TlsPassthroughError::RouteNotFound)?;
        tunnel.touch().await;

        let port = tunnel.local_port().unwrap_or(0);
        let mut upstream = timeout(BACKEND_DIAL_DEADLINE, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| {
                TlsPassthroughError::BackendDial(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "backend dial deadline elapsed",
                ))
            })?
            .map_err(TlsPassthroughError::BackendDial)?;

        upstream
            .write_all(hello)
            .await
            .map_err(TlsPassthroughError::Forwarding)?;

        match copy_bidirectional(stream, &mut upstream).await {
            Ok(_) => Ok(()),
            // A reset or broken pipe mid-stream is an ordinary half-close,
            // not a forwarding failure (spec §4.3 step 5).
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(TlsPassthroughError::Forwarding(err)),
        }
    }
}

/// Reads up to 16 KiB under a 10s deadline, enough to capture a full
/// ClientHello record in practice (spec §4.3 step 1).
async fn read_client_hello(stream: &mut TcpStream) -> Result<Vec<u8>, TlsPassthroughError> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO_BYTES];
    let n = timeout(CLIENT_HELLO_READ_DEADLINE, stream.read(&mut buf))
        .await
        .map_err(|_| TlsPassthroughError::ReadTimeout)?
        .map_err(TlsPassthroughError::Io)?;
    if n == 0 {
        return Err(TlsPassthroughError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before ClientHello",
        )));
    }
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_timeout_maps_to_sni_extraction_failed_reason() {
        assert_eq!(
            TlsPassthroughError::ReadTimeout.reason(),
            ErrorReason::SniExtractionFailed
        );
    }

    #[test]
    fn route_not_found_maps_to_route_not_found_reason() {
        let err = TlsPassthroughError::RouteNotFound(ManagerError::NoRouteForKey("x".into()));
        assert_eq!(err.reason(), ErrorReason::RouteNotFound);
    }

    #[test]
    fn tunnel_startup_failure_maps_to_tunnel_startup_failed_reason() {
        let err = TlsPassthroughError::RouteNotFound(ManagerError::TunnelFailed(
            krelay_tunnel::TunnelError::Timeout,
        ));
        assert_eq!(err.reason(), ErrorReason::TunnelStartupFailed);
    }

    #[test]
    fn backend_dial_maps_to_backend_dial_failed_reason() {
        let err = TlsPassthroughError::BackendDial(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(err.reason(), ErrorReason::BackendDialFailed);
    }
}
