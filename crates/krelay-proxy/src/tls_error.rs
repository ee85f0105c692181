//! `TlsErrorResponder` (spec §4.4): completes a TLS handshake with a
//! synthesized certificate and returns a readable HTTP error, for failures
//! that occur after the ClientHello has been peeked but before any bytes
//! have been forwarded to an upstream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use krelay_cert::ErrorCertProvider;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    SniExtractionFailed,
    RouteNotFound,
    TunnelStartupFailed,
    BackendDialFailed,
    ForwardingFailed,
}

impl ErrorReason {
    fn status_line(self) -> &'static str {
        match self {
            ErrorReason::SniExtractionFailed => "400 Bad Request",
            ErrorReason::RouteNotFound => "404 Not Found",
            ErrorReason::TunnelStartupFailed => "502 Bad Gateway",
            ErrorReason::BackendDialFailed => "502 Bad Gateway",
            ErrorReason::ForwardingFailed => "502 Bad Gateway",
        }
    }

    fn diagnostic(self) -> &'static str {
        match self {
            ErrorReason::SniExtractionFailed => "could not determine the requested host from TLS SNI",
            ErrorReason::RouteNotFound => "no route is configured for the requested host",
            ErrorReason::TunnelStartupFailed => "the tunnel to the requested host failed to start",
            ErrorReason::BackendDialFailed => "could not reach the tunnel's local bridge port",
            ErrorReason::ForwardingFailed => "forwarding the connection to the upstream failed",
        }
    }
}

/// Replays already-consumed ClientHello bytes before passing reads through
/// to the underlying socket (spec §4.4 step 3).
struct Replay<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct TlsErrorResponder {
    certs: Arc<ErrorCertProvider>,
}

impl TlsErrorResponder {
    pub fn new(certs: Arc<ErrorCertProvider>) -> Self {
        Self { certs }
    }

    /// Best-effort: any failure along the way closes the connection
    /// silently (spec §4.4 step 5), since there is nothing more useful left
    /// to tell a client that can't even complete a TLS handshake.
    ///
    /// `consumed` is whatever bytes were already read off `stream` before
    /// the failure (e.g. a partial ClientHello); they are replayed to the
    /// TLS acceptor so its own handshake sees the same bytes the client
    /// actually sent.
    pub async fn respond(
        &self,
        stream: TcpStream,
        consumed: Vec<u8>,
        sni: Option<String>,
        reason: ErrorReason,
    ) {
        if let Err(err) = self.try_respond(stream, consumed, sni, reason).await {
            debug!(error = %err, "tls error responder gave up");
        }
    }

    async fn try_respond(
        &self,
        stream: TcpStream,
        consumed: Vec<u8>,
        sni: Option<String>,
        reason: ErrorReason,
    ) -> std::io::Result<()> {
        let hostname = sni.unwrap_or_else(|| "krelay.invalid".to_string());
        let cert = self
            .certs
            .certificate_for(&hostname)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der], cert.private_key())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let replayed = Replay {
            prefix: consumed,
            offset: 0,
            inner: stream,
        };
        let mut tls = timeout(HANDSHAKE_DEADLINE, acceptor.accept(replayed)).await??;

        let body = reason.diagnostic();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reason.status_line(),
            body.len(),
            body
        );
        tls.write_all(response.as_bytes()).await?;
        tls.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_match_spec_reason_codes() {
        assert_eq!(ErrorReason::SniExtractionFailed.status_line(), "400 Bad Request");
        assert_eq!(ErrorReason::RouteNotFound.status_line(), "404 Not Found");
        assert_eq!(ErrorReason::TunnelStartupFailed.status_line(), "502 Bad Gateway");
        assert_eq!(ErrorReason::BackendDialFailed.status_line(), "502 Bad Gateway");
        assert_eq!(ErrorReason::ForwardingFailed.status_line(), "502 Bad Gateway");
    }
}
