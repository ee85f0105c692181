//! `HttpProxy` (spec §4.2): Host-header routing and reverse proxying onto a
//! tunnel's local bridge port.
//!
//! Grounded in the connection-pooled hyper-1.0 reverse proxy pattern used
//! elsewhere in this codebase, simplified to one short-lived client
//! connection per accepted connection — `krelay` proxies a handful of
//! concurrent developer connections, not production request volume, so the
//! added complexity of a connection pool buys nothing here.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use krelay_router::{normalize_host, Scheme};
use krelay_tunnel::{ManagerError, TunnelManager};

fn x_forwarded_proto() -> HeaderName {
    HeaderName::from_static("x-forwarded-proto")
}
fn x_forwarded_host() -> HeaderName {
    HeaderName::from_static("x-forwarded-host")
}
fn x_forwarded_for() -> HeaderName {
    HeaderName::from_static("x-forwarded-for")
}

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("request has no Host header")]
    MissingHost,
    #[error("no route for host: {0}")]
    NoRoute(#[from] ManagerError),
    #[error("failed to reach backend: {0}")]
    BackendUnreachable(std::io::Error),
    #[error("http handshake with backend failed: {0}")]
    Handshake(hyper::Error),
    #[error("serving the client connection failed: {0}")]
    Serve(hyper::Error),
}

pub struct HttpProxy {
    manager: Arc<TunnelManager>,
}

impl HttpProxy {
    pub fn new(manager: Arc<TunnelManager>) -> Self {
        Self { manager }
    }

    /// Serves one accepted HTTP connection until the client closes it.
    /// Errors from individual requests are turned into `502` responses
    /// rather than propagated, per spec §4.2 ("never expose internal error
    /// types"); this only returns `Err` for connection-level failures.
    pub async fn serve(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<(), HttpProxyError> {
        let io = TokioIo::new(stream);
        let manager = self.manager.clone();

        let service = service_fn(move |req: Request<Incoming>| {
            let manager = manager.clone();
            async move { Ok::<_, std::convert::Infallible>(handle(manager, req, client_addr).await) }
        });

        server_http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(HttpProxyError::Serve)
    }
}

async fn handle(
    manager: Arc<TunnelManager>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    match forward(&manager, req, client_addr).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "http proxy request failed");
            bad_gateway(&err.to_string())
        }
    }
}

async fn forward(
    manager: &Arc<TunnelManager>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, HttpProxyError> {
    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(HttpProxyError::MissingHost)?;
    let host = normalize_host(&original_host).to_string();

    let tunnel = manager.get_or_open(&host, Scheme::Http).await?;
    tunnel.touch().await;

    let port = tunnel.local_port().unwrap_or(0);
    let scheme = tunnel.scheme().unwrap_or(Scheme::Http);

    let (mut parts, body) = req.into_parts();
    parts
        .headers
        .insert(x_forwarded_proto(), HeaderValue::from_static(scheme.as_str()));
    parts.headers.insert(
        x_forwarded_host(),
        HeaderValue::from_str(&original_host).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    append_forwarded_for(&mut parts.headers, client_addr);
    let req = Request::from_parts(parts, body);

    let mut sender = connect(port, scheme).await?;
    let response = sender
        .send_request(req)
        .await
        .map_err(HttpProxyError::Handshake)?;

    let (parts, body) = response.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(HttpProxyError::Handshake)?
        .to_bytes();
    Ok(Response::from_parts(parts, Full::new(collected)))
}

/// Spec §4.2 step 4/5: the target is `{scheme=tunnel.scheme, host=127.0.0.1,
/// port=tunnel.local_bridge_port}`; for `scheme=https` the connection to the
/// bridge port is itself TLS, accepting self-signed/invalid certs (the
/// bridge port is the developer's own port-forward, not a public endpoint).
async fn connect(
    port: u16,
    scheme: Scheme,
) -> Result<client_http1::SendRequest<Incoming>, HttpProxyError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(HttpProxyError::BackendUnreachable)?;

    match scheme {
        Scheme::Http => handshake(TokioIo::new(stream)).await,
        Scheme::Https => {
            let server_name = ServerName::try_from("localhost")
                .expect("\"localhost\" is a valid DNS name")
                .to_owned();
            let tls_stream = insecure_tls_connector()
                .connect(server_name, stream)
                .await
                .map_err(HttpProxyError::BackendUnreachable)?;
            handshake(TokioIo::new(tls_stream)).await
        }
    }
}

async fn handshake<IO>(io: TokioIo<IO>) -> Result<client_http1::SendRequest<Incoming>, HttpProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = client_http1::handshake(io)
        .await
        .map_err(HttpProxyError::Handshake)?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "backend connection closed");
        }
    });
    Ok(sender)
}

/// A developer proxy talking to its own port-forwarded bridge port has no
/// meaningful chain of trust to check (spec §4.2 step 5: "accept
/// self-signed/invalid certificates"), so the verifier accepts anything.
fn insecure_tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let name = x_forwarded_for();
    let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn bad_gateway(reason: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(format!("502 Bad Gateway: {reason}"))))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Full::new(Bytes::new()))
                .expect("building a bodiless response never fails")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_client_ip_to_existing_forwarded_for() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(x_forwarded_for(), HeaderValue::from_static("10.0.0.1"));
        append_forwarded_for(&mut headers, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(
            headers.get(&x_forwarded_for()).unwrap().to_str().unwrap(),
            "10.0.0.1, 127.0.0.1"
        );
    }

    #[test]
    fn sets_forwarded_for_when_absent() {
        let mut headers = hyper::HeaderMap::new();
        append_forwarded_for(&mut headers, "192.168.1.5:1234".parse().unwrap());
        assert_eq!(
            headers.get(&x_forwarded_for()).unwrap().to_str().unwrap(),
            "192.168.1.5"
        );
    }

    #[test]
    fn bad_gateway_response_carries_reason_in_body() {
        let response = bad_gateway("tunnel failed to start: timeout");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
