//! Protocol detection on a freshly accepted connection (spec §4.1).
//!
//! Peeks the first byte without consuming it so the classified stream still
//! yields that byte to whichever path (`HttpProxy` or `TlsPassthrough`)
//! handles it next.

use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const PEEK_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("peek deadline elapsed before any byte arrived")]
    Timeout,
    #[error("connection closed before any byte arrived")]
    ClosedEarly,
    #[error("io error while peeking: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum Classified {
    Http(TcpStream),
    Tls(TcpStream),
}

/// Peeks the first byte of `stream` and classifies it, per spec §4.1: a
/// leading `0x16` (TLS handshake content type) means TLS, anything else
/// (including a short/garbled read) is treated as HTTP. The stream is
/// returned unconsumed — `TcpStream::peek` does not advance the socket.
pub async fn classify(stream: TcpStream) -> Result<Classified, DemuxError> {
    let mut first = [0u8; 1];
    let n = timeout(PEEK_DEADLINE, stream.peek(&mut first))
        .await
        .map_err(|_| DemuxError::Timeout)??;

    if n == 0 {
        return Err(DemuxError::ClosedEarly);
    }

    if first[0] == TLS_CONTENT_TYPE_HANDSHAKE {
        Ok(Classified::Tls(stream))
    } else {
        Ok(Classified::Http(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn classifies_tls_handshake_byte() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        match classify(server).await.unwrap() {
            Classified::Tls(stream) => {
                let mut buf = [0u8; 3];
                stream.peek(&mut buf).await.unwrap();
                assert_eq!(buf, [0x16, 0x03, 0x01]);
            }
            Classified::Http(_) => panic!("expected Tls"),
        }
    }

    #[tokio::test]
    async fn classifies_anything_else_as_http() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        assert!(matches!(classify(server).await.unwrap(), Classified::Http(_)));
    }

    #[tokio::test]
    async fn peek_does_not_consume_the_first_byte() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(b"GET").await.unwrap();

        let stream = match classify(server).await.unwrap() {
            Classified::Http(stream) => stream,
            Classified::Tls(_) => panic!("expected Http"),
        };
        let mut buf = [0u8; 3];
        stream.readable().await.unwrap();
        let n = stream.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"GET");
    }

    #[tokio::test]
    async fn closed_connection_before_any_byte_is_an_error() {
        let (client, server) = loopback_pair().await;
        drop(client);
        assert!(matches!(classify(server).await, Err(DemuxError::ClosedEarly)));
    }
}
