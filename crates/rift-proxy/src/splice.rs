//! Main-branch passthrough
//!
//! For `main` the proxy opens its own TCP connection to the upstream,
//! replays a synthetic startup with the configured credentials, completes
//! the upstream's auth exchange, and then splices bytes between the two
//! sockets untouched until either side closes.

use crate::pg_wire::codec::{read_message, write_message, MessageBuf};
use crate::pg_wire::constants::{
    AUTH_CLEARTEXT_PASSWORD, AUTH_MD5_PASSWORD, AUTH_OK, MSG_AUTHENTICATION, MSG_BACKEND_KEY_DATA,
    MSG_ERROR_RESPONSE, MSG_PARAMETER_STATUS, MSG_PASSWORD, MSG_READY_FOR_QUERY,
};
use crate::pg_wire::messages::{build_startup_message, md5_password};
use rift_common::{Result, RiftError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const SPLICE_BUF_SIZE: usize = 32 * 1024;

/// Upstream connection settings for the splice path.
#[derive(Debug, Clone)]
pub struct SpliceConfig {
    pub upstream_addr: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Dial the upstream and complete its handshake for the given database.
pub async fn connect_upstream(config: &SpliceConfig, database: &str) -> Result<TcpStream> {
    let dial = TcpStream::connect(&config.upstream_addr);
    let mut upstream = tokio::time::timeout(config.connect_timeout, dial)
        .await
        .map_err(|_| RiftError::UpstreamUnavailable("connect timeout".into()))?
        .map_err(|e| RiftError::UpstreamUnavailable(e.to_string()))?;

    let startup = build_startup_message(&config.user, database);
    upstream
        .write_all(&startup)
        .await
        .map_err(|e| RiftError::UpstreamUnavailable(e.to_string()))?;

    handle_upstream_auth(&mut upstream, config).await?;

    debug!(database, "upstream connection established");
    Ok(upstream)
}

/// Drive the upstream authentication exchange until ReadyForQuery.
/// The upstream credentials are hashed here, never the client's.
async fn handle_upstream_auth(upstream: &mut TcpStream, config: &SpliceConfig) -> Result<()> {
    loop {
        let (msg_type, payload) = read_message(upstream).await?;

        match msg_type {
            MSG_AUTHENTICATION => {
                if payload.len() < 4 {
                    return Err(RiftError::Protocol("invalid auth message".into()));
                }
                let auth_type =
                    i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

                match auth_type {
                    AUTH_OK => continue,
                    AUTH_CLEARTEXT_PASSWORD => {
                        let mut buf = MessageBuf::new();
                        buf.put_cstr(&config.password);
                        write_message(upstream, MSG_PASSWORD, buf.as_bytes()).await?;
                    }
                    AUTH_MD5_PASSWORD => {
                        if payload.len() < 8 {
                            return Err(RiftError::Protocol("invalid MD5 auth message".into()));
                        }
                        let salt = [payload[4], payload[5], payload[6], payload[7]];
                        let hash = md5_password(&config.user, &config.password, salt);

                        let mut buf = MessageBuf::new();
                        buf.put_cstr(&hash);
                        write_message(upstream, MSG_PASSWORD, buf.as_bytes()).await?;
                    }
                    other => {
                        return Err(RiftError::UpstreamUnavailable(format!(
                            "unsupported upstream auth method {}",
                            other
                        )));
                    }
                }
            }
            // Parameter status and key data are irrelevant to the splice
            MSG_PARAMETER_STATUS | MSG_BACKEND_KEY_DATA => continue,
            MSG_READY_FOR_QUERY => return Ok(()),
            MSG_ERROR_RESPONSE => {
                return Err(RiftError::UpstreamUnavailable(parse_error_message(&payload)))
            }
            other => {
                return Err(RiftError::Protocol(format!(
                    "unexpected message type {:?} during upstream auth",
                    other as char
                )));
            }
        }
    }
}

/// Extract the human-readable message field from an ErrorResponse payload.
fn parse_error_message(payload: &[u8]) -> String {
    let mut buf = MessageBuf::from_bytes(payload);
    while let Ok(field_type) = buf.get_u8() {
        if field_type == 0 {
            break;
        }
        let Ok(value) = buf.get_cstr() else {
            break;
        };
        if field_type == b'M' {
            return value;
        }
    }
    "unknown upstream error".to_string()
}

/// Copy bytes bidirectionally between client and upstream until either side
/// closes. Each read carries an idle deadline so abandoned connections
/// release their resources.
pub async fn splice<C>(client: C, upstream: TcpStream, idle_timeout: Duration) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let client_to_upstream = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            let n = match tokio::time::timeout(idle_timeout, client_rd.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => break,
            };
            if upstream_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = upstream_wr.shutdown().await;
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            let n = match tokio::time::timeout(idle_timeout, upstream_rd.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => break,
            };
            if client_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = client_wr.shutdown().await;
    };

    // Either direction finishing tears down the pair
    tokio::join!(client_to_upstream, upstream_to_client);

    info!("splice finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message() {
        let mut buf = MessageBuf::new();
        buf.put_u8(b'S');
        buf.put_cstr("FATAL");
        buf.put_u8(b'C');
        buf.put_cstr("28P01");
        buf.put_u8(b'M');
        buf.put_cstr("password authentication failed");
        buf.put_u8(0);

        assert_eq!(
            parse_error_message(buf.as_bytes()),
            "password authentication failed"
        );
    }

    #[test]
    fn test_parse_error_message_missing_field() {
        assert_eq!(parse_error_message(&[0]), "unknown upstream error");
    }

    #[tokio::test]
    async fn test_splice_forwards_both_directions() {
        // Client <-> proxy splice <-> "upstream" echo listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream_task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });

        let upstream = TcpStream::connect(addr).await.unwrap();
        let (client_side, proxy_side) = tokio::io::duplex(1024);

        let splice_task = tokio::spawn(splice(
            proxy_side,
            upstream,
            Duration::from_secs(5),
        ));

        let mut client = client_side;
        client.write_all(b"hello").await.unwrap();

        let mut out = [0u8; 5];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"world");

        drop(client);
        upstream_task.await.unwrap();
        splice_task.await.unwrap().unwrap();
    }
}
