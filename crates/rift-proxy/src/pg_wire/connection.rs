//! Client connection handshake
//!
//! Owns a freshly accepted socket through startup, authentication, and the
//! post-auth parameter burst. SSL and GSSAPI negotiation requests are
//! declined with 'N' and the startup message is re-read; cancel requests
//! end the connection (query cancellation is not wired to the backend).

use super::codec::{parse_startup_message, read_message, read_startup_message, write_message};
use super::constants::{
    CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, MSG_AUTHENTICATION, MSG_BACKEND_KEY_DATA,
    MSG_COMMAND_COMPLETE, MSG_ERROR_RESPONSE, MSG_NOTICE_RESPONSE, MSG_PARAMETER_STATUS,
    MSG_PASSWORD, MSG_READY_FOR_QUERY, PROTOCOL_VERSION, SSL_REQUEST_CODE, TX_STATUS_IDLE,
};
use super::messages;
use rift_common::error::sqlstate;
use rift_common::{Result, RiftError};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Authentication hook: (user, database, password) -> accept/reject.
pub type AuthenticateFn = dyn Fn(&str, &str, &str) -> Result<()> + Send + Sync;

/// A client connection after accept.
pub struct ClientConn<S> {
    stream: S,
    params: HashMap<String, String>,
    user: String,
    database: String,
    pid: i32,
    secret_key: i32,
}

impl<S> ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        // Random pid/secret for BackendKeyData; clients echo these in
        // cancel requests, which rift acknowledges but does not act on.
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        let pid = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let secret_key = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        Self {
            stream,
            params: HashMap::new(),
            user: String::new(),
            database: String::new(),
            pid,
            secret_key,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    #[allow(dead_code)]
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Drive the startup phase: read the startup message (declining SSL and
    /// GSS negotiation), authenticate via the hook, and send the post-auth
    /// message burst ending in ReadyForQuery.
    pub async fn handshake(&mut self, authenticate: &AuthenticateFn) -> Result<()> {
        let params = self.read_startup().await?;
        self.params = params;
        self.user = self.params.get("user").cloned().unwrap_or_default();
        self.database = self.params.get("database").cloned().unwrap_or_default();

        if self.database.is_empty() {
            // Default database is the user name, as the protocol specifies
            self.database = self.user.clone();
        }

        info!(user = %self.user, database = %self.database, "client connected");

        self.authenticate_client(authenticate).await?;
        self.send_post_auth_messages().await
    }

    /// Read the startup message, handling SSL/GSS negotiation by declining
    /// and re-reading. Cancel requests terminate the handshake.
    async fn read_startup(&mut self) -> Result<HashMap<String, String>> {
        loop {
            let payload = read_startup_message(&mut self.stream).await?;
            let (version, params) = parse_startup_message(&payload)?;

            match version {
                SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
                    debug!("SSL/GSSAPI negotiation requested, declining");
                    self.stream.write_all(b"N").await?;
                    self.stream.flush().await?;
                    continue;
                }
                CANCEL_REQUEST_CODE => {
                    warn!("cancel request received; backend cancellation not supported");
                    return Err(RiftError::Protocol("cancel request".into()));
                }
                PROTOCOL_VERSION => return Ok(params),
                other => {
                    return Err(RiftError::Protocol(format!(
                        "unsupported protocol version {}",
                        other
                    )))
                }
            }
        }
    }

    /// Cleartext password authentication against the supplied hook.
    async fn authenticate_client(&mut self, authenticate: &AuthenticateFn) -> Result<()> {
        write_message(
            &mut self.stream,
            MSG_AUTHENTICATION,
            &messages::authentication_cleartext(),
        )
        .await?;
        self.stream.flush().await?;

        let (msg_type, payload) = read_message(&mut self.stream).await?;
        if msg_type != MSG_PASSWORD {
            return Err(RiftError::Protocol(format!(
                "expected password message, got {:?}",
                msg_type as char
            )));
        }

        let password = String::from_utf8_lossy(&payload)
            .trim_end_matches('\0')
            .to_string();

        if let Err(e) = authenticate(&self.user, &self.database, &password) {
            warn!(user = %self.user, "authentication failed: {}", e);
            self.send_error("FATAL", sqlstate::INSUFFICIENT_PRIVILEGE, "authentication failed")
                .await?;
            return Err(RiftError::AuthenticationFailed(self.user.clone()));
        }

        Ok(())
    }

    /// AuthenticationOk, BackendKeyData, ParameterStatus burst, ReadyForQuery.
    async fn send_post_auth_messages(&mut self) -> Result<()> {
        write_message(
            &mut self.stream,
            MSG_AUTHENTICATION,
            &messages::authentication_ok(),
        )
        .await?;

        write_message(
            &mut self.stream,
            MSG_BACKEND_KEY_DATA,
            &messages::backend_key_data(self.pid, self.secret_key),
        )
        .await?;

        let server_params = [
            ("server_version", "15.0 (rift)"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("TimeZone", "UTC"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
        ];
        for (name, value) in server_params {
            write_message(
                &mut self.stream,
                MSG_PARAMETER_STATUS,
                &messages::parameter_status(name, value),
            )
            .await?;
        }

        write_message(
            &mut self.stream,
            MSG_READY_FOR_QUERY,
            &messages::ready_for_query(TX_STATUS_IDLE),
        )
        .await?;
        self.stream.flush().await?;
        Ok(())
    }

    // --- Message helpers used by the session ---

    pub async fn read_message(&mut self) -> Result<(u8, Vec<u8>)> {
        read_message(&mut self.stream).await
    }

    pub async fn write_message(&mut self, msg_type: u8, payload: &[u8]) -> Result<()> {
        write_message(&mut self.stream, msg_type, payload).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_error(&mut self, severity: &str, code: &str, message: &str) -> Result<()> {
        self.write_message(
            MSG_ERROR_RESPONSE,
            &messages::error_response(severity, code, message),
        )
        .await?;
        self.flush().await
    }

    pub async fn send_notice(&mut self, message: &str) -> Result<()> {
        self.write_message(
            MSG_NOTICE_RESPONSE,
            &messages::notice_response("NOTICE", "00000", message),
        )
        .await
    }

    pub async fn send_ready_for_query(&mut self, tx_status: u8) -> Result<()> {
        self.write_message(MSG_READY_FOR_QUERY, &messages::ready_for_query(tx_status))
            .await?;
        self.flush().await
    }

    pub async fn send_command_complete(&mut self, tag: &str) -> Result<()> {
        self.write_message(MSG_COMMAND_COMPLETE, &messages::command_complete(tag))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Drive a full handshake over an in-memory duplex: SSLRequest declined,
    /// then startup, cleartext auth, and the post-auth burst.
    #[tokio::test]
    async fn test_handshake_with_ssl_decline() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut conn = ClientConn::new(server_side);

        let server = tokio::spawn(async move {
            conn.handshake(&|user, database, password| {
                assert_eq!(user, "alice");
                assert_eq!(database, "dev");
                assert_eq!(password, "pw");
                Ok(())
            })
            .await
            .unwrap();
            conn
        });

        let mut client = client_side;

        // SSLRequest
        let mut ssl_req = 8u32.to_be_bytes().to_vec();
        ssl_req.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        client.write_all(&ssl_req).await.unwrap();

        let mut resp = [0u8; 1];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp[0], b'N');

        // Startup
        let mut body = super::super::codec::MessageBuf::new();
        body.put_i32(PROTOCOL_VERSION);
        body.put_cstr("user");
        body.put_cstr("alice");
        body.put_cstr("database");
        body.put_cstr("dev");
        body.put_u8(0);
        let body = body.into_bytes();
        let mut framed = ((body.len() as u32) + 4).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        client.write_all(&framed).await.unwrap();

        // AuthenticationCleartextPassword
        let (msg_type, payload) = read_message(&mut client).await.unwrap();
        assert_eq!(msg_type, MSG_AUTHENTICATION);
        assert_eq!(payload, AUTH_CLEARTEXT.to_vec());

        // Password
        write_message(&mut client, MSG_PASSWORD, b"pw\0").await.unwrap();

        // AuthenticationOk
        let (msg_type, payload) = read_message(&mut client).await.unwrap();
        assert_eq!(msg_type, MSG_AUTHENTICATION);
        assert_eq!(payload, 0i32.to_be_bytes().to_vec());

        // BackendKeyData
        let (msg_type, _) = read_message(&mut client).await.unwrap();
        assert_eq!(msg_type, MSG_BACKEND_KEY_DATA);

        // ParameterStatus burst then ReadyForQuery(Idle)
        loop {
            let (msg_type, payload) = read_message(&mut client).await.unwrap();
            if msg_type == MSG_READY_FOR_QUERY {
                assert_eq!(payload, vec![TX_STATUS_IDLE]);
                break;
            }
            assert_eq!(msg_type, MSG_PARAMETER_STATUS);
        }

        let conn = server.await.unwrap();
        assert_eq!(conn.user(), "alice");
        assert_eq!(conn.database(), "dev");
    }

    const AUTH_CLEARTEXT: [u8; 4] = [0, 0, 0, 3];

    #[tokio::test]
    async fn test_handshake_auth_failure() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut conn = ClientConn::new(server_side);

        let server = tokio::spawn(async move {
            conn.handshake(&|_, _, _| Err(RiftError::AuthenticationFailed("nope".into())))
                .await
        });

        let mut client = client_side;

        let mut body = super::super::codec::MessageBuf::new();
        body.put_i32(PROTOCOL_VERSION);
        body.put_cstr("user");
        body.put_cstr("mallory");
        body.put_u8(0);
        let body = body.into_bytes();
        let mut framed = ((body.len() as u32) + 4).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        client.write_all(&framed).await.unwrap();

        let (_, _) = read_message(&mut client).await.unwrap(); // auth request
        write_message(&mut client, MSG_PASSWORD, b"wrong\0").await.unwrap();

        // FATAL ErrorResponse with 42501
        let (msg_type, payload) = read_message(&mut client).await.unwrap();
        assert_eq!(msg_type, MSG_ERROR_RESPONSE);
        let text = String::from_utf8_lossy(&payload);
        assert!(text.contains("FATAL"));
        assert!(text.contains("42501"));

        let result = server.await.unwrap();
        assert!(matches!(result, Err(RiftError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_database_defaults_to_user() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut conn = ClientConn::new(server_side);

        let server = tokio::spawn(async move {
            conn.handshake(&|_, _, _| Ok(())).await.unwrap();
            conn
        });

        let mut client = client_side;
        let mut body = super::super::codec::MessageBuf::new();
        body.put_i32(PROTOCOL_VERSION);
        body.put_cstr("user");
        body.put_cstr("carol");
        body.put_u8(0);
        let body = body.into_bytes();
        let mut framed = ((body.len() as u32) + 4).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        client.write_all(&framed).await.unwrap();

        let _ = read_message(&mut client).await.unwrap();
        write_message(&mut client, MSG_PASSWORD, b"x\0").await.unwrap();

        // Drain to ReadyForQuery
        loop {
            let (msg_type, _) = read_message(&mut client).await.unwrap();
            if msg_type == MSG_READY_FOR_QUERY {
                break;
            }
        }

        let conn = server.await.unwrap();
        assert_eq!(conn.database(), "carol");
    }
}
