//! Wire message framing
//!
//! A post-startup message is `type:u8 | length:u32be | payload`, where the
//! length includes itself. Startup-phase messages omit the type byte and
//! are identified by the first four payload bytes. Payloads are capped at
//! 1 GiB; anything larger is rejected before allocation.

use rift_common::{Result, RiftError};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on message payload length (1 GiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

/// Read a complete message, returning its type byte and payload.
pub async fn read_message<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let msg_type = header[0];
    let length = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let payload_len = length as i64 - 4;

    if payload_len < 0 || payload_len as usize > MAX_MESSAGE_SIZE {
        return Err(RiftError::MessageTooLarge);
    }

    let mut payload = vec![0u8; payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok((msg_type, payload))
}

/// Read a startup-phase message (no type byte).
pub async fn read_startup_message<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let length = i32::from_be_bytes(header);
    let payload_len = length as i64 - 4;

    if payload_len < 0 || payload_len as usize > MAX_MESSAGE_SIZE {
        return Err(RiftError::MessageTooLarge);
    }

    let mut payload = vec![0u8; payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok(payload)
}

/// Write a complete framed message.
pub async fn write_message<W>(writer: &mut W, msg_type: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 5];
    header[0] = msg_type;
    header[1..5].copy_from_slice(&((payload.len() as u32 + 4).to_be_bytes()));

    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Growable message buffer with big-endian and C-string primitives.
#[derive(Debug, Default)]
pub struct MessageBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl MessageBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            pos: 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    // --- Writing ---

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    #[allow(dead_code)]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Append a null-terminated string.
    pub fn put_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    // --- Reading ---

    pub fn get_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(truncated());
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[allow(dead_code)]
    pub fn get_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read up to and past the next null terminator.
    pub fn get_cstr(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            if self.buf[self.pos] == 0 {
                let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(truncated())
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn truncated() -> RiftError {
    RiftError::Protocol("truncated message".into())
}

/// Parse a startup payload into its protocol version and parameter map.
/// The version slot may instead hold an SSL/GSS/cancel negotiation code.
pub fn parse_startup_message(payload: &[u8]) -> Result<(i32, HashMap<String, String>)> {
    if payload.len() < 4 {
        return Err(RiftError::Protocol("startup message too short".into()));
    }

    let version = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut params = HashMap::new();

    let mut buf = MessageBuf::from_bytes(&payload[4..]);
    while buf.remaining() > 1 {
        let key = match buf.get_cstr() {
            Ok(k) if !k.is_empty() => k,
            _ => break,
        };
        let Ok(value) = buf.get_cstr() else {
            break;
        };
        params.insert(key, value);
    }

    Ok((version, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buf_roundtrip() {
        let mut buf = MessageBuf::new();
        buf.put_u8(42);
        buf.put_i16(-7);
        buf.put_i32(123456);
        buf.put_i64(-987654321);
        buf.put_cstr("hello");

        let mut rd = MessageBuf::from_bytes(buf.as_bytes());
        assert_eq!(rd.get_u8().unwrap(), 42);
        assert_eq!(rd.get_i16().unwrap(), -7);
        assert_eq!(rd.get_i32().unwrap(), 123456);
        assert_eq!(rd.get_i64().unwrap(), -987654321);
        assert_eq!(rd.get_cstr().unwrap(), "hello");
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn test_buf_truncated_reads() {
        let mut rd = MessageBuf::from_bytes(&[0x01]);
        assert!(rd.get_i32().is_err());

        let mut rd = MessageBuf::from_bytes(b"no-terminator");
        assert!(rd.get_cstr().is_err());
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(256);

        write_message(&mut client, b'Q', b"SELECT 1\0").await.unwrap();
        let (msg_type, payload) = read_message(&mut server).await.unwrap();
        assert_eq!(msg_type, b'Q');
        assert_eq!(payload, b"SELECT 1\0");
    }

    #[tokio::test]
    async fn test_message_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_message(&mut client, b'S', &[]).await.unwrap();
        let (msg_type, payload) = read_message(&mut server).await.unwrap();
        assert_eq!(msg_type, b'S');
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_message_too_large_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Hand-craft a header whose length exceeds the cap
        let mut header = vec![b'Q'];
        header.extend_from_slice(&((MAX_MESSAGE_SIZE as u32 + 5).to_be_bytes()));
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, RiftError::MessageTooLarge));
    }

    #[tokio::test]
    async fn test_startup_message_at_cap_accepted() {
        // A length of exactly MAX + 4 (payload = MAX) passes the size gate;
        // use a small payload to keep the test cheap but exercise the
        // boundary arithmetic on the header.
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = b"\x00\x03\x00\x00";
        let mut framed = ((payload.len() as u32) + 4).to_be_bytes().to_vec();
        framed.extend_from_slice(payload);
        tokio::io::AsyncWriteExt::write_all(&mut client, &framed)
            .await
            .unwrap();

        let got = read_startup_message(&mut server).await.unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_parse_startup_message() {
        let mut buf = MessageBuf::new();
        buf.put_i32(196608);
        buf.put_cstr("user");
        buf.put_cstr("alice");
        buf.put_cstr("database");
        buf.put_cstr("dev");
        buf.put_u8(0);

        let (version, params) = parse_startup_message(buf.as_bytes()).unwrap();
        assert_eq!(version, 196608);
        assert_eq!(params.get("user").map(String::as_str), Some("alice"));
        assert_eq!(params.get("database").map(String::as_str), Some("dev"));
    }

    #[test]
    fn test_parse_startup_build_parse_roundtrip() {
        let mut buf = MessageBuf::new();
        buf.put_i32(196608);
        for (k, v) in [("user", "bob"), ("database", "feature-1")] {
            buf.put_cstr(k);
            buf.put_cstr(v);
        }
        buf.put_u8(0);

        let (_, params) = parse_startup_message(buf.as_bytes()).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["user"], "bob");
        assert_eq!(params["database"], "feature-1");
    }
}
