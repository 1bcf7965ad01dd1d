//! Wire protocol message payload builders
//!
//! Each function returns the payload for one backend message; framing is
//! done by `codec::write_message`. Startup and password messages for the
//! upstream dial are built here too.

use super::codec::MessageBuf;
use super::constants::{
    AUTH_CLEARTEXT_PASSWORD, AUTH_OK, FIELD_CODE, FIELD_MESSAGE, FIELD_SEVERITY,
    PROTOCOL_VERSION,
};

/// AuthenticationOk payload
pub fn authentication_ok() -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i32(AUTH_OK);
    buf.into_bytes()
}

/// AuthenticationCleartextPassword payload
pub fn authentication_cleartext() -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i32(AUTH_CLEARTEXT_PASSWORD);
    buf.into_bytes()
}

/// BackendKeyData payload
pub fn backend_key_data(pid: i32, secret_key: i32) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i32(pid);
    buf.put_i32(secret_key);
    buf.into_bytes()
}

/// ParameterStatus payload
pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_cstr(name);
    buf.put_cstr(value);
    buf.into_bytes()
}

/// ReadyForQuery payload
pub fn ready_for_query(tx_status: u8) -> Vec<u8> {
    vec![tx_status]
}

/// ErrorResponse payload with severity, SQLSTATE code, and message fields
pub fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_u8(FIELD_SEVERITY);
    buf.put_cstr(severity);
    buf.put_u8(FIELD_CODE);
    buf.put_cstr(code);
    buf.put_u8(FIELD_MESSAGE);
    buf.put_cstr(message);
    buf.put_u8(0);
    buf.into_bytes()
}

/// NoticeResponse payload (same field format as ErrorResponse)
pub fn notice_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    error_response(severity, code, message)
}

/// CommandComplete payload
pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_cstr(tag);
    buf.into_bytes()
}

/// ParameterDescription payload describing zero parameters
pub fn empty_parameter_description() -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i16(0);
    buf.into_bytes()
}

/// One field of a RowDescription
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: i32,
    pub type_size: i16,
}

/// RowDescription payload. Format code is always 0 (text).
pub fn row_description(fields: &[FieldDescription]) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i16(fields.len() as i16);
    for f in fields {
        buf.put_cstr(&f.name);
        buf.put_i32(0); // table OID
        buf.put_i16(0); // column attribute number
        buf.put_i32(f.type_oid);
        buf.put_i16(f.type_size);
        buf.put_i32(-1); // type modifier
        buf.put_i16(0); // format code: text
    }
    buf.into_bytes()
}

/// DataRow payload. NULL values encode as length -1.
pub fn data_row(values: &[Option<String>]) -> Vec<u8> {
    let mut buf = MessageBuf::new();
    buf.put_i16(values.len() as i16);
    for v in values {
        match v {
            None => buf.put_i32(-1),
            Some(text) => {
                buf.put_i32(text.len() as i32);
                buf.put_bytes(text.as_bytes());
            }
        }
    }
    buf.into_bytes()
}

/// Full startup message (length-framed, no type byte) for the upstream dial.
pub fn build_startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = MessageBuf::new();
    body.put_i32(PROTOCOL_VERSION);
    body.put_cstr("user");
    body.put_cstr(user);
    body.put_cstr("database");
    body.put_cstr(database);
    body.put_cstr("application_name");
    body.put_cstr("rift");
    body.put_u8(0);

    let body = body.into_bytes();
    let mut framed = ((body.len() as u32) + 4).to_be_bytes().to_vec();
    framed.extend_from_slice(&body);
    framed
}

/// MD5 password response per the wire protocol:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    let inner_hex = format!("{:x}", inner);

    let mut salted = inner_hex.into_bytes();
    salted.extend_from_slice(&salt);
    let outer = md5::compute(&salted);

    format!("md5{:x}", outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_fields() {
        let payload = error_response("ERROR", "42P01", "table not found");

        let mut buf = MessageBuf::from_bytes(&payload);
        assert_eq!(buf.get_u8().unwrap(), b'S');
        assert_eq!(buf.get_cstr().unwrap(), "ERROR");
        assert_eq!(buf.get_u8().unwrap(), b'C');
        assert_eq!(buf.get_cstr().unwrap(), "42P01");
        assert_eq!(buf.get_u8().unwrap(), b'M');
        assert_eq!(buf.get_cstr().unwrap(), "table not found");
        assert_eq!(buf.get_u8().unwrap(), 0);
    }

    #[test]
    fn test_parameter_status() {
        let payload = parameter_status("TimeZone", "UTC");
        let mut buf = MessageBuf::from_bytes(&payload);
        assert_eq!(buf.get_cstr().unwrap(), "TimeZone");
        assert_eq!(buf.get_cstr().unwrap(), "UTC");
    }

    #[test]
    fn test_data_row_null_encoding() {
        let payload = data_row(&[Some("42".into()), None, Some(String::new())]);
        let mut buf = MessageBuf::from_bytes(&payload);
        assert_eq!(buf.get_i16().unwrap(), 3);
        assert_eq!(buf.get_i32().unwrap(), 2);
        assert_eq!(buf.get_bytes(2).unwrap(), b"42");
        assert_eq!(buf.get_i32().unwrap(), -1); // NULL
        assert_eq!(buf.get_i32().unwrap(), 0); // empty string, zero length
    }

    #[test]
    fn test_row_description_text_format() {
        let payload = row_description(&[FieldDescription {
            name: "id".into(),
            type_oid: 23,
            type_size: 4,
        }]);
        let mut buf = MessageBuf::from_bytes(&payload);
        assert_eq!(buf.get_i16().unwrap(), 1);
        assert_eq!(buf.get_cstr().unwrap(), "id");
        assert_eq!(buf.get_i32().unwrap(), 0);
        assert_eq!(buf.get_i16().unwrap(), 0);
        assert_eq!(buf.get_i32().unwrap(), 23);
        assert_eq!(buf.get_i16().unwrap(), 4);
        assert_eq!(buf.get_i32().unwrap(), -1);
        assert_eq!(buf.get_i16().unwrap(), 0); // text format
    }

    #[test]
    fn test_md5_password_shape() {
        let result = md5_password("postgres", "secret", [0x01, 0x02, 0x03, 0x04]);
        assert!(result.starts_with("md5"));
        assert_eq!(result.len(), 35); // "md5" + 32 hex chars
        assert!(result[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_md5_password_deterministic() {
        let a = md5_password("u", "p", [0, 0, 0, 0]);
        let b = md5_password("u", "p", [0, 0, 0, 0]);
        let c = md5_password("u", "p", [0, 0, 0, 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_build_startup_message() {
        let msg = build_startup_message("admin", "app");
        // Length prefix covers the whole message
        let len = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
        assert_eq!(len, msg.len());

        let (version, params) = super::super::codec::parse_startup_message(&msg[4..]).unwrap();
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(params["user"], "admin");
        assert_eq!(params["database"], "app");
        assert_eq!(params["application_name"], "rift");
    }
}
