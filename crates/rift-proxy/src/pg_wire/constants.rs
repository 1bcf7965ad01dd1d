//! PostgreSQL v3 wire protocol constants
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

// Frontend (client -> server) message types
pub const MSG_QUERY: u8 = b'Q';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_BIND: u8 = b'B';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_CLOSE: u8 = b'C';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_FLUSH: u8 = b'H';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_PASSWORD: u8 = b'p';

// Backend (server -> client) message types
pub const MSG_AUTHENTICATION: u8 = b'R';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_BIND_COMPLETE: u8 = b'2';
pub const MSG_CLOSE_COMPLETE: u8 = b'3';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_DATA_ROW: u8 = b'D';
pub const MSG_EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_NO_DATA: u8 = b'n';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';
pub const MSG_PARAMETER_DESCRIPTION: u8 = b't';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_PARSE_COMPLETE: u8 = b'1';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';

// Authentication request codes
pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTH_MD5_PASSWORD: i32 = 5;

// Transaction status indicators (ReadyForQuery)
pub const TX_STATUS_IDLE: u8 = b'I';
pub const TX_STATUS_IN_TX: u8 = b'T';
pub const TX_STATUS_FAILED: u8 = b'E';

// Startup protocol codes
pub const PROTOCOL_VERSION: i32 = 196608; // 3.0 = (3 << 16)
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// Error and notice field tags
pub const FIELD_SEVERITY: u8 = b'S';
pub const FIELD_CODE: u8 = b'C';
pub const FIELD_MESSAGE: u8 = b'M';
