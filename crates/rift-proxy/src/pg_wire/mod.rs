//! PostgreSQL v3 wire protocol
//!
//! - `constants` — message type bytes, auth codes, protocol codes
//! - `codec` — message framing and buffer primitives
//! - `messages` — backend message payload builders
//! - `types` — type name to OID mapping for row descriptions
//! - `connection` — client handshake and message helpers

pub mod codec;
pub mod connection;
pub mod constants;
pub mod messages;
pub mod types;
