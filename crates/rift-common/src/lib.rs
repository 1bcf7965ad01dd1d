//! Shared types for rift services
//!
//! Provides the domain error type, configuration structures, and the
//! tracing bootstrap used by all rift crates.

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::Config;
pub use error::{Result, RiftError};
