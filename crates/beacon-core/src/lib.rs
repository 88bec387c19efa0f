//! Beacon Core - Shared configuration, error types, and crypto helpers
//!
//! This crate contains the foundational pieces used by the Beacon signal server.
//! It has no dependencies on networking code.

pub mod config;
pub mod crypto;
pub mod error;

pub use config::{Config, ConfigError, HttpConfig, LivenessConfig, ServerConfig};
pub use error::*;

/// Default service port (HTTP and WebSocket share it)
pub const DEFAULT_PORT: u16 = 8080;

/// Default time without inbound traffic before a peer is evicted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default period of the idle sweep
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;

/// Default depth of each peer's outbound queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default time a client has to finish sending a request head
pub const DEFAULT_HEAD_TIMEOUT_SECS: u64 = 10;

/// Maximum inbound WebSocket message size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum alias length in characters
pub const MAX_ALIAS_LEN: usize = 64;
