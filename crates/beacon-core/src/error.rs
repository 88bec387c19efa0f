//! Error types for the Beacon signaling protocol

use thiserror::Error;

/// Errors raised while validating an inbound event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Registry-level errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("entropy source unavailable: {0}")]
    Entropy(#[from] getrandom::Error),
}
