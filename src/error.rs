//! Error taxonomy for public operations.

use serde_json::{json, Value};
use thiserror::Error;

/// Failure classes surfaced by bridge operations.
///
/// Soft conditions (a timed-out lookup inside content resolution, a broken
/// parent link during a thread walk) are recovered where they occur and never
/// reach this type; everything here is fatal to the enclosing operation only.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Target or root event absent, or an unresolvable identity handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed pointer, identifier, or filter parameter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Monitoring was already active for the identity.
    #[error("subscription already active for {0}")]
    DuplicateSubscription(String),

    /// The underlying event source failed a query or live-query setup.
    #[error("transport failure: {0}")]
    Transport(#[from] anyhow::Error),
}

impl BridgeError {
    /// Stable machine-readable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NotFound(_) => "not_found",
            BridgeError::InvalidInput(_) => "invalid_input",
            BridgeError::DuplicateSubscription(_) => "duplicate_subscription",
            BridgeError::Transport(_) => "transport_failure",
        }
    }

    /// Structured payload handed to protocol callers in place of a result.
    ///
    /// No operation is allowed to escape the server boundary as a panic; each
    /// public entry point converts into this shape.
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Result alias for public operations.
pub type OpResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_code_and_message() {
        let err = BridgeError::NotFound("event aa11".into());
        let payload = err.to_payload();
        assert_eq!(payload["error"]["code"], "not_found");
        assert_eq!(payload["error"]["message"], "not found: event aa11");
    }

    #[test]
    fn transport_wraps_anyhow() {
        let err: BridgeError = anyhow::anyhow!("relay refused").into();
        assert_eq!(err.code(), "transport_failure");
        assert!(err.to_string().contains("relay refused"));
    }
}
