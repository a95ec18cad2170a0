//! Error taxonomy for the relay fabric.
//!
//! Network and parsing faults are absorbed inside the core and surfaced only
//! through health/metrics; RPC errors and timeouts bubble up to the caller
//! of a `call`. A suppressed duplicate is deliberately not a variant here —
//! the deduplicator signals it as the `bool` return of `seen`, not an error.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("backpressure: queue full")]
    BackpressureDrop,

    #[error("no active connection")]
    NoConnection,
}

impl RelayError {
    /// RPC errors treated as "endpoint degraded": code <= -32000, or the
    /// JSON-RPC reserved internal-error/timeout codes.
    pub fn is_degraded_rpc(code: i64) -> bool {
        code <= -32000 || matches!(code, -32603 | -32010)
    }

    /// Whether this error should count against an endpoint's health.
    pub fn penalizes_endpoint(&self) -> bool {
        matches!(
            self,
            RelayError::TransientNetwork(_)
                | RelayError::HandshakeRejected(_)
                | RelayError::Timeout
                | RelayError::Rpc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_rpc_codes() {
        assert!(RelayError::is_degraded_rpc(-32000));
        assert!(RelayError::is_degraded_rpc(-32603));
        assert!(RelayError::is_degraded_rpc(-32010));
        assert!(RelayError::is_degraded_rpc(-40000));
        assert!(!RelayError::is_degraded_rpc(-31999)); // just above the -32000 boundary
        assert!(!RelayError::is_degraded_rpc(-100));
    }

    #[test]
    fn penalizes_endpoint_classification() {
        assert!(RelayError::Timeout.penalizes_endpoint());
        assert!(!RelayError::Malformed("x".into()).penalizes_endpoint());
        assert!(!RelayError::BackpressureDrop.penalizes_endpoint());
    }
}
