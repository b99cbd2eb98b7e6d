use serde_json::Value;
use thiserror::Error;

/// Errors from the XMPP connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    TransportError(String),
}

impl ConnectionError {
    /// Authentication failures are permanent; everything else may be
    /// retried on the next connect attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthenticationFailed(_))
    }
}

/// A JSON-RPC error object, as carried in response stanzas and thrown by
/// backend method handlers.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Value,
}

/// Well-known JSON-RPC 2.0 error codes.
pub mod rpc_codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(rpc_codes::INTERNAL_ERROR, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            rpc_codes::METHOD_NOT_FOUND,
            format!("method not found or not allowed: {method}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_is_not_retryable() {
        assert!(!ConnectionError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::Closed.is_retryable());
    }

    #[test]
    fn rpc_error_display_names_code_and_message() {
        let error = RpcError::method_not_found("frobnicate");
        assert_eq!(error.code, rpc_codes::METHOD_NOT_FOUND);
        assert!(error.to_string().contains("frobnicate"));
    }
}
