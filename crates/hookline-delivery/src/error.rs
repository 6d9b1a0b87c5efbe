//! Error types for the delivery pipeline.
//!
//! Worker-side errors are classified and recorded on the attempt row rather
//! than propagated; only storage failures bubble up to the loop, which backs
//! off and retries.

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions in the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Destination resolved to no allowed address.
    #[error("ssrf_blocked: no allowed address for {host}")]
    SsrfBlocked {
        /// Hostname that failed the block-set check.
        host: String,
    },

    /// DNS resolution failed.
    #[error("dns error: {message}")]
    Dns {
        /// Resolver error description.
        message: String,
    },

    /// Destination URL could not be parsed or misses required parts.
    #[error("invalid destination url: {message}")]
    InvalidUrl {
        /// Parse error description.
        message: String,
    },

    /// End-to-end request timeout exceeded.
    #[error("request timeout after {seconds}s")]
    Timeout {
        /// Configured total timeout in seconds.
        seconds: u64,
    },

    /// Transport-level failure (connect, reset, protocol).
    #[error("network error: {message}")]
    Network {
        /// Transport error description.
        message: String,
    },

    /// TLS handshake or certificate failure.
    #[error("tls error: {message}")]
    Tls {
        /// TLS error description.
        message: String,
    },

    /// Coordination-store (rate gate) failure.
    #[error("rate gate error: {message}")]
    Gate {
        /// Redis error description.
        message: String,
    },

    /// Durable-store failure.
    #[error("database error: {0}")]
    Database(String),

    /// Unexpected internal failure.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl DeliveryError {
    /// Creates an SSRF block error for a host.
    pub fn ssrf_blocked(host: impl Into<String>) -> Self {
        Self::SsrfBlocked { host: host.into() }
    }

    /// Creates a DNS error.
    pub fn dns(message: impl Into<String>) -> Self {
        Self::Dns { message: message.into() }
    }

    /// Creates an invalid-URL error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls { message: message.into() }
    }

    /// Creates a rate-gate error.
    pub fn gate(message: impl Into<String>) -> Self {
        Self::Gate { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// True for failures of the durable store.
    ///
    /// These are the only errors the worker loop treats as its own problem
    /// (sleep and retry); everything else becomes a recorded outcome.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<hookline_core::CoreError> for DeliveryError {
    fn from(err: hookline_core::CoreError) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::Error> for DeliveryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<redis::RedisError> for DeliveryError {
    fn from(err: redis::RedisError) -> Self {
        Self::Gate { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_identified() {
        assert!(DeliveryError::Database("gone".to_string()).is_storage());
        assert!(!DeliveryError::timeout(15).is_storage());
        assert!(!DeliveryError::ssrf_blocked("metadata.internal").is_storage());
    }

    #[test]
    fn ssrf_display_carries_marker() {
        let err = DeliveryError::ssrf_blocked("169.254.169.254");
        assert!(err.to_string().starts_with("ssrf_blocked"));
    }
}
