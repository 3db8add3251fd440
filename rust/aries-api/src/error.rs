//! Error taxonomy shared across the fabric.
//!
//! Components return [`FabricError`] on their fallible surfaces; `anyhow`
//! is used only at the binary edge (startup, listener bring-up).

use thiserror::Error;

/// Errors produced by the gateway, coordinator, relay client and executor.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Network/IO/timeout failure reaching an upstream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the LLM provider or a relay.
    #[error("upstream error ({status}): {excerpt}")]
    Upstream {
        /// HTTP status code returned by the upstream.
        status: u16,
        /// First bytes of the upstream error body.
        excerpt: String,
    },

    /// Gateway-level authentication failure.
    #[error("authentication failed")]
    Auth,

    /// Gateway queue or concurrency saturation.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Coordinator has no idle worker to dispatch to.
    #[error("no idle remote worker")]
    NoIdleWorker,

    /// Relay task submission was rejected or malformed.
    #[error("relay submit failed: {0}")]
    Submit(String),

    /// Relay result polling was malformed.
    #[error("relay poll failed: {0}")]
    Poll(String),

    /// The decomposition LLM call itself failed.
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    /// The aggregation LLM call itself failed.
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// Terminal swarm failure.
    #[error("swarm failed: {0}")]
    Swarm(String),
}

impl FabricError {
    /// Whether a gateway fallback chain may recover from this error.
    ///
    /// Retryable: HTTP 429/500/502/503/529 from the upstream, or any
    /// transport-level failure (timeouts included).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Upstream { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 529)
            }
            _ => false,
        }
    }

    /// Shorthand for a transport timeout.
    pub fn timeout() -> Self {
        Self::Transport("timeout".to_string())
    }
}

impl From<reqwest::Error> for FabricError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout()
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429u16, 500, 502, 503, 529] {
            let err = FabricError::Upstream {
                status,
                excerpt: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }

        let err = FabricError::Upstream {
            status: 401,
            excerpt: String::new(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_is_retryable() {
        assert!(FabricError::timeout().is_retryable());
        assert!(!FabricError::Auth.is_retryable());
        assert!(!FabricError::NoIdleWorker.is_retryable());
    }
}
