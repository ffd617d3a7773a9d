//! Error types for the Code Assist gate.
//!
//! The taxonomy mirrors how failures propagate through the pipeline:
//! transient network and rate-limit failures are retried internally by the
//! retry engine, terminal failures surface to the caller with actionable
//! detail, and nothing escapes as a panic across the public boundary.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the gate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential record carries no refresh token; the caller must log in.
    #[error("credential has no refresh token")]
    MissingRefreshToken,

    /// The refresh token was revoked by the authorization server.
    ///
    /// The stored credential has been cleared; the caller must re-login.
    #[error("refresh token revoked, re-login required")]
    TokenRevoked,

    /// Token refresh failed for a reason other than revocation.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The current tier requires an explicitly configured project id.
    #[error("a project id must be configured for this account's tier")]
    ProjectIdRequired,

    /// Project resolution failed against the backend.
    #[error("could not resolve project (status {status}): {message}")]
    ProjectResolve {
        /// Upstream HTTP status for diagnostics.
        status: u16,
        /// Upstream message.
        message: String,
    },

    /// An authorization code was replayed after a prior successful exchange.
    #[error("authorization code already submitted")]
    CodeAlreadyUsed,

    /// OAuth code exchange failed.
    #[error("code exchange failed: {0}")]
    ExchangeFailed(String),

    /// Transport-level failure (connect, timeout, TLS, DNS).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Payload could not be parsed as JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential storage failure.
    #[error("auth store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this is a transport-level failure worth retrying.
    ///
    /// Covers connection failures, timeouts, and request-building failures
    /// that reqwest reports before a response arrives.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_failed_display() {
        let err = Error::RefreshFailed("HTTP 500: boom".into());
        assert_eq!(err.to_string(), "token refresh failed: HTTP 500: boom");
    }

    #[test]
    fn test_project_resolve_display() {
        let err = Error::ProjectResolve {
            status: 500,
            message: "backend down".into(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("backend down"));
    }

    #[test]
    fn test_non_network_errors_not_transient() {
        assert!(!Error::MissingRefreshToken.is_transient());
        assert!(!Error::TokenRevoked.is_transient());
        assert!(!Error::config("bad endpoint").is_transient());
    }
}
