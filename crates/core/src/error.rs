//! Error types for the switchboard.

use thiserror::Error;

use crate::types::BLOCKED_BY_FIREWALL;

/// Result type alias using the switchboard's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the switchboard.
///
/// Every stage of the governance pipeline returns one of these. Translation to
/// an HTTP status and envelope happens only at the gateway boundary.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Identity Errors
    // =========================================================================
    #[error("Authentication failed: {0}")]
    Auth(String),

    // =========================================================================
    // Policy Errors
    // =========================================================================
    #[error("Request blocked by policy rule '{rule_id}'")]
    PolicyViolation {
        /// Rule that produced the block.
        rule_id: String,
        /// Stable reporting code of that rule.
        code: String,
    },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Agent '{key}' already has a request in flight")]
    AdmissionConflict { key: String },

    // =========================================================================
    // Upstream Errors
    // =========================================================================
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a policy violation error.
    pub fn policy_violation(rule_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::PolicyViolation {
            rule_id: rule_id.into(),
            code: code.into(),
        }
    }

    /// Create an admission conflict error.
    pub fn admission_conflict(key: impl Into<String>) -> Self {
        Self::AdmissionConflict { key: key.into() }
    }

    /// Create an upstream unreachable error.
    pub fn upstream_unreachable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnreachable(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error.
    ///
    /// Client SDKs surface the response body verbatim, so automated callers
    /// branch on this value rather than on the message text.
    /// Every policy block reports `BLOCKED_BY_FIREWALL`; the rule's own
    /// code is available from [`Error::rule_code`].
    pub fn code(&self) -> &str {
        match self {
            Self::Auth(_) => "UNAUTHORIZED",
            Self::PolicyViolation { .. } => BLOCKED_BY_FIREWALL,
            Self::AdmissionConflict { .. } => "RESOURCE_LOCKED",
            Self::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) | Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Reporting code of the rule behind a policy block.
    pub fn rule_code(&self) -> Option<&str> {
        match self {
            Self::PolicyViolation { code, .. } => Some(code),
            _ => None,
        }
    }
}
