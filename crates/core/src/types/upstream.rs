use serde::{Deserialize, Serialize};

// =============================================================================
// Upstream Outcome
// =============================================================================

/// Classification of what the upstream provider did with a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatusClass {
    Success,
    AuthRejected,
    RateLimited,
    ServerError,
    /// Any other HTTP status; passed through unchanged.
    Other,
    /// No HTTP response was obtained.
    Unreachable,
}

impl UpstreamStatusClass {
    /// Classify an HTTP status returned by the provider.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            401 => Self::AuthRejected,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AuthRejected => "auth_rejected",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Other => "other",
            Self::Unreachable => "unreachable",
        }
    }
}
