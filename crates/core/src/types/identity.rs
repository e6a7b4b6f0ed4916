use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

// =============================================================================
// Identity Headers
// =============================================================================

/// Organization credential header. Required.
pub const HEADER_ORG_TOKEN: &str = "x-switchboard-token";
/// Agent identifier header. Used for admission keys.
pub const HEADER_AGENT_ID: &str = "x-agent-id";
/// Human-friendly agent name. Advisory.
pub const HEADER_AGENT_NAME: &str = "x-agent-name";
/// Agent framework label. Advisory.
pub const HEADER_AGENT_FRAMEWORK: &str = "x-agent-framework";

pub const ANONYMOUS_AGENT: &str = "anonymous";
pub const UNKNOWN_LABEL: &str = "unknown";

/// Short, non-reversible fingerprint of a credential, safe for logs.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

// =============================================================================
// Identity Types
// =============================================================================

/// What a token registry knows about an organization token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgScope {
    /// Organization identifier.
    pub org_id: String,
    /// When set, only these agent ids may present the token.
    pub allowed_agents: Option<HashSet<String>>,
}

impl OrgScope {
    /// Scope with no agent restriction.
    pub fn open(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            allowed_agents: None,
        }
    }

    /// Whether `agent_id` may act under this scope.
    pub fn permits(&self, agent_id: &str) -> bool {
        self.allowed_agents
            .as_ref()
            .map_or(true, |agents| agents.contains(agent_id))
    }
}

/// Resolved caller identity. Lives for one request only.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Raw organization token.
    pub org_token: Secret<String>,
    /// Fingerprint of `org_token` for logs and events.
    pub token_fingerprint: String,
    /// Organization resolved from the registry.
    pub org_id: String,
    /// Agent identifier (defaults to `anonymous`).
    pub agent_id: String,
    /// Agent display name (advisory).
    pub agent_name: String,
    /// Agent framework (advisory).
    pub agent_framework: String,
}

impl AgentIdentity {
    /// Build an identity from an accepted token and the advisory headers.
    pub fn new(
        org_token: impl Into<String>,
        scope: &OrgScope,
        agent_id: Option<&str>,
        agent_name: Option<&str>,
        agent_framework: Option<&str>,
    ) -> Self {
        let org_token = org_token.into();
        Self {
            token_fingerprint: token_fingerprint(&org_token),
            org_token: Secret::new(org_token),
            org_id: scope.org_id.clone(),
            agent_id: non_empty(agent_id).unwrap_or(ANONYMOUS_AGENT).to_string(),
            agent_name: non_empty(agent_name).unwrap_or(UNKNOWN_LABEL).to_string(),
            agent_framework: non_empty(agent_framework).unwrap_or(UNKNOWN_LABEL).to_string(),
        }
    }

    /// Expose the raw token. Never log the result.
    pub fn token(&self) -> &str {
        self.org_token.expose_secret()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Serializable view of an identity without the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub org_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub agent_framework: String,
}

impl From<&AgentIdentity> for AgentSummary {
    fn from(identity: &AgentIdentity) -> Self {
        Self {
            org_id: identity.org_id.clone(),
            agent_id: identity.agent_id.clone(),
            agent_name: identity.agent_name.clone(),
            agent_framework: identity.agent_framework.clone(),
        }
    }
}
