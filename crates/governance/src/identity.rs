//! Identity resolution: organization token validation and agent headers.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;

use switchboard_core::{
    config::{AuthConfig, AuthMode},
    types::{token_fingerprint, AgentIdentity, OrgScope},
    Error, Result,
};

/// Registry mapping organization tokens to their scope.
///
/// Loaded once at boot and shared read-only; lookups never mutate it.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Return the scope for `token`, or `None` when it is not recognized.
    async fn lookup(&self, token: &str) -> Result<Option<OrgScope>>;
}

/// Registry backed by tokens listed in configuration.
#[derive(Debug, Default)]
pub struct StaticTokenRegistry {
    tokens: HashMap<String, OrgScope>,
}

impl StaticTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token (builder style).
    pub fn with_token(mut self, token: impl Into<String>, scope: OrgScope) -> Self {
        self.tokens.insert(token.into(), scope);
        self
    }

    /// Build from the `auth.tokens` configuration list.
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| {
                let scope = OrgScope {
                    org_id: entry.org_id.clone(),
                    allowed_agents: entry
                        .allowed_agents
                        .as_ref()
                        .map(|agents| agents.iter().cloned().collect()),
                };
                (entry.token.expose_secret().clone(), scope)
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenRegistry for StaticTokenRegistry {
    async fn lookup(&self, token: &str) -> Result<Option<OrgScope>> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// Accepts any non-empty token (for development/demos).
///
/// Each distinct token becomes its own organization, named after the token's
/// fingerprint, so admission keys still separate callers.
pub struct PermissiveTokenRegistry;

#[async_trait]
impl TokenRegistry for PermissiveTokenRegistry {
    async fn lookup(&self, token: &str) -> Result<Option<OrgScope>> {
        Ok(Some(OrgScope::open(format!("org-{}", token_fingerprint(token)))))
    }
}

/// Build the registry selected by `auth.mode`.
pub fn registry_from_config(config: &AuthConfig) -> Arc<dyn TokenRegistry> {
    match config.mode {
        AuthMode::Static => {
            let registry = StaticTokenRegistry::from_config(config);
            tracing::info!(tokens = registry.len(), "Using static token registry");
            Arc::new(registry)
        }
        AuthMode::Permissive => {
            tracing::warn!("Using PermissiveTokenRegistry - NOT SUITABLE FOR PRODUCTION");
            Arc::new(PermissiveTokenRegistry)
        }
    }
}

/// Raw identity header values as received.
///
/// `None` means the header was absent or not valid UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHeaders<'a> {
    pub org_token: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub agent_name: Option<&'a str>,
    pub agent_framework: Option<&'a str>,
}

/// First pipeline stage: turns headers into an [`AgentIdentity`].
#[derive(Clone)]
pub struct IdentityResolver {
    registry: Arc<dyn TokenRegistry>,
}

impl IdentityResolver {
    pub fn new(registry: Arc<dyn TokenRegistry>) -> Self {
        Self { registry }
    }

    /// Validate the organization token and collect advisory agent headers.
    ///
    /// # Errors
    /// [`Error::Auth`] when the token is missing, blank, unknown, or not
    /// permitted for the presented agent id.
    pub async fn resolve(&self, headers: IdentityHeaders<'_>) -> Result<AgentIdentity> {
        let token = headers
            .org_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::auth("missing X-Switchboard-Token header"))?;

        let scope = self.registry.lookup(token).await?.ok_or_else(|| {
            tracing::warn!(token_fp = %token_fingerprint(token), "Unrecognized organization token");
            Error::auth("invalid organization token")
        })?;

        let identity = AgentIdentity::new(
            token,
            &scope,
            headers.agent_id,
            headers.agent_name,
            headers.agent_framework,
        );

        if !scope.permits(&identity.agent_id) {
            tracing::warn!(
                org_id = %identity.org_id,
                agent_id = %identity.agent_id,
                "Agent not permitted for organization token"
            );
            return Err(Error::auth("agent is not permitted for this organization token"));
        }

        tracing::debug!(
            org_id = %identity.org_id,
            agent_id = %identity.agent_id,
            token_fp = %identity.token_fingerprint,
            "Identity resolved"
        );

        Ok(identity)
    }
}
