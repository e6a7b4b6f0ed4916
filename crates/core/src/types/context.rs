use bytes::Bytes;
use uuid::Uuid;

use super::chat::ChatCompletionRequest;
use super::decision::PolicyDecision;
use super::identity::AgentIdentity;

// =============================================================================
// Request Context
// =============================================================================

/// Everything the pipeline knows about one chat-completion call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation ID threaded through logs, events and the response header.
    pub correlation_id: String,
    pub identity: AgentIdentity,
    pub payload: ChatCompletionRequest,
    /// Original request body; forwarded upstream verbatim.
    pub raw_body: Bytes,
    /// Caller's `Authorization` header, used when no provider key is configured.
    pub upstream_authorization: Option<String>,
    /// Set once the policy engine has run.
    pub decision: Option<PolicyDecision>,
}

impl RequestContext {
    pub fn new(
        correlation_id: impl Into<String>,
        identity: AgentIdentity,
        payload: ChatCompletionRequest,
        raw_body: Bytes,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            identity,
            payload,
            raw_body,
            upstream_authorization: None,
            decision: None,
        }
    }

    /// Fresh correlation ID.
    pub fn new_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn with_upstream_authorization(mut self, value: Option<String>) -> Self {
        self.upstream_authorization = value;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.payload.is_streaming()
    }
}
