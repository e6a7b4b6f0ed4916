use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured event envelope delivered to the observability sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: String,
    /// Correlation ID of the request that produced the event
    pub correlation_id: String,
    /// Organization the caller belongs to
    pub org_id: Option<String>,
    /// Agent that triggered the event
    pub agent_id: String,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type category
    pub event_type: EventType,
    /// Event severity level
    pub severity: EventSeverity,
    /// Structured payload (event-specific data)
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: String::new(),
            org_id: None,
            agent_id: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    pub fn with_org(mut self, org_id: &str) -> Self {
        self.org_id = Some(org_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = agent_id.to_string();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Request authenticated and accepted for evaluation
    RequestReceived,
    /// Authentication rejected
    AuthRejected,
    /// Policy evaluated with no blocking match
    PolicyAllowed,
    /// A shadow-mode rule matched; request continued
    PolicyShadowMatch,
    /// Policy blocked the request
    PolicyBlocked,
    /// Admission lock acquired
    AdmissionGranted,
    /// Admission denied because the key was held
    AdmissionDenied,
    /// Admission lock released
    AdmissionReleased,
    /// Upstream answered with an HTTP response
    UpstreamCompleted,
    /// Upstream could not be reached
    UpstreamFailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// Helper structs for common payloads

#[derive(Serialize, Deserialize)]
pub struct PolicyEventPayload {
    pub outcome: String,
    pub rule_id: Option<String>,
    pub rule_kind: Option<String>,
    pub code: Option<String>,
    pub matched_rules: Vec<String>,
    /// Truncated matched text. Only present on shadow events.
    pub evidence: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct AdmissionEventPayload {
    pub key: String,
    pub held_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct UpstreamEventPayload {
    pub status: Option<u16>,
    pub outcome: String,
    pub duration_ms: u64,
    pub streaming: bool,
    pub error: Option<String>,
}
