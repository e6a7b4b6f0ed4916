//! The request-governance pipeline.
//!
//! Identity → Policy → Admission → Upstream → Relay. Each stage may
//! short-circuit with an [`Error`]; translation to HTTP happens in the server.

use axum::response::Response;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use switchboard_core::{
    events::{
        EventEnvelope, EventSeverity, EventType, PolicyEventPayload, UpstreamEventPayload,
    },
    traits::{EventEmitter, NoOpEventEmitter},
    types::{
        AgentSummary, ChatCompletionRequest, PolicyDecision, PolicyOutcome, RequestContext,
        RuleAction,
    },
    Error, Result,
};
use switchboard_governance::{
    metrics::track_upstream, AdmissionController, IdentityHeaders, IdentityResolver, PolicyEngine,
};

use crate::forwarder::{UpstreamProvider, UpstreamRequest};
use crate::relay::relay;

/// Raw inbound call as extracted from HTTP.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub identity: IdentityHeaders<'a>,
    /// Caller's `Authorization` header.
    pub authorization: Option<&'a str>,
    pub body: &'a Bytes,
}

/// Shared, immutable stage wiring. Built once at boot.
pub struct Pipeline {
    resolver: IdentityResolver,
    policy: Arc<PolicyEngine>,
    admission: Arc<AdmissionController>,
    upstream: Arc<dyn UpstreamProvider>,
    emitter: Arc<dyn EventEmitter>,
}

impl Pipeline {
    pub fn new(
        resolver: IdentityResolver,
        policy: Arc<PolicyEngine>,
        admission: Arc<AdmissionController>,
        upstream: Arc<dyn UpstreamProvider>,
    ) -> Self {
        Self {
            resolver,
            policy,
            admission,
            upstream,
            emitter: Arc::new(NoOpEventEmitter),
        }
    }

    /// Set the observability sink for pipeline events.
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Run one chat-completion call through every stage.
    pub async fn handle(&self, correlation_id: &str, inbound: InboundRequest<'_>) -> Result<Response> {
        let identity = match self.resolver.resolve(inbound.identity).await {
            Ok(identity) => identity,
            Err(e) => {
                self.emitter
                    .emit(
                        EventEnvelope::new(
                            EventType::AuthRejected,
                            serde_json::json!({ "reason": e.to_string() }),
                        )
                        .with_correlation(correlation_id)
                        .with_agent(inbound.identity.agent_id.unwrap_or("anonymous"))
                        .with_severity(EventSeverity::Warning),
                    )
                    .await;
                return Err(e);
            }
        };

        let payload = ChatCompletionRequest::from_slice(inbound.body)?;
        let mut ctx = RequestContext::new(correlation_id, identity, payload, inbound.body.clone())
            .with_upstream_authorization(inbound.authorization.map(str::to_string));

        tracing::info!(
            correlation_id = %ctx.correlation_id,
            org_id = %ctx.identity.org_id,
            agent_id = %ctx.identity.agent_id,
            token_fp = %ctx.identity.token_fingerprint,
            model = %ctx.payload.model,
            messages = ctx.payload.messages.len(),
            stream = ctx.is_streaming(),
            "Chat completion received"
        );
        self.emit(
            &ctx,
            EventType::RequestReceived,
            EventSeverity::Debug,
            serde_json::json!({
                "agent": AgentSummary::from(&ctx.identity),
                "model": ctx.payload.model,
                "stream": ctx.is_streaming(),
            }),
        )
        .await;

        let decision = self.policy.evaluate_request(&ctx.payload);
        self.report_decision(&ctx, &decision).await;
        if let (true, Some(rule)) = (decision.is_blocked(), decision.triggered.as_ref()) {
            tracing::warn!(
                correlation_id = %ctx.correlation_id,
                agent_id = %ctx.identity.agent_id,
                rule_id = %rule.id,
                "Request blocked by firewall"
            );
            return Err(Error::policy_violation(rule.id.clone(), rule.code.clone()));
        }
        ctx.decision = Some(decision);

        let guard = self.admission.acquire(&ctx.identity, &ctx.correlation_id).await?;

        let started = Instant::now();
        let streaming = ctx.is_streaming();
        let result = self
            .upstream
            .send(UpstreamRequest {
                correlation_id: ctx.correlation_id.clone(),
                body: ctx.raw_body.clone(),
                authorization: ctx.upstream_authorization.clone(),
                streaming,
            })
            .await;
        let elapsed = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    correlation_id = %ctx.correlation_id,
                    agent_id = %ctx.identity.agent_id,
                    error = %e,
                    "Upstream call failed"
                );
                track_upstream("unreachable", elapsed.as_secs_f64());
                self.emit(
                    &ctx,
                    EventType::UpstreamFailed,
                    EventSeverity::Error,
                    to_value(UpstreamEventPayload {
                        status: None,
                        outcome: "unreachable".to_string(),
                        duration_ms: elapsed.as_millis() as u64,
                        streaming,
                        error: Some(e.to_string()),
                    }),
                )
                .await;
                // `guard` drops here.
                return Err(e);
            }
        };

        let class = response.class();
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            agent_id = %ctx.identity.agent_id,
            status = response.status,
            outcome = class.as_str(),
            duration_ms = elapsed.as_millis() as u64,
            "Upstream responded"
        );
        track_upstream(class.as_str(), elapsed.as_secs_f64());
        self.emit(
            &ctx,
            EventType::UpstreamCompleted,
            EventSeverity::Info,
            to_value(UpstreamEventPayload {
                status: Some(response.status),
                outcome: class.as_str().to_string(),
                duration_ms: elapsed.as_millis() as u64,
                streaming,
                error: None,
            }),
        )
        .await;

        Ok(relay(response, guard, &ctx.correlation_id))
    }

    async fn report_decision(&self, ctx: &RequestContext, decision: &PolicyDecision) {
        let matched_rules = decision.matched_rule_ids();

        for m in decision.matches.iter().filter(|m| m.action == RuleAction::ShadowLog) {
            tracing::warn!(
                correlation_id = %ctx.correlation_id,
                agent_id = %ctx.identity.agent_id,
                rule_id = %m.rule.id,
                "Shadow rule matched; request allowed"
            );
            self.emit(
                ctx,
                EventType::PolicyShadowMatch,
                EventSeverity::Warning,
                to_value(PolicyEventPayload {
                    outcome: PolicyOutcome::ShadowAllow.as_str().to_string(),
                    rule_id: Some(m.rule.id.clone()),
                    rule_kind: Some(m.rule.kind.as_str().to_string()),
                    code: Some(m.rule.code.clone()),
                    matched_rules: matched_rules.clone(),
                    evidence: Some(m.evidence.clone()),
                }),
            )
            .await;
        }

        let (event_type, severity) = match decision.outcome {
            PolicyOutcome::Block => (EventType::PolicyBlocked, EventSeverity::Warning),
            PolicyOutcome::Allow => (EventType::PolicyAllowed, EventSeverity::Debug),
            // Already reported per match.
            PolicyOutcome::ShadowAllow => return,
        };
        let triggered = decision.triggered.as_ref();
        self.emit(
            ctx,
            event_type,
            severity,
            to_value(PolicyEventPayload {
                outcome: decision.outcome.as_str().to_string(),
                rule_id: triggered.map(|r| r.id.clone()),
                rule_kind: triggered.map(|r| r.kind.as_str().to_string()),
                code: triggered.map(|r| r.code.clone()),
                matched_rules,
                evidence: None,
            }),
        )
        .await;
    }

    async fn emit(
        &self,
        ctx: &RequestContext,
        event_type: EventType,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) {
        self.emitter
            .emit(
                EventEnvelope::new(event_type, payload)
                    .with_correlation(&ctx.correlation_id)
                    .with_org(&ctx.identity.org_id)
                    .with_agent(&ctx.identity.agent_id)
                    .with_severity(severity),
            )
            .await;
    }
}

fn to_value<T: serde::Serialize>(payload: T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_default()
}
