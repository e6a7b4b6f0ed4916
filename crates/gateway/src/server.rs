//! Axum-based HTTP server for the gateway.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Json, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use switchboard_core::{
    config::ServerConfig,
    events::EventEnvelope,
    types::{
        RequestContext, HEADER_AGENT_FRAMEWORK, HEADER_AGENT_ID, HEADER_AGENT_NAME,
        HEADER_ORG_TOKEN,
    },
    Error, Result,
};
use switchboard_governance::{track_request, EventFilter, IdentityHeaders, InMemoryEventSink};

use crate::pipeline::{InboundRequest, Pipeline};
use crate::relay::with_request_id;

/// Default and maximum page size for the events feed.
const DEFAULT_EVENTS_LIMIT: usize = 100;
const MAX_EVENTS_LIMIT: usize = 1000;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
            enable_tracing: config.enable_tracing,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Shared application state.
pub struct AppState {
    /// Governance pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Recent events for the dashboard feed (optional).
    pub events: Option<Arc<InMemoryEventSink>>,
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    pipeline: Arc<Pipeline>,
    events: Option<Arc<InMemoryEventSink>>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(config: GatewayConfig, pipeline: Pipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            events: None,
            metrics_handle: None,
        }
    }

    /// Expose the in-memory event buffer on `/v1/switchboard/events`.
    pub fn with_events(mut self, sink: Arc<InMemoryEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState {
            pipeline: self.pipeline.clone(),
            events: self.events.clone(),
        });
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/chat/completions", post(chat_completions_handler))
            .route("/v1/switchboard/events", get(events_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .with_state(state);

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Switchboard listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status.
    pub status: String,
    /// Version.
    pub version: String,
    /// Requests currently holding admission.
    pub in_flight: usize,
    /// Active policy version.
    pub policy_version: String,
}

/// Query for the events feed.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub agent_id: Option<String>,
}

/// Events feed response.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventEnvelope>,
}

/// OpenAI-compatible error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub message: String,
    /// Error category.
    #[serde(rename = "type")]
    pub kind: String,
    /// Stable machine-readable code.
    pub code: String,
    /// Correlation ID.
    pub request_id: String,
    /// Rule behind a policy block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// That rule's own reporting code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_code: Option<String>,
}

/// A pipeline error bound to the request it failed.
#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: Error, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::PolicyViolation { .. } => StatusCode::FORBIDDEN,
            Error::AdmissionConflict { .. } => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Serialization(_) | Error::Internal(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match &self.error {
            Error::Auth(_) => "authentication_error",
            Error::PolicyViolation { .. } => "policy_violation",
            Error::AdmissionConflict { .. } => "resource_locked",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::UpstreamUnreachable(_) => "upstream_error",
            _ => "server_error",
        }
    }

    fn message(&self) -> String {
        match &self.error {
            // Matched text stays in the event log, never in the response.
            Error::PolicyViolation { rule_id, .. } => {
                format!("Request blocked by firewall rule '{}'", rule_id)
            }
            Error::Config(_) | Error::Serialization(_) | Error::Internal(_) | Error::Other(_) => {
                "Internal gateway error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, error = %self.error, "Request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                message: self.message(),
                kind: self.kind().to_string(),
                code: self.error.code().to_string(),
                request_id: self.request_id.clone(),
                rule_id: match &self.error {
                    Error::PolicyViolation { rule_id, .. } => Some(rule_id.clone()),
                    _ => None,
                },
                rule_code: self.error.rule_code().map(str::to_string),
            },
        };
        with_request_id((status, Json(body)).into_response(), &self.request_id)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler. Never touches the upstream.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        in_flight: state.pipeline.admission().in_flight(),
        policy_version: state.pipeline.policy().version().to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Chat completions handler.
async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = RequestContext::new_correlation_id();
    let started = Instant::now();

    let inbound = InboundRequest {
        identity: IdentityHeaders {
            org_token: header_str(&headers, HEADER_ORG_TOKEN),
            agent_id: header_str(&headers, HEADER_AGENT_ID),
            agent_name: header_str(&headers, HEADER_AGENT_NAME),
            agent_framework: header_str(&headers, HEADER_AGENT_FRAMEWORK),
        },
        authorization: header_str(&headers, header::AUTHORIZATION.as_str()),
        body: &body,
    };

    let (response, outcome) = match state.pipeline.handle(&correlation_id, inbound).await {
        Ok(response) => (response, "forwarded"),
        Err(error) => {
            let outcome = match &error {
                Error::Auth(_) => "unauthorized",
                Error::PolicyViolation { .. } => "blocked",
                Error::AdmissionConflict { .. } => "locked",
                Error::InvalidRequest(_) => "invalid",
                Error::UpstreamUnreachable(_) => "unreachable",
                _ => "error",
            };
            (ApiError::new(error, correlation_id.as_str()).into_response(), outcome)
        }
    };

    track_request(outcome, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Recent events handler, newest first.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(sink) = &state.events else {
        return (StatusCode::NOT_FOUND, "event feed disabled").into_response();
    };
    let filter = EventFilter {
        agent_id: query.agent_id,
        limit: Some(query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT).min(MAX_EVENTS_LIMIT)),
        ..Default::default()
    };
    Json(EventsResponse {
        events: sink.query(&filter),
    })
    .into_response()
}
