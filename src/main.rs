#![deny(unused)]
//! Agent Switchboard - governance gateway for autonomous agents.
//!
//! Sits between agent clients and an OpenAI-compatible provider and enforces
//! identity, content policy and per-agent admission before any request is
//! forwarded upstream.

use std::sync::Arc;

use switchboard_core::{config::SwitchboardConfig, traits::EventEmitter};
use switchboard_gateway::{GatewayConfig, GatewayServer, HttpUpstream, Pipeline};
use switchboard_governance::{
    registry_from_config, AdmissionController, FanoutEmitter, IdentityResolver,
    InMemoryEventSink, PolicyEngine, TracingEventEmitter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SwitchboardConfig::load()?;

    // Initialize tracing
    switchboard_governance::configure_tracing(&config.observability)?;

    tracing::info!(
        environment = %config.environment,
        "Starting Agent Switchboard v{}",
        env!("CARGO_PKG_VERSION")
    );

    config.validate()?;

    // =========================================================================
    // Observability: event sinks
    // =========================================================================
    let events = Arc::new(InMemoryEventSink::new(config.observability.event_buffer));
    let emitter: Arc<dyn EventEmitter> = Arc::new(
        FanoutEmitter::new()
            .add(events.clone())
            .add(Arc::new(TracingEventEmitter)),
    );

    // =========================================================================
    // Governance stages
    // =========================================================================
    let resolver = IdentityResolver::new(registry_from_config(&config.auth));

    let policy = Arc::new(PolicyEngine::from_config(&config.policy)?);
    tracing::info!(
        rules = policy.rules().len(),
        version = %policy.version(),
        shadow_mode = config.policy.shadow_mode,
        "Policy engine initialized"
    );

    let admission = Arc::new(AdmissionController::new(&config.admission).with_emitter(emitter.clone()));

    let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);

    let pipeline = Pipeline::new(resolver, policy, admission, upstream).with_emitter(emitter);

    // =========================================================================
    // Print startup banner
    // =========================================================================
    let gateway_config = GatewayConfig::from(&config.server);
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 Agent Switchboard v{:<26}║", env!("CARGO_PKG_VERSION"));
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Endpoints:                                                  ║");
    println!("║    GET  /health                 - Health check               ║");
    println!("║    POST /v1/chat/completions    - Governed chat completions  ║");
    println!("║    GET  /v1/switchboard/events  - Recent governance events   ║");
    println!("║    GET  /metrics                - Prometheus metrics         ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Upstream: {:<50}║", config.upstream.base_url);
    println!("║  Admission: {:<49}║", format!("{:?}", config.admission.mode));
    println!("║  Server: http://{:<45}║", format!("{}:{}", gateway_config.host, gateway_config.port));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // =========================================================================
    // Start the server
    // =========================================================================
    let mut server = GatewayServer::new(gateway_config, pipeline).with_events(events);

    if config.observability.metrics_enabled {
        let metrics_handle = switchboard_governance::setup_metrics_recorder()?;
        server = server.with_metrics(metrics_handle);
    }

    server.run().await?;

    Ok(())
}
