#![deny(unused)]
//! Governance layer for the switchboard.
//!
//! This crate provides:
//! - Identity resolution against a token registry
//! - Content policy (PII and destructive-statement firewall, shadow mode)
//! - Per-agent admission control
//! - Observability sinks, structured logging and metrics

pub mod admission;
pub mod audit;
pub mod detectors;
pub mod identity;
pub mod metrics;
pub mod policy;
pub mod tracing_layer;

pub use admission::{AdmissionController, AdmissionGuard};
pub use audit::{EventFilter, FanoutEmitter, InMemoryEventSink, TracingEventEmitter};
pub use detectors::{DestructiveMatcher, PiiPattern};
pub use identity::{
    registry_from_config, IdentityHeaders, IdentityResolver, PermissiveTokenRegistry,
    StaticTokenRegistry, TokenRegistry,
};
pub use metrics::{setup_metrics_recorder, track_request, track_upstream};
pub use policy::{Matcher, PolicyEngine, PolicyFile, PolicyRule, RuleSpec};
pub use tracing_layer::configure_tracing;
