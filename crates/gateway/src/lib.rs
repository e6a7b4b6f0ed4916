#![deny(unused)]
//! HTTP gateway for the switchboard.
//!
//! This crate provides the OpenAI-compatible entry point: the axum server,
//! the governance pipeline wiring, the upstream forwarder and the response
//! relay.

pub mod forwarder;
pub mod pipeline;
pub mod relay;
pub mod server;

pub use forwarder::{HttpUpstream, UpstreamBody, UpstreamProvider, UpstreamRequest, UpstreamResponse};
pub use pipeline::{InboundRequest, Pipeline};
pub use relay::{relay, GuardedStream, REQUEST_ID_HEADER};
pub use server::{ApiError, AppState, GatewayConfig, GatewayServer};
