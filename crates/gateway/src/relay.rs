//! Response relay: turns an upstream answer into the client response and
//! releases admission on every exit path.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};

use switchboard_core::Result;
use switchboard_governance::AdmissionGuard;

use crate::forwarder::{UpstreamBody, UpstreamResponse};

/// Response header carrying the correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-switchboard-request-id";

/// Upstream chunk stream that owns the admission guard.
///
/// The guard is dropped after the last chunk, on the first stream error, or
/// when the body is dropped because the client went away.
pub struct GuardedStream {
    inner: BoxStream<'static, Result<Bytes>>,
    guard: Option<AdmissionGuard>,
    correlation_id: String,
}

impl GuardedStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes>>,
        guard: AdmissionGuard,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            guard: Some(guard),
            correlation_id: correlation_id.into(),
        }
    }

    /// Whether the admission guard is still held.
    pub fn is_holding(&self) -> bool {
        self.guard.is_some()
    }
}

impl Stream for GuardedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.as_mut().poll_next(cx);
        match &poll {
            Poll::Ready(None) => {
                if let Some(guard) = self.guard.take() {
                    tracing::debug!(
                        correlation_id = %self.correlation_id,
                        held_ms = guard.held_for().as_millis() as u64,
                        "Stream finished"
                    );
                }
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(correlation_id = %self.correlation_id, error = %e, "Upstream stream failed");
                self.guard.take();
            }
            _ => {}
        }
        poll
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        if self.guard.is_some() {
            tracing::info!(correlation_id = %self.correlation_id, "Client disconnected mid-stream");
        }
    }
}

/// Build the client response. Buffered bodies release admission before
/// returning; streamed bodies hand the guard to the body.
pub fn relay(upstream: UpstreamResponse, guard: AdmissionGuard, correlation_id: &str) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.content_type.clone();

    let body = match upstream.body {
        UpstreamBody::Full(bytes) => {
            guard.release();
            Body::from(bytes)
        }
        UpstreamBody::Stream(stream) => Body::from_stream(GuardedStream::new(stream, guard, correlation_id)),
    };

    let mut response = (status, body).into_response();
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    with_request_id(response, correlation_id)
}

/// Attach the correlation ID header.
pub fn with_request_id(mut response: Response, correlation_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
