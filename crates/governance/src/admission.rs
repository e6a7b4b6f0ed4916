//! Per-agent admission control.
//!
//! Each agent key owns a single-permit semaphore in a sharded table. The
//! shard lock is only taken to look up or prune an entry, never for the time a
//! request holds its permit, so unrelated agents do not serialize each other.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use switchboard_core::{
    config::{AdmissionConfig, AdmissionKeyScope, AdmissionMode},
    events::{AdmissionEventPayload, EventEnvelope, EventSeverity, EventType},
    traits::{EventEmitter, NoOpEventEmitter},
    types::AgentIdentity,
    Error, Result,
};

use crate::metrics::{track_admission, track_in_flight};

type LockTable = DashMap<String, Arc<Semaphore>>;

/// Who is asking, for events and logs.
#[derive(Debug, Clone, Default)]
struct Origin {
    correlation_id: String,
    org_id: Option<String>,
    agent_id: String,
}

impl Origin {
    fn event(&self, event_type: EventType, payload: AdmissionEventPayload) -> EventEnvelope {
        let mut event = EventEnvelope::new(
            event_type,
            serde_json::to_value(payload).unwrap_or_default(),
        )
        .with_correlation(&self.correlation_id)
        .with_agent(&self.agent_id);
        if let Some(org) = &self.org_id {
            event = event.with_org(org);
        }
        event
    }
}

/// Reference to a key's semaphore that prunes the table entry when dropped.
struct KeyHandle {
    key: String,
    semaphore: Option<Arc<Semaphore>>,
    table: Arc<LockTable>,
}

impl KeyHandle {
    fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.clone()
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        drop(self.semaphore.take());
        // Only the table's own reference left: nobody holds or waits on this key.
        self.table
            .remove_if(&self.key, |_, sem| Arc::strong_count(sem) == 1);
    }
}

/// Exclusive admission for one agent key. Released exactly once, on drop.
pub struct AdmissionGuard {
    permit: Option<OwnedSemaphorePermit>,
    // Declared after `permit` so the permit is gone before the entry is pruned.
    handle: KeyHandle,
    acquired_at: Instant,
    in_flight: Arc<AtomicUsize>,
    emitter: Arc<dyn EventEmitter>,
    origin: Origin,
}

impl AdmissionGuard {
    pub fn key(&self) -> &str {
        &self.handle.key
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release now. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("key", &self.handle.key)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.permit.take().is_none() {
            return;
        }
        let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        track_in_flight(remaining);

        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        tracing::debug!(
            key = %self.handle.key,
            correlation_id = %self.origin.correlation_id,
            held_ms,
            "Admission released"
        );

        // Drop cannot await; hand the event to the runtime when one is running.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let emitter = self.emitter.clone();
            let event = self.origin.event(
                EventType::AdmissionReleased,
                AdmissionEventPayload {
                    key: self.handle.key.clone(),
                    held_ms: Some(held_ms),
                },
            );
            runtime.spawn(async move { emitter.emit(event).await });
        }
    }
}

/// Grants at most one in-flight request per agent key.
pub struct AdmissionController {
    table: Arc<LockTable>,
    mode: AdmissionMode,
    wait_timeout: Duration,
    key_scope: AdmissionKeyScope,
    in_flight: Arc<AtomicUsize>,
    emitter: Arc<dyn EventEmitter>,
}

impl AdmissionController {
    /// Create a controller. The table starts empty.
    pub fn new(config: &AdmissionConfig) -> Self {
        tracing::info!(
            mode = ?config.mode,
            wait_timeout_ms = config.wait_timeout_ms,
            key_scope = ?config.key_scope,
            "Admission controller initialized"
        );
        Self {
            table: Arc::new(DashMap::new()),
            mode: config.mode,
            wait_timeout: config.wait_timeout(),
            key_scope: config.key_scope,
            in_flight: Arc::new(AtomicUsize::new(0)),
            emitter: Arc::new(NoOpEventEmitter),
        }
    }

    /// Set the observability sink.
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    /// Admission key for an identity under the configured scope.
    ///
    /// Org-scoped keys are `<org>/<agent>` with `%` and `/` escaped in the org
    /// part, so the first `/` always separates the two and distinct pairs
    /// never share a key.
    pub fn key_for(&self, identity: &AgentIdentity) -> String {
        match self.key_scope {
            AdmissionKeyScope::Agent => identity.agent_id.clone(),
            AdmissionKeyScope::OrgAgent => {
                format!("{}/{}", escape_org(&identity.org_id), identity.agent_id)
            }
        }
    }

    /// Acquire admission for a resolved identity.
    ///
    /// # Errors
    /// [`Error::AdmissionConflict`] when the key is held (immediately, or after
    /// the configured wait in bounded-wait mode).
    pub async fn acquire(&self, identity: &AgentIdentity, correlation_id: &str) -> Result<AdmissionGuard> {
        let origin = Origin {
            correlation_id: correlation_id.to_string(),
            org_id: Some(identity.org_id.clone()),
            agent_id: identity.agent_id.clone(),
        };
        self.acquire_inner(self.key_for(identity), origin).await
    }

    /// Acquire admission for a raw key.
    pub async fn acquire_key(&self, key: &str, correlation_id: &str) -> Result<AdmissionGuard> {
        let origin = Origin {
            correlation_id: correlation_id.to_string(),
            org_id: None,
            agent_id: key.to_string(),
        };
        self.acquire_inner(key.to_string(), origin).await
    }

    async fn acquire_inner(&self, key: String, origin: Origin) -> Result<AdmissionGuard> {
        let handle = self.handle_for(&key);
        let semaphore = handle
            .semaphore()
            .ok_or_else(|| Error::internal("admission handle without semaphore"))?;

        let permit = match self.mode {
            AdmissionMode::Immediate => match semaphore.try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => None,
                Err(TryAcquireError::Closed) => {
                    return Err(Error::internal("admission semaphore closed"));
                }
            },
            AdmissionMode::BoundedWait => {
                match tokio::time::timeout(self.wait_timeout, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(Error::internal("admission semaphore closed")),
                    Err(_) => None,
                }
            }
        };

        let Some(permit) = permit else {
            tracing::info!(
                key = %key,
                correlation_id = %origin.correlation_id,
                mode = ?self.mode,
                "Admission denied: key already held"
            );
            track_admission("denied");
            self.emitter
                .emit(
                    origin
                        .event(
                            EventType::AdmissionDenied,
                            AdmissionEventPayload {
                                key: key.clone(),
                                held_ms: None,
                            },
                        )
                        .with_severity(EventSeverity::Warning),
                )
                .await;
            return Err(Error::admission_conflict(key));
        };

        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        track_in_flight(current);
        track_admission("granted");
        tracing::debug!(key = %key, correlation_id = %origin.correlation_id, "Admission granted");

        self.emitter
            .emit(origin.event(
                EventType::AdmissionGranted,
                AdmissionEventPayload {
                    key: key.clone(),
                    held_ms: None,
                },
            ))
            .await;

        Ok(AdmissionGuard {
            permit: Some(permit),
            handle,
            acquired_at: Instant::now(),
            in_flight: self.in_flight.clone(),
            emitter: self.emitter.clone(),
            origin,
        })
    }

    fn handle_for(&self, key: &str) -> KeyHandle {
        let semaphore = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        KeyHandle {
            key: key.to_string(),
            semaphore: Some(semaphore),
            table: self.table.clone(),
        }
    }

    /// Whether a request currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .get(key)
            .map(|sem| sem.available_permits() == 0)
            .unwrap_or(false)
    }

    /// Requests currently holding admission, across all keys.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Keys with a holder or waiter.
    pub fn tracked_keys(&self) -> usize {
        self.table.len()
    }
}

fn escape_org(org_id: &str) -> String {
    org_id.replace('%', "%25").replace('/', "%2F")
}
