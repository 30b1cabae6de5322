//! Health registry.
//!
//! Tracks a serving state per named service plus an overall entry under the
//! empty name [`OVERALL`]. Transports publish the registry to clients by
//! attaching a [`HealthSink`]; every change is pushed to all attached sinks.
//!
//! Once [`HealthRegistry::shutdown_all`] has run, no service can go back to
//! `Serving`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Name under which the overall server health is reported.
pub const OVERALL: &str = "";

/// Serving state of a single service.
///
/// Ordered by progression: a service is registered, serves, drains, stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServingState {
    /// Never set.
    Unknown,
    NotServing,
    Serving,
    /// Shutting down; in-flight calls are still completing.
    Draining,
    Stopped,
}

impl ServingState {
    pub fn is_serving(self) -> bool {
        self == ServingState::Serving
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServingState::Unknown => "UNKNOWN",
            ServingState::NotServing => "NOT_SERVING",
            ServingState::Serving => "SERVING",
            ServingState::Draining => "DRAINING",
            ServingState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for ServingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every health change so it can be exposed to clients.
pub trait HealthSink: Send + Sync + 'static {
    fn publish(&self, service: &str, state: ServingState) -> impl Future<Output = ()> + Send;
}

/// Object-safe version of [`HealthSink`] (internal use).
#[doc(hidden)]
pub trait HealthSinkErased: Send + Sync {
    fn publish<'a>(
        &'a self,
        service: &'a str,
        state: ServingState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T: HealthSink> HealthSinkErased for T {
    fn publish<'a>(
        &'a self,
        service: &'a str,
        state: ServingState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(HealthSink::publish(self, service, state))
    }
}

struct Inner {
    statuses: RwLock<BTreeMap<String, ServingState>>,
    sinks: RwLock<Vec<Arc<dyn HealthSinkErased>>>,
    shut_down: AtomicBool,
}

/// Shared, cloneable handle to the per-service health table.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("statuses", &self.snapshot())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                statuses: RwLock::new(BTreeMap::new()),
                sinks: RwLock::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a sink. It immediately receives the current table, then every
    /// later change.
    pub async fn attach<S: HealthSink>(&self, sink: S) {
        let sink: Arc<dyn HealthSinkErased> = Arc::new(sink);
        let current = {
            let mut sinks = self.inner.sinks.write().unwrap_or_else(|e| e.into_inner());
            sinks.push(sink.clone());
            self.snapshot()
        };
        for (service, state) in current {
            sink.publish(&service, state).await;
        }
    }

    /// Record a state for `service`.
    ///
    /// After [`shutdown_all`](Self::shutdown_all) states only move forward:
    /// `Serving` is ignored, as is anything that would move a service back
    /// from where it is. Sinks are only notified when the state actually
    /// changes.
    pub async fn set_status(&self, service: &str, state: ServingState) {
        let changed = {
            let mut statuses = self.inner.statuses.write().unwrap_or_else(|e| e.into_inner());
            if self.inner.shut_down.load(Ordering::SeqCst) {
                let current = statuses.get(service).copied();
                if state.is_serving() || current.is_some_and(|current| state < current) {
                    tracing::warn!(
                        service,
                        state = %state,
                        current = ?current,
                        "ignoring backward health transition after shutdown"
                    );
                    return;
                }
            }
            statuses.insert(service.to_string(), state) != Some(state)
        };
        if changed {
            tracing::debug!(service, state = %state, "health status changed");
            self.publish(&[(service.to_string(), state)]).await;
        }
    }

    /// Current state of `service`; `Unknown` if it was never set.
    pub fn status(&self, service: &str) -> ServingState {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .copied()
            .unwrap_or(ServingState::Unknown)
    }

    /// Every known service and its state, overall entry first.
    pub fn snapshot(&self) -> Vec<(String, ServingState)> {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, state)| (name.clone(), *state))
            .collect()
    }

    /// Move the overall entry and every service to `Draining`.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// transition.
    pub async fn shutdown_all(&self) -> bool {
        let changed = {
            let mut statuses = self.inner.statuses.write().unwrap_or_else(|e| e.into_inner());
            if self.inner.shut_down.swap(true, Ordering::SeqCst) {
                return false;
            }
            statuses.entry(OVERALL.to_string()).or_insert(ServingState::Unknown);
            Self::advance_all(&mut statuses, ServingState::Draining)
        };
        tracing::info!(services = changed.len(), "health set to draining for all services");
        self.publish(&changed).await;
        true
    }

    /// Mark every service `Stopped`. Implies shutdown.
    pub async fn mark_stopped(&self) {
        let changed = {
            let mut statuses = self.inner.statuses.write().unwrap_or_else(|e| e.into_inner());
            self.inner.shut_down.store(true, Ordering::SeqCst);
            statuses.entry(OVERALL.to_string()).or_insert(ServingState::Unknown);
            Self::advance_all(&mut statuses, ServingState::Stopped)
        };
        self.publish(&changed).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn advance_all(
        statuses: &mut BTreeMap<String, ServingState>,
        target: ServingState,
    ) -> Vec<(String, ServingState)> {
        statuses
            .iter_mut()
            .filter(|(_, state)| **state < target)
            .map(|(name, state)| {
                *state = target;
                (name.clone(), target)
            })
            .collect()
    }

    async fn publish(&self, changes: &[(String, ServingState)]) {
        if changes.is_empty() {
            return;
        }
        let sinks: Vec<_> = self
            .inner
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for sink in &sinks {
            for (service, state) in changes {
                sink.publish(service, *state).await;
            }
        }
    }
}
