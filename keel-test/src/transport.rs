use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use keel_core::{HealthRegistry, HealthSink, ServingState, Transport, TransportError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Something the transport observed, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A health change published to the transport's health surface.
    Health(String, ServingState),
    AcceptStarted,
    /// The accept loop stopped taking new calls.
    AcceptStopped,
}

/// How an in-flight call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Completed(T),
    /// The connection was cut before the call finished.
    Severed,
}

impl<T> CallOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Severed => None,
        }
    }

    pub fn is_severed(&self) -> bool {
        matches!(self, CallOutcome::Severed)
    }
}

/// Returned when a call arrives while the transport is not accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRejected;

impl std::fmt::Display for CallRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("transport is not accepting calls")
    }
}

impl std::error::Error for CallRejected {}

#[derive(Default)]
struct Shared {
    accepting: AtomicBool,
    calls: TaskTracker,
    sever: CancellationToken,
    fail: CancellationToken,
    exit: CancellationToken,
    failure: Mutex<Option<String>>,
    events: Mutex<Vec<TransportEvent>>,
    health: Mutex<Option<HealthRegistry>>,
    health_at_drain: Mutex<Option<Vec<(String, ServingState)>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn record(&self, event: TransportEvent) {
        lock(&self.events).push(event);
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.calls.close();
        self.record(TransportEvent::AcceptStopped);
    }
}

struct EventSink(Arc<Shared>);

impl HealthSink for EventSink {
    async fn publish(&self, service: &str, state: ServingState) {
        self.0
            .record(TransportEvent::Health(service.to_string(), state));
    }
}

/// In-memory [`Transport`] whose calls are plain futures.
///
/// ```ignore
/// let transport = TestTransport::new(["users.v1.Users"]);
/// let client = transport.client();
/// let server = Server::new(transport, &token);
/// // ...
/// let call = client.call(async { 42 })?;
/// assert_eq!(call.outcome().await, CallOutcome::Completed(42));
/// ```
pub struct TestTransport {
    services: Vec<String>,
    shared: Arc<Shared>,
}

impl TestTransport {
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: services.into_iter().map(Into::into).collect(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Register one more business service.
    pub fn add_service(&mut self, name: impl Into<String>) {
        self.services.push(name.into());
    }

    pub fn client(&self) -> TestClient {
        TestClient {
            shared: self.shared.clone(),
        }
    }
}

impl Transport for TestTransport {
    fn service_names(&self) -> Vec<String> {
        self.services.clone()
    }

    async fn install_surfaces(&mut self, health: &HealthRegistry) -> Result<(), TransportError> {
        health.attach(EventSink(self.shared.clone())).await;
        *lock(&self.shared.health) = Some(health.clone());
        // The listener is bound: calls queue from here on.
        self.shared.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn serve(
        self,
        drain: CancellationToken,
        halt: CancellationToken,
    ) -> Result<(), TransportError> {
        let shared = self.shared;
        shared.record(TransportEvent::AcceptStarted);

        tokio::select! {
            _ = drain.cancelled() => {
                let snapshot = lock(&shared.health).as_ref().map(HealthRegistry::snapshot);
                *lock(&shared.health_at_drain) = snapshot;
                shared.stop_accepting();
                tokio::select! {
                    _ = shared.calls.wait() => {}
                    _ = halt.cancelled() => {
                        tracing::debug!("severing in-flight calls");
                        shared.sever.cancel();
                        shared.calls.wait().await;
                    }
                }
                Ok(())
            }
            _ = halt.cancelled() => {
                shared.stop_accepting();
                shared.sever.cancel();
                shared.calls.wait().await;
                Ok(())
            }
            _ = shared.fail.cancelled() => {
                shared.stop_accepting();
                shared.sever.cancel();
                let reason = lock(&shared.failure)
                    .take()
                    .unwrap_or_else(|| "accept failed".to_string());
                Err(TransportError::serve(reason))
            }
            _ = shared.exit.cancelled() => {
                shared.stop_accepting();
                Ok(())
            }
        }
    }
}

/// Client side of a [`TestTransport`]; cheap to clone.
#[derive(Clone)]
pub struct TestClient {
    shared: Arc<Shared>,
}

impl TestClient {
    /// Start a call. It runs until it completes or the transport severs it.
    pub fn call<F>(&self, call: F) -> Result<InFlightCall<F::Output>, CallRejected>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(CallRejected);
        }
        let sever = self.shared.sever.clone();
        let handle = self.shared.calls.spawn(async move {
            tokio::select! {
                output = call => CallOutcome::Completed(output),
                _ = sever.cancelled() => CallOutcome::Severed,
            }
        });
        Ok(InFlightCall { handle })
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Number of calls still running.
    pub fn in_flight(&self) -> usize {
        self.shared.calls.len()
    }

    /// Make the accept loop fail with `reason`.
    pub fn fail_accept(&self, reason: impl Into<String>) {
        *lock(&self.shared.failure) = Some(reason.into());
        self.shared.fail.cancel();
    }

    /// Make the accept loop return successfully without being asked to.
    pub fn exit_accept_loop(&self) {
        self.shared.exit.cancel();
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        lock(&self.shared.events).clone()
    }

    /// Health table as seen at the moment the drain request reached the
    /// transport.
    pub fn health_at_drain(&self) -> Option<Vec<(String, ServingState)>> {
        lock(&self.shared.health_at_drain).clone()
    }
}

/// Handle to a call started with [`TestClient::call`].
pub struct InFlightCall<T> {
    handle: JoinHandle<CallOutcome<T>>,
}

impl<T> InFlightCall<T> {
    pub async fn outcome(self) -> CallOutcome<T> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => CallOutcome::Severed,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
