//! Lifecycle coordinator.
//!
//! A [`Server`] owns a [`Transport`] and walks it through
//! `Idle -> Serving -> Draining -> Stopped`:
//!
//! - on start every registered service, plus the overall entry, is marked
//!   `Serving`, the health and reflection surfaces are installed, and the
//!   accept loop begins;
//! - on cancellation (the shutdown token, or the accept loop failing) health
//!   is moved to `Draining` *before* the transport is told to stop accepting;
//! - once the accept loop has returned, health is marked `Stopped`.
//!
//! An immediate stop ([`ServerHandle::stop`]) skips the drain and makes the
//! transport abandon in-flight calls.

use std::future::Future;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthRegistry, ServingState, OVERALL};
use crate::normalize::BoxError;

/// Coordinator state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Idle,
    Serving,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to install {surface} surface: {source}")]
    Surface {
        surface: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("accept loop failed: {0}")]
    Serve(#[source] BoxError),
}

impl TransportError {
    pub fn surface(surface: &'static str, source: impl Into<BoxError>) -> Self {
        TransportError::Surface {
            surface,
            source: source.into(),
        }
    }

    pub fn serve(source: impl Into<BoxError>) -> Self {
        TransportError::Serve(source.into())
    }
}

/// Terminal error of a lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The accept loop returned although nobody asked it to stop.
    #[error("accept loop exited before shutdown was requested")]
    AcceptLoopExited,
}

/// The RPC transport driven by the coordinator.
///
/// Implementations own the already-bound listener and the registered
/// business services.
pub trait Transport: Send + 'static {
    /// Names of every business service registered so far.
    fn service_names(&self) -> Vec<String>;

    /// Register the health and introspection surfaces. Called once, after
    /// all business services are registered and marked serving.
    fn install_surfaces(
        &mut self,
        health: &HealthRegistry,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Run the accept loop until `drain` or `halt` fires.
    ///
    /// After `drain`, stop accepting and return once in-flight calls have
    /// completed. After `halt`, return promptly, severing whatever is still
    /// running.
    fn serve(
        self,
        drain: CancellationToken,
        halt: CancellationToken,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A server bound to one transport for one lifecycle.
pub struct Server<T> {
    transport: T,
    health: HealthRegistry,
    shutdown: CancellationToken,
    halt: CancellationToken,
    state: watch::Sender<LifecycleState>,
}

impl<T: Transport> Server<T> {
    /// Wrap `transport`. Cancelling `shutdown` (or any parent of it) starts a
    /// graceful drain.
    pub fn new(transport: T, shutdown: &CancellationToken) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            transport,
            health: HealthRegistry::new(),
            shutdown: shutdown.child_token(),
            halt: CancellationToken::new(),
            state,
        }
    }

    /// Hand the transport to a registration callback so business services
    /// can be attached before the server starts.
    pub fn register<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&mut T),
    {
        register(&mut self.transport);
        self
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            halt: self.halt.clone(),
            state: self.state.subscribe(),
        }
    }

    fn advance(&self, next: LifecycleState) {
        advance(&self.state, next);
    }

    /// Run the whole lifecycle, returning once the server has stopped.
    pub async fn start(mut self) -> Result<(), LifecycleError> {
        if self.halt.is_cancelled() {
            self.health.mark_stopped().await;
            self.advance(LifecycleState::Stopped);
            return Ok(());
        }

        let services = self.transport.service_names();
        self.health.set_status(OVERALL, ServingState::Serving).await;
        for service in &services {
            self.health.set_status(service, ServingState::Serving).await;
        }

        if let Err(err) = self.transport.install_surfaces(&self.health).await {
            tracing::error!(error = %err, "failed to install server surfaces");
            self.health.mark_stopped().await;
            self.advance(LifecycleState::Stopped);
            return Err(err.into());
        }

        let Server {
            transport,
            health,
            shutdown,
            halt,
            state,
        } = self;

        tracing::info!(services = ?services, "server started");
        advance(&state, LifecycleState::Serving);

        let group = shutdown.child_token();
        let drain = CancellationToken::new();

        let accept = async {
            let result = transport.serve(drain.clone(), halt.clone()).await;
            let outcome = match result {
                Ok(()) if drain.is_cancelled() || halt.is_cancelled() => Ok(()),
                Ok(()) => {
                    tracing::error!("accept loop exited before shutdown was requested");
                    Err(LifecycleError::AcceptLoopExited)
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept loop failed");
                    Err(LifecycleError::from(err))
                }
            };
            group.cancel();
            outcome
        };

        let watcher = async {
            tokio::select! {
                _ = group.cancelled() => {
                    tracing::debug!(
                        requested = shutdown.is_cancelled(),
                        "shutdown triggered"
                    );
                }
                _ = halt.cancelled() => {
                    tracing::debug!("immediate stop requested");
                }
            }
            if !halt.is_cancelled() {
                advance(&state, LifecycleState::Draining);
            }
            health.shutdown_all().await;
            tracing::info!("stopping server");
            drain.cancel();
        };

        let (outcome, ()) = tokio::join!(accept, watcher);

        health.mark_stopped().await;
        advance(&state, LifecycleState::Stopped);
        tracing::info!("server stopped");
        outcome
    }
}

fn advance(state: &watch::Sender<LifecycleState>, next: LifecycleState) {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Remote control for a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    halt: CancellationToken,
    state: watch::Receiver<LifecycleState>,
}

impl ServerHandle {
    /// Begin a graceful drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop immediately, severing in-flight calls.
    pub fn stop(&self) {
        self.halt.cancel();
        self.shutdown.cancel();
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the server has reached `target` (or gone past it).
    pub async fn wait_for(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        // The sender is gone once the server has returned; report where it ended.
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}
