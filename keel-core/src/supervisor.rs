//! Signal and timeout supervision.
//!
//! The [`Supervisor`] runs a [`Server`] to completion and turns the way it
//! ended into an [`ExitStatus`]. The first termination signal starts a
//! graceful drain bounded by the grace period. So does the configured
//! lifetime elapsing, the token being cancelled, or the server beginning to
//! drain by itself. A second signal, or the grace period running out, forces
//! an immediate stop.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ConfigProperties, KeelConfig};
use crate::lifecycle::{LifecycleError, LifecycleState, Server, Transport};

/// Grace period granted to in-flight calls once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// How long a forcibly stopped server gets to return before its task is aborted.
pub const HALT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Hangup,
    Terminate,
    Interrupt,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Hangup => "SIGHUP",
            SignalKind::Terminate => "SIGTERM",
            SignalKind::Interrupt => "SIGINT",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process termination signals the supervisor reacts to.
///
/// Either the real OS handlers ([`SignalListener::install`]) or a channel
/// fed by the caller ([`SignalListener::from_channel`]).
pub struct SignalListener {
    source: SignalSource,
}

enum SignalSource {
    #[cfg(unix)]
    Os {
        hangup: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
        interrupt: tokio::signal::unix::Signal,
    },
    #[cfg(not(unix))]
    CtrlC,
    Channel(mpsc::Receiver<SignalKind>),
}

impl SignalListener {
    /// Install handlers for SIGHUP, SIGTERM and SIGINT (Ctrl-C only on
    /// non-Unix targets).
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind as Unix};
        Ok(Self {
            source: SignalSource::Os {
                hangup: signal(Unix::hangup())?,
                terminate: signal(Unix::terminate())?,
                interrupt: signal(Unix::interrupt())?,
            },
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            source: SignalSource::CtrlC,
        })
    }

    /// Deliver whatever arrives on `signals` as if it were a process signal.
    pub fn from_channel(signals: mpsc::Receiver<SignalKind>) -> Self {
        Self {
            source: SignalSource::Channel(signals),
        }
    }

    /// Next received signal; `None` once no more can be delivered.
    pub async fn recv(&mut self) -> Option<SignalKind> {
        match &mut self.source {
            #[cfg(unix)]
            SignalSource::Os {
                hangup,
                terminate,
                interrupt,
            } => tokio::select! {
                received = hangup.recv() => received.map(|()| SignalKind::Hangup),
                received = terminate.recv() => received.map(|()| SignalKind::Terminate),
                received = interrupt.recv() => received.map(|()| SignalKind::Interrupt),
            },
            #[cfg(not(unix))]
            SignalSource::CtrlC => tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|()| SignalKind::Interrupt),
            SignalSource::Channel(signals) => signals.recv().await,
        }
    }
}

impl fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalListener").finish_non_exhaustive()
    }
}

/// Why graceful shutdown began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal(SignalKind),
    /// The configured lifetime elapsed.
    Deadline,
    /// The supervisor token was cancelled programmatically.
    Cancelled,
    /// The server began draining on its own, through its handle or after a
    /// fatal accept error.
    Requested,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(_) => f.write_str("interrupt"),
            ShutdownCause::Deadline => f.write_str("deadline"),
            ShutdownCause::Cancelled => f.write_str("cancelled"),
            ShutdownCause::Requested => f.write_str("requested"),
        }
    }
}

/// How the supervised server ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Drained and stopped within the grace period.
    Clean,
    /// Escalated to an immediate stop.
    Forced,
    /// The server terminated with an error.
    Failed,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Forced | ExitStatus::Failed => 1,
        }
    }

    pub fn is_clean(self) -> bool {
        self == ExitStatus::Clean
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// `lifecycle.*` configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub grace_period: Duration,
    /// Begin graceful shutdown once the server has run this long.
    pub lifetime: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            lifetime: None,
        }
    }
}

impl ConfigProperties for LifecycleConfig {
    fn prefix() -> &'static str {
        "lifecycle"
    }

    fn from_config(config: &KeelConfig) -> Result<Self, ConfigError> {
        let grace = config.get_or(&Self::key("grace"), DEFAULT_GRACE_PERIOD.as_secs())?;
        let lifetime: Option<u64> = config.get_or(&Self::key("lifetime"), None)?;
        Ok(Self {
            grace_period: Duration::from_secs(grace),
            lifetime: lifetime.map(Duration::from_secs),
        })
    }
}

enum Escalation {
    GraceElapsed,
    SecondSignal(SignalKind),
}

/// Runs a server under signal and deadline supervision.
#[derive(Debug)]
pub struct Supervisor {
    grace_period: Duration,
    lifetime: Option<Duration>,
    token: CancellationToken,
    signals: Option<SignalListener>,
}

impl Supervisor {
    pub fn new(config: &LifecycleConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            lifetime: config.lifetime,
            token: CancellationToken::new(),
            signals: None,
        }
    }

    /// Listen for process termination signals.
    pub fn with_signals(self) -> Result<Self, SupervisorError> {
        let listener = SignalListener::install().map_err(SupervisorError::Signals)?;
        Ok(self.with_signal_listener(listener))
    }

    /// React to signals from `listener` instead of the process handlers.
    pub fn with_signal_listener(mut self, listener: SignalListener) -> Self {
        self.signals = Some(listener);
        self
    }

    /// Root of the cancellation tree. Cancelling it starts a graceful
    /// shutdown exactly like a first signal would.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run `server` until it stops.
    pub async fn run<T: Transport>(mut self, server: Server<T>) -> ExitStatus {
        let handle = server.handle();
        let mut task = tokio::spawn(server.start());

        let lifetime = lifetime_elapsed(self.lifetime);
        tokio::pin!(lifetime);

        let cause = tokio::select! {
            biased;
            joined = &mut task => return finish(joined),
            kind = next_signal(&mut self.signals) => ShutdownCause::Signal(kind),
            _ = &mut lifetime => ShutdownCause::Deadline,
            _ = self.token.cancelled() => ShutdownCause::Cancelled,
            _ = handle.wait_for(LifecycleState::Draining) => ShutdownCause::Requested,
        };

        if let ShutdownCause::Signal(kind) = cause {
            tracing::info!(cause = %cause, signal = %kind, "shutting down gracefully, press Ctrl+C again to force");
        } else {
            tracing::info!(cause = %cause, "shutting down gracefully, press Ctrl+C again to force");
        }
        self.token.cancel();
        handle.shutdown();

        let deadline = Instant::now() + self.grace_period;
        let escalation = tokio::select! {
            joined = &mut task => return finish(joined),
            _ = tokio::time::sleep_until(deadline) => Escalation::GraceElapsed,
            kind = next_signal(&mut self.signals) => Escalation::SecondSignal(kind),
        };

        match escalation {
            Escalation::GraceElapsed => tracing::error!(
                grace_secs = self.grace_period.as_secs(),
                "shutdown grace period elapsed, forcing exit"
            ),
            Escalation::SecondSignal(kind) => {
                tracing::warn!(signal = %kind, "second signal received, forcing exit")
            }
        }
        handle.stop();

        let joined = tokio::time::timeout(HALT_JOIN_TIMEOUT, &mut task).await;
        match joined {
            Ok(Ok(Err(err))) => tracing::error!(error = %err, "server stopped with error"),
            Ok(Err(err)) => tracing::error!(error = %err, "server task failed"),
            Ok(Ok(Ok(()))) => {}
            Err(_) => {
                tracing::error!(
                    timeout_secs = HALT_JOIN_TIMEOUT.as_secs(),
                    "server did not stop in time, aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }
        ExitStatus::Forced
    }
}

fn lifetime_elapsed(lifetime: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match lifetime {
            Some(lifetime) => tokio::time::sleep(lifetime).await,
            None => std::future::pending().await,
        }
    }
}

async fn next_signal(signals: &mut Option<SignalListener>) -> SignalKind {
    if let Some(listener) = signals {
        if let Some(kind) = listener.recv().await {
            return kind;
        }
    }
    std::future::pending().await
}

fn finish(joined: Result<Result<(), LifecycleError>, JoinError>) -> ExitStatus {
    match joined {
        Ok(Ok(())) => {
            tracing::info!("goodbye");
            ExitStatus::Clean
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "server terminated with error");
            ExitStatus::Failed
        }
        Err(err) => {
            tracing::error!(error = %err, "server task failed");
            ExitStatus::Failed
        }
    }
}

/// Load the server and lifecycle settings from `config`, run `transport` with
/// `register` attached, and supervise it under process signals.
pub async fn start<T, F>(
    config: &KeelConfig,
    transport: T,
    register: F,
) -> Result<ExitStatus, SupervisorError>
where
    T: Transport,
    F: FnOnce(&mut T),
{
    let lifecycle = config.section::<LifecycleConfig>()?;
    let supervisor = Supervisor::new(&lifecycle).with_signals()?;
    let server = Server::new(transport, &supervisor.token()).register(register);
    Ok(supervisor.run(server).await)
}
