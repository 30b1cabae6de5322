//! tonic transport for the Keel lifecycle coordinator.
//!
//! [`GrpcTransport`] implements [`keel_core::Transport`]: business services
//! are added before start, and at start the standard `grpc.health.v1.Health`
//! surface (driven by the core health registry) and, with the `reflection`
//! feature, a reflection v1 surface are installed alongside them. Every call
//! passes through panic recovery and the access log before reaching a
//! service.
//!
//! # Example
//!
//! ```ignore
//! use keel_grpc::{GrpcTransport, ListenerConfig};
//!
//! let config = KeelConfig::load(None)?;
//! let server = config.section::<ListenerConfig>()?;
//! let transport = GrpcTransport::new(server.bind().await?).with_reflection(server.reflection);
//! let status = keel_core::start(&config, transport, |t| {
//!     t.add_service(UsersServer::new(Users::default()));
//! })
//! .await?;
//! std::process::exit(status.code().into());
//! ```

pub mod connection;
pub mod health;
pub mod layers;
pub mod listener;
pub mod transport;

pub use connection::Severable;
pub use health::{wire_status, ReporterSink};
pub use layers::{access_log_layer, recovery_layer};
pub use listener::{Listener, ListenerConfig, ListenerKind, SocketFile, DEFAULT_SOCKET_NAME};
pub use transport::GrpcTransport;

// Re-exported for service implementations.
pub use tonic;
pub use tonic_health;
