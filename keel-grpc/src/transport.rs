use std::convert::Infallible;

use keel_core::{HealthRegistry, Transport, TransportError};
use tokio_stream::wrappers::TcpListenerStream;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tonic::codegen::Service;
use tonic::server::NamedService;
use tonic::service::Routes;

use crate::connection::Severable;
use crate::health::ReporterSink;
use crate::layers::{access_log_layer, recovery_layer};
use crate::listener::Listener;

/// gRPC transport over a tonic server.
///
/// Every call runs inside the [recovery](crate::layers::recovery_layer) and
/// [access log](crate::layers::access_log_layer) layers. A halt severs every
/// open connection.
///
/// ```ignore
/// let listener = ListenerConfig::from_config(&config)?.bind().await?;
/// let mut transport = GrpcTransport::new(listener);
/// transport
///     .register_encoded_file_descriptor_set(users::FILE_DESCRIPTOR_SET)
///     .add_service(UsersServer::new(UsersImpl::default()));
/// ```
pub struct GrpcTransport {
    listener: Listener,
    routes: Option<Routes>,
    services: Vec<&'static str>,
    reflection: bool,
    descriptor_sets: Vec<&'static [u8]>,
}

impl GrpcTransport {
    pub fn new(listener: impl Into<Listener>) -> Self {
        Self {
            listener: listener.into(),
            routes: None,
            services: Vec::new(),
            reflection: cfg!(feature = "reflection"),
            descriptor_sets: Vec::new(),
        }
    }

    /// Enable or disable the reflection surface. Without the `reflection`
    /// feature it is never served.
    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    /// Describe registered services to reflection clients.
    pub fn register_encoded_file_descriptor_set(&mut self, set: &'static [u8]) -> &mut Self {
        self.descriptor_sets.push(set);
        self
    }

    /// Register a business service. Its name is seeded into the health
    /// registry when the server starts.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        tracing::debug!(service = S::NAME, "registered grpc service");
        self.services.push(S::NAME);
        self.push_route(service);
        self
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    fn push_route<S>(&mut self, service: S)
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.routes = Some(match self.routes.take() {
            Some(routes) => routes.add_service(service),
            None => Routes::new(service),
        });
    }

    #[cfg(feature = "reflection")]
    fn install_reflection(&mut self) -> Result<(), TransportError> {
        let mut builder = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
        for set in self.descriptor_sets.iter().copied() {
            builder = builder.register_encoded_file_descriptor_set(set);
        }
        let service = builder
            .build_v1()
            .map_err(|err| TransportError::surface("reflection", err))?;
        self.push_route(service);
        Ok(())
    }

    #[cfg(not(feature = "reflection"))]
    fn install_reflection(&mut self) -> Result<(), TransportError> {
        tracing::warn!("reflection requested but the `reflection` feature is disabled");
        Ok(())
    }
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("listener", &self.listener)
            .field("services", &self.services)
            .field("reflection", &self.reflection)
            .field("descriptor_sets", &self.descriptor_sets.len())
            .finish()
    }
}

impl Transport for GrpcTransport {
    fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|name| name.to_string()).collect()
    }

    async fn install_surfaces(&mut self, health: &HealthRegistry) -> Result<(), TransportError> {
        let (reporter, health_service) = tonic_health::server::health_reporter();
        health.attach(ReporterSink::new(reporter)).await;
        self.push_route(health_service);

        if self.reflection {
            self.install_reflection()?;
        }
        tracing::debug!(reflection = self.reflection, "installed health surface");
        Ok(())
    }

    async fn serve(
        self,
        drain: CancellationToken,
        halt: CancellationToken,
    ) -> Result<(), TransportError> {
        let Some(routes) = self.routes else {
            tokio::select! {
                _ = drain.cancelled() => {}
                _ = halt.cancelled() => {}
            }
            return Ok(());
        };

        let router = tonic::transport::Server::builder()
            .layer(recovery_layer())
            .layer(access_log_layer())
            .add_routes(routes);
        let shutdown = {
            let drain = drain.clone();
            let halt = halt.clone();
            async move {
                tokio::select! {
                    _ = drain.cancelled() => {}
                    _ = halt.cancelled() => {}
                }
            }
        };
        let severing = halt.clone();
        let serving = async move {
            match self.listener {
                Listener::Tcp(listener) => {
                    let incoming = TcpListenerStream::new(listener)
                        .map(move |accepted| accepted.map(|io| Severable::new(io, &severing)));
                    router.serve_with_incoming_shutdown(incoming, shutdown).await
                }
                #[cfg(unix)]
                Listener::Unix(listener, socket) => {
                    let incoming = UnixListenerStream::new(listener)
                        .map(move |accepted| accepted.map(|io| Severable::new(io, &severing)));
                    let result = router.serve_with_incoming_shutdown(incoming, shutdown).await;
                    drop(socket);
                    result
                }
            }
        };
        tokio::pin!(serving);

        tokio::select! {
            result = &mut serving => return result.map_err(TransportError::serve),
            _ = halt.cancelled() => {
                tracing::warn!("severing in-flight calls");
            }
        }
        // Connections fail their next read once halted, so this only waits
        // for their tasks to unwind.
        serving.await.map_err(TransportError::serve)
    }
}
