use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use keel_core::{CancellationToken, LifecycleState, Server, ServingState, OVERALL};
use keel_grpc::{GrpcTransport, ListenerConfig};
use tonic::body::Body;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::{self, uri::PathAndQuery};
use tonic::codegen::Service;
use tonic::server::NamedService;
use tonic::transport::Endpoint;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

const REFLECTION: &str = "grpc.reflection.v1.ServerReflection";

fn loopback() -> ListenerConfig {
    ListenerConfig {
        host: "127.0.0.1".to_string(),
        ..ListenerConfig::default()
    }
}

/// A real service to register as business logic: the reflection service
/// itself, served without the built-in reflection surface.
async fn transport() -> GrpcTransport {
    let listener = loopback().bind().await.unwrap();
    let mut transport = GrpcTransport::new(listener).with_reflection(false);
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();
    transport.add_service(reflection);
    transport
}

async fn client(addr: std::net::SocketAddr) -> HealthClient<tonic::transport::Channel> {
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    HealthClient::new(channel)
}

fn check(service: &str) -> HealthCheckRequest {
    HealthCheckRequest {
        service: service.to_string(),
    }
}

/// Reads `updates` until the server ends the stream, returning the error it
/// ended with. Every update seen on the way must be `NOT_SERVING`.
async fn read_until_closed(
    updates: &mut Streaming<HealthCheckResponse>,
) -> Option<tonic::Status> {
    loop {
        match updates.message().await {
            Ok(Some(update)) => assert_eq!(update.status(), ServingStatus::NotServing),
            Ok(None) => return None,
            Err(status) => return Some(status),
        }
    }
}

/// Business service whose only method panics.
#[derive(Clone)]
struct Exploding;

impl NamedService for Exploding {
    const NAME: &'static str = "keel.test.Exploding";
}

fn explode() -> http::Response<Body> {
    panic!("handler exploded")
}

impl Service<http::Request<Body>> for Exploding {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _request: http::Request<Body>) -> Self::Future {
        Box::pin(async { Ok(explode()) })
    }
}

#[tokio::test]
async fn test_health_surface_reports_registered_services() {
    let transport = transport().await;
    let addr = transport.local_addr().unwrap();

    let token = CancellationToken::new();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    assert_eq!(
        handle.wait_for(LifecycleState::Serving).await,
        LifecycleState::Serving
    );

    let mut client = client(addr).await;
    let overall = client.check(check(OVERALL)).await.unwrap().into_inner();
    assert_eq!(overall.status(), ServingStatus::Serving);
    let service = client.check(check(REFLECTION)).await.unwrap().into_inner();
    assert_eq!(service.status(), ServingStatus::Serving);

    let unknown = client.check(check("nope.Nope")).await.unwrap_err();
    assert_eq!(unknown.code(), tonic::Code::NotFound);

    drop(client);
    token.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_open_stream_holds_the_drain_until_stop_severs_it() {
    let transport = transport().await;
    let addr = transport.local_addr().unwrap();

    let token = CancellationToken::new();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let health = server.health().clone();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let mut client = client(addr).await;
    let mut updates = client.watch(check(REFLECTION)).await.unwrap().into_inner();
    let first = updates.message().await.unwrap().unwrap();
    assert_eq!(first.status(), ServingStatus::Serving);

    token.cancel();
    let next = updates.message().await.unwrap().unwrap();
    assert_eq!(next.status(), ServingStatus::NotServing);
    assert_eq!(health.status(REFLECTION), ServingState::Draining);

    // The watch stream is still in flight, so the drain cannot finish.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    assert_eq!(handle.state(), LifecycleState::Draining);

    handle.stop();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(health.status(REFLECTION), ServingState::Stopped);

    tokio::time::timeout(Duration::from_secs(2), read_until_closed(&mut updates))
        .await
        .expect("stream still open after the server stopped");
}

#[tokio::test]
async fn test_stop_severs_open_streams() {
    let transport = transport().await;
    let addr = transport.local_addr().unwrap();

    let token = CancellationToken::new();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let mut client = client(addr).await;
    let mut updates = client.watch(check(OVERALL)).await.unwrap().into_inner();
    let first = updates.message().await.unwrap().unwrap();
    assert_eq!(first.status(), ServingStatus::Serving);

    handle.stop();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(handle.state(), LifecycleState::Stopped);

    tokio::time::timeout(Duration::from_secs(2), read_until_closed(&mut updates))
        .await
        .expect("stream still open after the server stopped");
}

#[tokio::test]
async fn test_panicking_handler_fails_only_its_call() {
    let listener = loopback().bind().await.unwrap();
    let mut transport = GrpcTransport::new(listener).with_reflection(false);
    transport.add_service(Exploding);
    let addr = transport.local_addr().unwrap();

    let token = CancellationToken::new();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut grpc = tonic::client::Grpc::new(channel.clone());
    grpc.ready().await.unwrap();
    let codec: ProstCodec<HealthCheckRequest, HealthCheckResponse> = ProstCodec::default();
    let err = grpc
        .unary(
            tonic::Request::new(check("")),
            PathAndQuery::from_static("/keel.test.Exploding/Explode"),
            codec,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);
    assert_eq!(err.message(), "handler exploded");

    // The server keeps serving other calls on the same connection.
    let mut health = HealthClient::new(channel);
    let service = health.check(check(Exploding::NAME)).await.unwrap().into_inner();
    assert_eq!(service.status(), ServingStatus::Serving);

    drop(health);
    token.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(outcome.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn test_socket_file_is_removed_after_clean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");
    let config = ListenerConfig {
        kind: keel_grpc::ListenerKind::Sock,
        socket: Some(path.clone()),
        ..ListenerConfig::default()
    };

    for _ in 0..2 {
        let transport = GrpcTransport::new(config.bind().await.unwrap());
        let token = CancellationToken::new();
        let server = Server::new(transport, &token);
        let handle = server.handle();
        let task = tokio::spawn(server.start());
        handle.wait_for(LifecycleState::Serving).await;
        assert!(path.exists());

        token.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(outcome.is_ok());
        assert!(!path.exists());
    }
}

#[tokio::test]
async fn test_stop_without_open_connections_returns_promptly() {
    let transport = transport().await;

    let token = CancellationToken::new();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    handle.stop();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(handle.state(), LifecycleState::Stopped);
}
