use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keel_core::{
    CallInfo, CancellationToken, ErrorKind, HandlerError, LifecycleError, LifecycleState,
    Pipeline, Server, ServingState, OVERALL,
};
use keel_test::{CallOutcome, CallRejected, TestTransport, TransportEvent};
use tokio::sync::oneshot;

const USERS: &str = "users.v1.Users";
const ORDERS: &str = "orders.v1.Orders";

fn server(token: &CancellationToken) -> (Server<TestTransport>, keel_test::TestClient) {
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, token).register(|t| t.add_service(ORDERS));
    (server, client)
}

#[tokio::test]
async fn test_start_marks_everything_serving() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let health = server.health().clone();
    let handle = server.handle();
    assert_eq!(handle.state(), LifecycleState::Idle);
    assert_eq!(health.status(OVERALL), ServingState::Unknown);

    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    assert_eq!(health.status(OVERALL), ServingState::Serving);
    assert_eq!(health.status(USERS), ServingState::Serving);
    assert_eq!(health.status(ORDERS), ServingState::Serving);
    assert!(client.is_accepting());

    token.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(health.status(USERS), ServingState::Stopped);
}

#[tokio::test]
async fn test_drain_lets_in_flight_call_finish() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let (release, released) = oneshot::channel::<()>();
    let call = client
        .call(async move {
            let _ = released.await;
            "done"
        })
        .unwrap();

    token.cancel();
    handle.wait_for(LifecycleState::Draining).await;
    while client.is_accepting() {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.call(async {}).err(), Some(CallRejected));
    assert!(!call.is_finished());
    assert_eq!(handle.state(), LifecycleState::Draining);

    release.send(()).unwrap();
    assert_eq!(call.outcome().await, CallOutcome::Completed("done"));
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_health_drains_before_accept_loop_stops() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    token.cancel();
    task.await.unwrap().unwrap();

    let at_drain = client.health_at_drain().unwrap();
    assert_eq!(at_drain.len(), 3);
    assert!(at_drain
        .iter()
        .all(|(_, state)| *state == ServingState::Draining));

    let events = client.events();
    let stopped_at = events
        .iter()
        .position(|e| *e == TransportEvent::AcceptStopped)
        .unwrap();
    for service in [OVERALL, USERS, ORDERS] {
        let draining = TransportEvent::Health(service.to_string(), ServingState::Draining);
        let stopped = TransportEvent::Health(service.to_string(), ServingState::Stopped);
        let draining_at = events.iter().position(|e| *e == draining).unwrap();
        let stopped_health_at = events.iter().position(|e| *e == stopped).unwrap();
        assert!(draining_at < stopped_at, "{service} drained after accept stopped");
        assert!(stopped_health_at > stopped_at, "{service} stopped before accept loop");
    }
    // Nothing reports serving once the drain has begun.
    assert!(!events[stopped_at..]
        .iter()
        .any(|e| matches!(e, TransportEvent::Health(_, ServingState::Serving))));
}

#[tokio::test]
async fn test_immediate_stop_severs_in_flight_calls() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let hung = client.call(std::future::pending::<()>()).unwrap();
    handle.stop();

    assert!(hung.outcome().await.is_severed());
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_stop_during_drain_severs_remaining_calls() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let hung = client.call(std::future::pending::<()>()).unwrap();
    handle.shutdown();
    handle.wait_for(LifecycleState::Draining).await;
    handle.stop();

    assert!(hung.outcome().await.is_severed());
    task.await.unwrap().unwrap();
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_stop_before_start_goes_straight_to_stopped() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let health = server.health().clone();

    handle.stop();
    server.start().await.unwrap();

    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(health.status(USERS), ServingState::Unknown);
    assert!(client.events().is_empty());
}

#[tokio::test]
async fn test_accept_failure_is_fatal() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let health = server.health().clone();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    client.fail_accept("listener closed by peer");
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::Transport(_)));
    assert!(err.to_string().contains("listener closed by peer"));
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(health.status(OVERALL), ServingState::Stopped);
    // The external token is left alone; only this server went down.
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_accept_loop_returning_early_is_fatal() {
    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    client.exit_accept_loop();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::AcceptLoopExited));
}

#[tokio::test]
async fn test_handler_panic_does_not_take_the_server_down() {
    const GET: CallInfo = CallInfo::unary(USERS, "Get");

    #[derive(garde::Validate)]
    struct GetUser {
        #[garde(length(min = 1))]
        id: String,
    }

    let token = CancellationToken::new();
    let (server, client) = server(&token);
    let handle = server.handle();
    let task = tokio::spawn(server.start());
    handle.wait_for(LifecycleState::Serving).await;

    let pipeline = Pipeline::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let get = |id: &str| {
        let invocations = invocations.clone();
        let request = GetUser { id: id.to_string() };
        async move {
            pipeline
                .unary(&GET, Some(request), |req| async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    if req.id == "boom" {
                        panic!("lookup table corrupted");
                    }
                    Ok::<_, HandlerError>(req.id)
                })
                .await
        }
    };

    let failed = client.call(get("boom")).unwrap().outcome().await.completed().unwrap();
    assert_eq!(failed.unwrap_err().kind(), ErrorKind::Internal);

    let rejected = client.call(get("")).unwrap().outcome().await.completed().unwrap();
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::InvalidArgument);

    let ok = client.call(get("42")).unwrap().outcome().await.completed().unwrap();
    assert_eq!(ok.unwrap(), "42");

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(handle.state(), LifecycleState::Serving);

    token.cancel();
    task.await.unwrap().unwrap();
}
