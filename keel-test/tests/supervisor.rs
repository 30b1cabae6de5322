use std::time::Duration;

use keel_core::{
    ExitStatus, LifecycleConfig, LifecycleState, Server, ServingState, SignalKind,
    SignalListener, Supervisor, OVERALL,
};
use tokio::sync::mpsc;
use keel_test::{CallOutcome, TestTransport};

const USERS: &str = "users.v1.Users";

fn config(grace_secs: u64) -> LifecycleConfig {
    LifecycleConfig {
        grace_period: Duration::from_secs(grace_secs),
        lifetime: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_drains_cleanly() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let call = client
        .call(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            7
        })
        .unwrap();
    token.cancel();

    assert_eq!(run.await.unwrap(), ExitStatus::Clean);
    assert_eq!(call.outcome().await, CallOutcome::Completed(7));
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_hung_call_past_grace_forces_exit() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let health = server.health().clone();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let hung = client.call(std::future::pending::<()>()).unwrap();
    let started = tokio::time::Instant::now();
    token.cancel();

    let status = run.await.unwrap();
    assert_eq!(status, ExitStatus::Forced);
    assert_eq!(status.code(), 1);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(hung.outcome().await.is_severed());
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(health.status(USERS), ServingState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_forced_stop_waits_for_the_full_grace_period() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let slow = client
        .call(async {
            tokio::time::sleep(Duration::from_secs(29)).await;
            "made it"
        })
        .unwrap();
    token.cancel();

    assert_eq!(run.await.unwrap(), ExitStatus::Clean);
    assert_eq!(slow.outcome().await, CallOutcome::Completed("made it"));
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_elapsing_starts_graceful_shutdown() {
    let supervisor = Supervisor::new(&LifecycleConfig {
        grace_period: Duration::from_secs(30),
        lifetime: Some(Duration::from_secs(600)),
    });
    let token = supervisor.token();
    let server = Server::new(TestTransport::new([USERS]), &token);
    let handle = server.handle();

    let started = tokio::time::Instant::now();
    let status = supervisor.run(server).await;

    assert_eq!(status, ExitStatus::Clean);
    assert!(started.elapsed() >= Duration::from_secs(600));
    assert!(token.is_cancelled());
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_accept_failure_exits_with_failure() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let health = server.health().clone();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;
    client.fail_accept("too many open files");

    let status = run.await.unwrap();
    assert_eq!(status, ExitStatus::Failed);
    assert_eq!(status.code(), 1);
    assert_eq!(health.status(OVERALL), ServingState::Stopped);
}

#[tokio::test]
async fn test_server_shutdown_drains_cleanly_under_supervision() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let server = Server::new(TestTransport::new([USERS]), &token);
    let handle = server.handle();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;
    handle.shutdown();

    assert_eq!(run.await.unwrap(), ExitStatus::Clean);
    assert!(token.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_server_shutdown_with_hung_call_is_bounded_by_grace() {
    let supervisor = Supervisor::new(&config(30));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let hung = client.call(std::future::pending::<()>()).unwrap();
    let started = tokio::time::Instant::now();
    handle.shutdown();

    let status = tokio::time::timeout(Duration::from_secs(3600), run)
        .await
        .expect("drain started by the server was never bounded")
        .unwrap();
    assert_eq!(status, ExitStatus::Forced);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(hung.outcome().await.is_severed());
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_signal_drains_cleanly() {
    let (signals, rx) = mpsc::channel(4);
    let supervisor =
        Supervisor::new(&config(30)).with_signal_listener(SignalListener::from_channel(rx));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let call = client
        .call(async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "done"
        })
        .unwrap();
    signals.send(SignalKind::Terminate).await.unwrap();

    assert_eq!(run.await.unwrap(), ExitStatus::Clean);
    assert_eq!(call.outcome().await, CallOutcome::Completed("done"));
    assert!(token.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_second_signal_forces_exit_before_deadline() {
    let (signals, rx) = mpsc::channel(4);
    let supervisor =
        Supervisor::new(&config(30)).with_signal_listener(SignalListener::from_channel(rx));
    let token = supervisor.token();
    let transport = TestTransport::new([USERS]);
    let client = transport.client();
    let server = Server::new(transport, &token);
    let handle = server.handle();
    let health = server.health().clone();

    let run = tokio::spawn(supervisor.run(server));
    handle.wait_for(LifecycleState::Serving).await;

    let hung = client.call(std::future::pending::<()>()).unwrap();
    let started = tokio::time::Instant::now();
    signals.send(SignalKind::Interrupt).await.unwrap();
    assert_eq!(
        handle.wait_for(LifecycleState::Draining).await,
        LifecycleState::Draining
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!run.is_finished());
    signals.send(SignalKind::Interrupt).await.unwrap();

    let status = run.await.unwrap();
    assert_eq!(status, ExitStatus::Forced);
    assert_eq!(status.code(), 1);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(hung.outcome().await.is_severed());
    assert_eq!(health.status(USERS), ServingState::Stopped);
}

#[test]
fn test_exit_codes() {
    assert_eq!(ExitStatus::Clean.code(), 0);
    assert_eq!(ExitStatus::Forced.code(), 1);
    assert_eq!(ExitStatus::Failed.code(), 1);
    assert!(ExitStatus::Clean.is_clean());
    let _: std::process::ExitCode = ExitStatus::Forced.into();
}
