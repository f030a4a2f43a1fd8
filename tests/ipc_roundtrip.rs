// tests/ipc_roundtrip.rs
//! Several endpoints sharing one broadcast topic

use async_trait::async_trait;
use botfleet_runner::cluster::HostRole;
use botfleet_runner::ipc::{
    BusTransport, EndpointId, InMemoryBus, IpcEndpoint, IpcErrorKind, IpcMessage, LocalBotsHandler, MessageType,
    Payload, Reply, RequestHandler, RunningBots,
};
use botfleet_runner::RunnerError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "botfleet-runner";

async fn endpoint(bus: &Arc<dyn BusTransport>, host: &str, role: HostRole, bots: &[&str]) -> IpcEndpoint {
    let running = RunningBots::new();
    for bot in bots {
        running.insert(*bot);
    }
    IpcEndpoint::start(
        EndpointId::new(host, role),
        bus.clone(),
        TOPIC,
        Arc::new(LocalBotsHandler::new(role, running)),
        Duration::from_millis(300),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_only_the_target_answers() {
    let bus: Arc<dyn BusTransport> = Arc::new(InMemoryBus::new());
    let controller = endpoint(&bus, "ctl", HostRole::Controller, &[]).await;
    let _b = endpoint(&bus, "b", HostRole::Client, &["greeter"]).await;
    let _c = endpoint(&bus, "c", HostRole::Client, &["echo", "weather"]).await;

    let bots = controller
        .discover_bots(&EndpointId::new("b", HostRole::Client))
        .await
        .unwrap();

    assert_eq!(bots, vec!["greeter"]);
    assert_eq!(controller.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_to_their_own_responders() {
    let bus: Arc<dyn BusTransport> = Arc::new(InMemoryBus::new());
    let controller = endpoint(&bus, "ctl", HostRole::Controller, &[]).await;
    let _b = endpoint(&bus, "b", HostRole::Client, &["greeter"]).await;
    let _c = endpoint(&bus, "c", HostRole::Client, &["echo"]).await;

    let b = EndpointId::new("b", HostRole::Client);
    let c = EndpointId::new("c", HostRole::Client);
    let (from_b, from_c) = tokio::join!(controller.discover_bots(&b), controller.discover_bots(&c));

    assert_eq!(from_b.unwrap(), vec!["greeter"]);
    assert_eq!(from_c.unwrap(), vec!["echo"]);
}

/// Answers each call with its own ordinal; earlier calls answer later
#[derive(Default)]
struct SlowFirstHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for SlowFirstHandler {
    async fn handle(&self, _request: &IpcMessage, _sender: &EndpointId) -> Reply {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = 200u64.saturating_sub(call as u64 * 100);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(Payload::Bots(vec![format!("reply-{}", call)]))
    }
}

#[tokio::test]
async fn test_same_target_concurrent_requests_get_their_own_replies() {
    let bus: Arc<dyn BusTransport> = Arc::new(InMemoryBus::new());
    let controller = IpcEndpoint::start(
        EndpointId::new("ctl", HostRole::Controller),
        bus.clone(),
        TOPIC,
        Arc::new(LocalBotsHandler::new(HostRole::Controller, RunningBots::new())),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let _b = IpcEndpoint::start(
        EndpointId::new("b", HostRole::Client),
        bus.clone(),
        TOPIC,
        Arc::new(SlowFirstHandler::default()),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let b = EndpointId::new("b", HostRole::Client);
    let first = controller.discover_bots(&b);
    let second = async {
        // Make sure the first request reaches the handler first
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.discover_bots(&b).await
    };
    let (first, second) = tokio::join!(first, second);

    // The second reply is published before the first one
    assert_eq!(first.unwrap(), vec!["reply-0"]);
    assert_eq!(second.unwrap(), vec!["reply-1"]);
    assert_eq!(controller.pending_requests(), 0);
}

#[tokio::test]
async fn test_controller_rejects_discovery() {
    let bus: Arc<dyn BusTransport> = Arc::new(InMemoryBus::new());
    let client = endpoint(&bus, "b", HostRole::Client, &["greeter"]).await;
    let _controller = endpoint(&bus, "ctl", HostRole::Controller, &[]).await;

    let err = client
        .request(MessageType::DiscoverBots, &EndpointId::new("ctl", HostRole::Controller))
        .await
        .unwrap_err();

    match err {
        RunnerError::IpcRemote { sender, kind, .. } => {
            assert_eq!(sender, "ctl-controller");
            assert_eq!(kind, IpcErrorKind::Unsupported.as_str());
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_closed_endpoint_stops_answering() {
    let bus: Arc<dyn BusTransport> = Arc::new(InMemoryBus::new());
    let controller = endpoint(&bus, "ctl", HostRole::Controller, &[]).await;
    let client = endpoint(&bus, "b", HostRole::Client, &["greeter"]).await;

    client.close();

    let err = controller
        .discover_bots(&EndpointId::new("b", HostRole::Client))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Timeout(_)));
    assert_eq!(controller.pending_requests(), 0);
}
