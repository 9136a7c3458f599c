mod support;

use mqtt_bridge_agent::{Supervisor, SupervisorError, Transport, TransportError};
use mqtt_bridge_bus::{LocalBus, MemoryBus};
use mqtt_bridge_core::{ConnectionState, ConnectionStatus, IS_CONNECTED_KEY};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use support::{refused_port, StubTransport};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const BACKOFF: Duration = Duration::from_secs(1);

struct Fixture {
    transport: Arc<StubTransport>,
    bus: Arc<MemoryBus>,
    status: ConnectionStatus,
    stop: watch::Sender<bool>,
    supervisor: Supervisor<StubTransport>,
}

fn fixture(transport: StubTransport) -> Fixture {
    let transport = Arc::new(transport);
    let bus = Arc::new(MemoryBus::new());
    let status = ConnectionStatus::new();
    let (stop, stop_rx) = watch::channel(false);
    let supervisor = Supervisor::new(
        Arc::clone(&transport),
        Arc::clone(&bus) as Arc<dyn LocalBus>,
        status.clone(),
        BACKOFF,
        stop_rx,
    );
    Fixture {
        transport,
        bus,
        status,
        stop,
        supervisor,
    }
}

fn flag(bus: &MemoryBus) -> Option<Value> {
    bus.get_param(IS_CONNECTED_KEY)
}

async fn wait_for_state(status: &ConnectionStatus, state: ConnectionState) {
    let mut rx = status.watch();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .expect("status dropped");
}

#[tokio::test(start_paused = true)]
async fn startup_takes_one_attempt_more_than_failures() {
    let f = fixture(StubTransport::failing(3));
    let start = Instant::now();

    let attempts = f.supervisor.connect_blocking().await.unwrap();

    assert_eq!(attempts, 4);
    assert_eq!(f.transport.connect_calls(), 4);
    assert!(start.elapsed() >= BACKOFF * 3);
    assert!(f.status.is_connected());
    assert_eq!(flag(&f.bus), Some(Value::Bool(true)));
}

#[tokio::test(start_paused = true)]
async fn flag_stays_false_while_broker_is_unreachable() {
    let f = fixture(StubTransport::failing(1000));

    let outcome = tokio::time::timeout(Duration::from_secs(10), f.supervisor.connect_blocking()).await;

    assert!(outcome.is_err(), "startup must keep retrying");
    assert!(f.transport.connect_calls() >= 10);
    assert!(!f.status.is_connected());
    assert_eq!(flag(&f.bus), Some(Value::Bool(false)));
}

#[tokio::test(start_paused = true)]
async fn permanent_refusals_are_retried() {
    let transport = StubTransport::new();
    transport.script_connect(Err(TransportError::Refused {
        reason: "BadUserNamePassword".to_string(),
        permanent: true,
    }));
    let f = fixture(transport);

    assert_eq!(f.supervisor.connect_blocking().await, Ok(2));
    assert!(f.status.is_connected());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_startup_backoff() {
    let f = fixture(StubTransport::failing(100));
    let stop = f.stop.clone();

    let signal = async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(f.supervisor.connect_blocking(), signal);

    assert_eq!(result, Err(SupervisorError::Shutdown));
    assert_eq!(f.transport.connect_calls(), 3);
    assert!(!f.status.is_connected());
}

#[tokio::test(start_paused = true)]
async fn dropped_link_is_reconnected_after_backoff() {
    let transport = StubTransport::new();
    transport.script_reconnect(Err(refused_port()));
    let f = fixture(transport);

    f.supervisor.connect_blocking().await.unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    f.transport.loop_start(events_tx).unwrap();
    let handle = f.supervisor.spawn(events_rx);

    f.transport.drop_link(refused_port());
    wait_for_state(&f.status, ConnectionState::Disconnected).await;
    assert_eq!(flag(&f.bus), Some(Value::Bool(false)));

    let start = Instant::now();
    wait_for_state(&f.status, ConnectionState::Connected).await;

    assert_eq!(f.transport.reconnect_calls(), 2);
    assert!(start.elapsed() >= BACKOFF * 2);
    assert_eq!(flag(&f.bus), Some(Value::Bool(true)));

    f.stop.send(true).unwrap();
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_reconnect_loop_without_attempt() {
    let f = fixture(StubTransport::new());

    f.supervisor.connect_blocking().await.unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    f.transport.loop_start(events_tx).unwrap();
    let handle = f.supervisor.spawn(events_rx);

    f.transport.drop_link(refused_port());
    wait_for_state(&f.status, ConnectionState::Disconnected).await;

    f.stop.send(true).unwrap();
    handle.shutdown().await;

    assert_eq!(f.transport.reconnect_calls(), 0);
    assert_eq!(
        f.transport.calls(),
        vec!["connect", "loop_start", "loop_stop", "disconnect"]
    );
    assert_eq!(f.status.state(), ConnectionState::Disconnected);
    assert_eq!(flag(&f.bus), Some(Value::Bool(false)));
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_loop_before_disconnecting() {
    let f = fixture(StubTransport::new());

    f.supervisor.connect_blocking().await.unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    f.transport.loop_start(events_tx).unwrap();
    let handle = f.supervisor.spawn(events_rx);

    f.stop.send(true).unwrap();
    handle.shutdown().await;

    let calls = f.transport.calls();
    assert_eq!(&calls[calls.len() - 2..], ["loop_stop", "disconnect"]);
    assert!(!f.transport.loop_running());
    assert!(!f.status.is_connected());
}

#[tokio::test(start_paused = true)]
async fn link_established_by_network_loop_is_adopted() {
    let f = fixture(StubTransport::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    f.transport.loop_start(events_tx).unwrap();
    let handle = f.supervisor.spawn(events_rx);
    assert_eq!(f.status.state(), ConnectionState::Disconnected);

    f.transport.restore_link(true);
    wait_for_state(&f.status, ConnectionState::Connected).await;

    // Disconnected -> Connected is illegal, so the cell went through Connecting.
    assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
    assert_eq!(flag(&f.bus), Some(Value::Bool(true)));
    assert_eq!(f.transport.connect_calls(), 0);
    assert_eq!(f.transport.reconnect_calls(), 0);

    f.stop.send(true).unwrap();
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn link_restored_during_backoff_ends_reconnect_loop() {
    let f = fixture(StubTransport::new());

    f.supervisor.connect_blocking().await.unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    f.transport.loop_start(events_tx).unwrap();
    let handle = f.supervisor.spawn(events_rx);

    f.transport.drop_link(refused_port());
    wait_for_state(&f.status, ConnectionState::Disconnected).await;

    f.transport.restore_link(false);
    wait_for_state(&f.status, ConnectionState::Connected).await;
    assert_eq!(flag(&f.bus), Some(Value::Bool(true)));

    tokio::time::sleep(BACKOFF * 3).await;
    assert_eq!(f.transport.reconnect_calls(), 0);
    assert_eq!(f.status.state(), ConnectionState::Connected);
    assert_eq!(flag(&f.bus), Some(Value::Bool(true)));

    f.stop.send(true).unwrap();
    handle.shutdown().await;
}
