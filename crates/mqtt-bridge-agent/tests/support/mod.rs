//! Scripted transport shared by the agent tests.

#![allow(dead_code)]

use mqtt_bridge_agent::{InboundMessage, LinkEvent, Transport, TransportError};
use mqtt_bridge_core::topic;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport whose connect outcomes are scripted.
///
/// Unscripted attempts succeed.
#[derive(Default)]
pub struct StubTransport {
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    reconnect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    routes: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    calls: Mutex<Vec<&'static str>>,
    connect_calls: AtomicU32,
    reconnect_calls: AtomicU32,
    loopback: AtomicBool,
    fail_publish: AtomicBool,
    publish_attempts: AtomicU32,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` connect attempts with a connection error.
    pub fn failing(n: usize) -> Self {
        let stub = Self::new();
        for _ in 0..n {
            stub.script_connect(Err(refused_port()));
        }
        stub
    }

    pub fn script_connect(&self, outcome: Result<(), TransportError>) {
        self.connect_script.lock().unwrap().push_back(outcome);
    }

    pub fn script_reconnect(&self, outcome: Result<(), TransportError>) {
        self.reconnect_script.lock().unwrap().push_back(outcome);
    }

    /// Deliver our own publishes to matching subscriptions, like a broker.
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Make every publish fail until cleared.
    pub fn set_publish_failure(&self, enabled: bool) {
        self.fail_publish.store(enabled, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> u32 {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn loop_running(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    /// Report a lost connection from the network loop.
    pub fn drop_link(&self, error: TransportError) {
        self.send(LinkEvent::Disconnected { error });
    }

    /// Report a connection the network loop established on its own.
    pub fn restore_link(&self, session_present: bool) {
        self.send(LinkEvent::Connected { session_present });
    }

    /// Deliver a publish from the broker.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        let routes = self.routes.lock().unwrap();
        for (filter, tx) in routes.iter() {
            if topic::matches(topic, filter) {
                let _ = tx.try_send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn send(&self, event: LinkEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

impl Transport for StubTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.record("connect");
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.connect_script.lock().unwrap().pop_front();
        outcome.unwrap_or(Ok(()))
    }

    fn reconnect(&self) {
        self.record("reconnect");
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.reconnect_script.lock().unwrap().pop_front();
        match outcome.unwrap_or(Ok(())) {
            Ok(()) => self.send(LinkEvent::Connected {
                session_present: false,
            }),
            Err(error) => self.send(LinkEvent::Disconnected { error }),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record("disconnect");
        Ok(())
    }

    fn loop_start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        self.record("loop_start");
        let mut slot = self.events.lock().unwrap();
        if slot.is_some() {
            return Err(TransportError::LoopRunning);
        }
        *slot = Some(events);
        Ok(())
    }

    async fn loop_stop(&self) {
        self.record("loop_stop");
        self.events.lock().unwrap().take();
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("request queue closed".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        if self.loopback.load(Ordering::SeqCst) {
            self.inject(topic, payload);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        queue_size: usize,
    ) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        topic::validate_filter(filter)
            .map_err(|e| TransportError::Subscribe(format!("{filter}: {e}")))?;
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        self.routes.lock().unwrap().push((filter.to_string(), tx));
        Ok(rx)
    }
}

pub fn refused_port() -> TransportError {
    TransportError::Connection("connection refused".to_string())
}

/// Poll `condition` until it holds, failing after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Give spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
