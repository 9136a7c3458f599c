use mqtt_bridge_agent::config::parse_broker_url;
use mqtt_bridge_agent::{BridgeConfig, Direction, RouteConfig, Runtime};
use mqtt_bridge_bus::{LocalBus, MemoryBus};
use mqtt_bridge_core::ConnectionState;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_message_reaches_private_topic_on_broker() {
    if std::env::var("MQTT_BRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set MQTT_BRIDGE_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("MQTT_BRIDGE_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_broker_url(&broker).unwrap();
    let prefix = format!("it-{}", Uuid::new_v4().simple());

    let mut sub_opts = MqttOptions::new(format!("sub-{}", Uuid::new_v4()), host.clone(), port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client
        .subscribe(format!("{prefix}/state"), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut config = BridgeConfig::default();
    config.mqtt.connection.host = host;
    config.mqtt.connection.port = port;
    config.mqtt.private_path = prefix;
    config.serializer = "json:dumps".to_string();
    config.bridge = vec![RouteConfig::new(
        "~status",
        "~state",
        Direction::LocalToRemote,
        "std_msgs/String",
    )];

    let bus = Arc::new(MemoryBus::new());
    let local: Arc<dyn LocalBus> = Arc::clone(&bus) as Arc<dyn LocalBus>;
    let runtime = Runtime::from_config(config, local);
    let status = runtime.status().clone();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        let mut watch = status.watch();
        timeout(
            Duration::from_secs(5),
            watch.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .expect("timeout waiting for broker connection")
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        bus.publish("status", json!({"data": "online"})).unwrap();

        let received = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timeout waiting for MQTT message")
            .expect("subscriber dropped");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&received).unwrap(),
            json!({"data": "online"})
        );

        stop_tx.send(()).unwrap();
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let (result, ()) = tokio::join!(runtime.run(shutdown), driver);

    result.unwrap();
    assert!(!status.is_connected());
}
