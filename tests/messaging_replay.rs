use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use embassy_futures::block_on;

use pup_coordinator::mqtt_client::{
    BrokerConfig, EventSink, MessagingClient, MessagingSession, MqttConnector, MqttError,
    MqttErrorKind, MqttEvent, MqttTransport, QoS,
};
use pup_coordinator::orchestrator::Device;
use pup_coordinator::sim::{RecordingMqtt, SimBoard, WireCall};
use pup_coordinator::status::{StatusBoard, StatusSignal};
use pup_coordinator::store::{
    MemoryStore, BROKER_KEY, MQTT_NAMESPACE, SETTINGS_KEY, SYSTEM_NAMESPACE, TOPIC_BASE_KEY,
};

fn broker_store() -> MemoryStore {
    MemoryStore::new()
        .with(MQTT_NAMESPACE, BROKER_KEY, "mqtts://broker.example.com")
        .with(MQTT_NAMESPACE, TOPIC_BASE_KEY, "pups/kitchen/")
}

fn client_with_status(connector: impl MqttConnector + 'static) -> (Arc<MessagingClient>, StatusBoard) {
    let status = StatusBoard::new();
    let client = Arc::new(MessagingClient::new(
        Arc::new(broker_store()),
        Box::new(connector),
        "pup-a1b20c".to_string(),
        status.pulse_handle(),
    ));
    client.init(None, Duration::from_secs(120)).unwrap();
    client.start().unwrap();
    (client, status)
}

fn started_client(mqtt: &RecordingMqtt) -> Arc<MessagingClient> {
    client_with_status(mqtt.clone()).0
}

/// Broker client that holds a single API lock for wire calls and while it
/// delivers events, the way esp-mqtt does.
#[derive(Clone, Default)]
struct LockingBroker {
    api: Arc<Mutex<()>>,
    sink: Arc<Mutex<Option<EventSink>>>,
    published: Arc<Mutex<Vec<String>>>,
}

impl LockingBroker {
    /// Deliver an event; the caller is expected to hold `api`.
    fn dispatch(&self, event: MqttEvent) {
        let sink = self.sink.lock().unwrap().clone().unwrap();
        sink(event);
    }
}

impl MqttConnector for LockingBroker {
    fn connect(
        &self,
        _config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Arc<dyn MqttTransport>, MqttError> {
        *self.sink.lock().unwrap() = Some(events);
        Ok(Arc::new(self.clone()))
    }
}

impl MqttTransport for LockingBroker {
    fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<(), MqttError> {
        let _api = self.api.lock().unwrap();
        Ok(())
    }

    fn publish(&self, topic: &str, _qos: QoS, _retain: bool, _payload: &[u8]) -> Result<(), MqttError> {
        let _api = self.api.lock().unwrap();
        self.published.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn replay_preserves_insertion_order_across_reconnects() {
    let mqtt = RecordingMqtt::new();
    let client = started_client(&mqtt);
    client.add_subscription("a/#", QoS::AtLeastOnce);
    client.add_subscription("b", QoS::AtMostOnce);

    mqtt.emit(MqttEvent::Connected);
    mqtt.emit(MqttEvent::Disconnected);
    assert_eq!(client.session(), MessagingSession::Disconnected);
    mqtt.emit(MqttEvent::Connected);

    let expected = vec![
        ("a/#".to_string(), QoS::AtLeastOnce),
        ("b".to_string(), QoS::AtMostOnce),
    ];
    let calls = mqtt.subscribe_calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[..2], expected[..]);
    assert_eq!(calls[2..], expected[..]);
}

#[test]
fn subscriptions_added_while_connected_join_the_next_replay() {
    let mqtt = RecordingMqtt::new();
    let client = started_client(&mqtt);
    client.add_subscription("first", QoS::AtLeastOnce);
    mqtt.emit(MqttEvent::Connected);

    client.add_subscription("second", QoS::ExactlyOnce);
    assert_eq!(mqtt.subscribe_calls().len(), 1);

    mqtt.clear_calls();
    mqtt.emit(MqttEvent::Disconnected);
    mqtt.emit(MqttEvent::Connected);

    assert_eq!(
        mqtt.subscribe_calls(),
        vec![
            ("first".to_string(), QoS::AtLeastOnce),
            ("second".to_string(), QoS::ExactlyOnce),
        ]
    );
}

#[test]
fn faulted_client_ignores_every_later_event() {
    let mqtt = RecordingMqtt::new();
    let (client, status) = client_with_status(mqtt.clone());
    client.add_subscription("a/#", QoS::AtLeastOnce);
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    client.on_message(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    mqtt.emit(MqttEvent::Error(MqttErrorKind::Transport(
        "connection reset by peer".to_string(),
    )));
    assert_eq!(client.session(), MessagingSession::Faulted);

    mqtt.emit(MqttEvent::Connected);
    mqtt.emit(MqttEvent::Received {
        topic: "pups/kitchen/cmd".to_string(),
        payload: b"bark".to_vec(),
    });
    mqtt.emit(MqttEvent::Published);
    mqtt.emit(MqttEvent::Disconnected);

    assert_eq!(client.session(), MessagingSession::Faulted);
    assert!(mqtt.calls().is_empty());
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(status.try_next_pulse(), None);
}

#[test]
fn connection_errors_are_recovered_by_the_next_connect() {
    let mqtt = RecordingMqtt::new();
    let client = started_client(&mqtt);
    client.add_subscription("a/#", QoS::AtLeastOnce);
    mqtt.emit(MqttEvent::Connected);
    mqtt.clear_calls();

    mqtt.emit(MqttEvent::Error(MqttErrorKind::Connection(
        "TCP transport error".to_string(),
    )));
    mqtt.emit(MqttEvent::Disconnected);
    assert_eq!(client.session(), MessagingSession::Disconnected);

    // The broker stays unreachable for a while
    mqtt.emit(MqttEvent::Error(MqttErrorKind::Connection(
        "connection refused".to_string(),
    )));
    mqtt.emit(MqttEvent::Connected);

    assert_eq!(client.session(), MessagingSession::Connected);
    assert_eq!(
        mqtt.subscribe_calls(),
        vec![("a/#".to_string(), QoS::AtLeastOnce)]
    );
    client.publish("t", b"x", QoS::AtMostOnce, false).unwrap();
}

#[test]
fn publish_does_not_block_event_delivery() {
    let broker = LockingBroker::default();
    let (client, _status) = client_with_status(broker.clone());
    client.handle_event(MqttEvent::Connected);

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    client.on_message(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (api_held_tx, api_held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let dispatcher = {
        let broker = broker.clone();
        let done = done_tx.clone();
        std::thread::spawn(move || {
            let _api = broker.api.lock().unwrap();
            api_held_tx.send(()).unwrap();
            // Let the publisher reach the wire call first
            std::thread::sleep(Duration::from_millis(50));
            broker.dispatch(MqttEvent::Received {
                topic: "pups/kitchen/cmd".to_string(),
                payload: b"sit".to_vec(),
            });
            done.send("dispatch").unwrap();
        })
    };

    let publisher = {
        let client = client.clone();
        std::thread::spawn(move || {
            api_held_rx.recv().unwrap();
            let result = client.publish("pups/kitchen/events", b"{}", QoS::AtLeastOnce, false);
            done_tx.send(if result.is_ok() { "publish" } else { "publish failed" }).unwrap();
        })
    };

    let mut finished = Vec::new();
    for _ in 0..2 {
        let step = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("publish and event delivery blocked each other");
        finished.push(step);
    }
    dispatcher.join().unwrap();
    publisher.join().unwrap();

    finished.sort();
    assert_eq!(finished, vec!["dispatch", "publish"]);
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(*broker.published.lock().unwrap(), vec!["pups/kitchen/events".to_string()]);
}

#[test]
fn device_publishes_presence_and_prefixes_topics() {
    let store = broker_store().with(
        SYSTEM_NAMESPACE,
        SETTINGS_KEY,
        r#"{"subscriptions":[{"topic":"cmd/#"},{"topic":"ota","qos":0}]}"#,
    );
    let board = SimBoard::new(true).with_store(store);
    let mut device = Device::bring_up(Box::new(board.clone())).unwrap();

    block_on(device.start(|| true)).unwrap();
    wait_until("MQTT connect", || {
        device.messaging().session() == MessagingSession::Connected
    });

    assert_eq!(device.topic_base(), "pups/kitchen/");

    let config = board.mqtt.last_config().unwrap();
    let will = config.last_will.unwrap();
    assert_eq!(will.topic, "pups/kitchen/status");
    assert!(will.retain);
    let will_body: serde_json::Value = serde_json::from_slice(&will.payload).unwrap();
    assert_eq!(will_body["state"], "offline");
    assert_eq!(will_body["hostname"], "pup-a1b20c");

    let calls = board.mqtt.calls();
    assert_eq!(
        calls[..2],
        [
            WireCall::Subscribe("pups/kitchen/cmd/#".to_string(), QoS::AtLeastOnce),
            WireCall::Subscribe("pups/kitchen/ota".to_string(), QoS::AtMostOnce),
        ]
    );
    match &calls[2] {
        WireCall::Publish {
            topic,
            payload,
            retain,
            ..
        } => {
            assert_eq!(topic, "pups/kitchen/status");
            assert!(*retain);
            let birth: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert_eq!(birth["state"], "online");
            assert_eq!(birth["boot_id"], device.identity().boot_id.to_string());
        }
        other => panic!("expected birth message, got {:?}", other),
    }

    board.mqtt.clear_calls();
    device.publish("events", b"{\"bark\":1}", true).unwrap();
    device
        .publish_with("raw/topic", b"x", false, QoS::AtMostOnce, false)
        .unwrap();

    let topics: Vec<String> = board
        .mqtt
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            WireCall::Publish { topic, .. } => Some(topic),
            WireCall::Subscribe(..) => None,
        })
        .collect();
    assert_eq!(topics, vec!["pups/kitchen/events", "raw/topic"]);
}

#[test]
fn transport_fault_turns_the_status_indicator_to_fault() {
    let board = SimBoard::new(true).with_store(broker_store());
    let mut device = Device::bring_up(Box::new(board.clone())).unwrap();
    block_on(device.start(|| true)).unwrap();
    wait_until("MQTT connect", || {
        device.messaging().session() == MessagingSession::Connected
    });

    board
        .mqtt
        .emit(MqttEvent::Error(MqttErrorKind::Transport("tls alert".to_string())));

    assert_eq!(device.status().current(), StatusSignal::Fault);
    assert_eq!(device.provisioner().state(), pup_coordinator::provisioning::ProvisioningState::Connected);
    assert!(device.publish("events", b"x", true).is_err());
}
