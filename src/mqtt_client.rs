// MQTT Messaging Client Module
// Broker configuration from NVS, subscription replay on every (re)connect and topic prefixing
// A transport-fatal error leaves the client permanently Faulted
// Wire calls are made without holding the client lock: the underlying client
// may hold its own lock while it delivers events to us

use std::sync::{Arc, Mutex};
use std::time::Duration;

// Import logging macros for debug output with consistent emoji prefixes
use log::{debug, error, info, warn};

pub use embedded_svc::mqtt::client::QoS;

use crate::lock;
use crate::status::{Pulse, StatusPulse};
use crate::store::{
    get_non_empty, CredentialStore, StoreError, BROKER_KEY, MQTT_NAMESPACE, PASSWORD_KEY,
    TOPIC_BASE_KEY, USERNAME_KEY,
};

// Used by `prefixed` until a topic base has been read from NVS
pub const DEFAULT_TOPIC_BASE: &str = "esp/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingSession {
    Disconnected,
    Connected,
    Faulted,
}

/// Outbound message, also used for the last will and the birth message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

pub type LastWill = Message;

#[derive(Debug, Clone, PartialEq)]
pub enum MqttErrorKind {
    Connection(String), // Failed connect or dropped socket, the client reconnects on its own
    Protocol(String),
    Transport(String), // The client cannot continue, fatal
}

/// Lifecycle events reported by the underlying client.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Received { topic: String, payload: Vec<u8> },
    Published,
    Error(MqttErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MqttError {
    MissingConfig(&'static str),
    NotInitialized,
    NotConnected,
    Faulted,
    Store(StoreError),
    Client(String),
}

impl std::fmt::Display for MqttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttError::MissingConfig(key) => write!(f, "missing MQTT configuration '{}'", key),
            MqttError::NotInitialized => write!(f, "MQTT client is not initialized"),
            MqttError::NotConnected => write!(f, "MQTT client is not connected"),
            MqttError::Faulted => write!(f, "MQTT client is faulted"),
            MqttError::Store(e) => write!(f, "MQTT configuration unavailable: {}", e),
            MqttError::Client(msg) => write!(f, "MQTT client error: {}", msg),
        }
    }
}

impl std::error::Error for MqttError {}

impl From<StoreError> for MqttError {
    fn from(e: StoreError) -> Self {
        MqttError::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub uri: String,
    pub client_id: String,
    pub credentials: Option<(String, String)>, // Username and password, both non-empty
    pub last_will: Option<LastWill>,
    pub keep_alive: Duration,
}

pub type EventSink = Arc<dyn Fn(MqttEvent) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type FaultHandler = Arc<dyn Fn() + Send + Sync>;

/// Creates the underlying client and starts its connection attempts.
pub trait MqttConnector: Send + Sync {
    fn connect(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Arc<dyn MqttTransport>, MqttError>;
}

/// Wire operations of a started client.
///
/// Called from application tasks and from inside the event sink, so
/// implementations must be safe to enter while an event is being delivered.
pub trait MqttTransport: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), MqttError>;
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

struct Inner {
    session: MessagingSession,
    config: Option<BrokerConfig>,
    topic_base: String,
    subscriptions: Vec<(String, QoS)>, // Insertion order is replay order
    transport: Option<Arc<dyn MqttTransport>>,
    starting: bool,
    birth: Option<Message>,
    on_message: Option<MessageHandler>,
    on_fault: Option<FaultHandler>,
}

pub struct MessagingClient {
    inner: Mutex<Inner>,
    store: Arc<dyn CredentialStore>,
    connector: Box<dyn MqttConnector>,
    client_id: String,
    status: StatusPulse,
}

impl MessagingClient {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Box<dyn MqttConnector>,
        client_id: String,
        status: StatusPulse,
    ) -> Self {
        info!("🔌 Creating MQTT client (client_id: {})", client_id);

        Self {
            inner: Mutex::new(Inner {
                session: MessagingSession::Disconnected,
                config: None,
                topic_base: DEFAULT_TOPIC_BASE.to_string(),
                subscriptions: Vec::new(),
                transport: None,
                starting: false,
                birth: None,
                on_message: None,
                on_fault: None,
            }),
            store,
            connector,
            client_id,
            status,
        }
    }

    /// Read the broker configuration from NVS and record the last will.
    pub fn init(&self, last_will: Option<LastWill>, keep_alive: Duration) -> Result<(), MqttError> {
        let store = self.store.as_ref();

        let uri = get_non_empty(store, MQTT_NAMESPACE, BROKER_KEY)?.ok_or_else(|| {
            error!("❌ Failed to read broker from NVS");
            MqttError::MissingConfig(BROKER_KEY)
        })?;

        let username = get_non_empty(store, MQTT_NAMESPACE, USERNAME_KEY)?;
        let password = get_non_empty(store, MQTT_NAMESPACE, PASSWORD_KEY)?;

        let topic_base = get_non_empty(store, MQTT_NAMESPACE, TOPIC_BASE_KEY)?.ok_or_else(|| {
            error!("❌ Failed to read topic base from NVS");
            MqttError::MissingConfig(TOPIC_BASE_KEY)
        })?;

        info!("🌐 MQTT URI: {}", uri);
        debug!("MQTT topic base: {}", topic_base);

        let mut inner = lock(&self.inner);
        inner.topic_base = topic_base;
        inner.config = Some(BrokerConfig {
            uri,
            client_id: self.client_id.clone(),
            credentials: username.zip(password),
            last_will,
            keep_alive,
        });
        Ok(())
    }

    /// Create the underlying client and let it connect in the background.
    pub fn start(self: &Arc<Self>) -> Result<(), MqttError> {
        let config = {
            let mut inner = lock(&self.inner);

            if inner.session == MessagingSession::Faulted {
                return Err(MqttError::Faulted);
            }
            if inner.transport.is_some() || inner.starting {
                warn!("⚠️ MQTT client already started");
                return Ok(());
            }
            let config = inner.config.clone().ok_or(MqttError::NotInitialized)?;
            inner.starting = true;
            config
        };

        // Weak so the event sink held by the native client does not keep us alive
        let client = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(client) = client.upgrade() {
                client.handle_event(event);
            }
        });

        let transport = match self.connector.connect(&config, sink) {
            Ok(transport) => transport,
            Err(e) => {
                lock(&self.inner).starting = false;
                return Err(e);
            }
        };

        let replay = {
            let mut inner = lock(&self.inner);
            inner.starting = false;
            inner.transport = Some(transport);
            // A Connected event that arrived before the transport was stored skipped its replay
            if inner.session == MessagingSession::Connected {
                Replay::take(&inner)
            } else {
                None
            }
        };
        info!("🚀 MQTT started");

        if let Some(replay) = replay {
            replay.run();
        }
        Ok(())
    }

    /// Queue a subscription; it reaches the broker on the next connect.
    pub fn add_subscription(&self, topic: &str, qos: QoS) {
        debug!("Queueing subscription {} ({:?})", topic, qos);
        lock(&self.inner)
            .subscriptions
            .push((topic.to_string(), qos));
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), MqttError> {
        let transport = {
            let inner = lock(&self.inner);

            match inner.session {
                MessagingSession::Connected => {}
                MessagingSession::Faulted => return Err(MqttError::Faulted),
                MessagingSession::Disconnected => return Err(MqttError::NotConnected),
            }

            inner.transport.clone().ok_or(MqttError::NotInitialized)?
        };

        transport.publish(topic, qos, retain, payload)
    }

    pub fn prefixed(&self, topic: &str) -> String {
        format!("{}{}", lock(&self.inner).topic_base, topic)
    }

    pub fn topic_base(&self) -> String {
        lock(&self.inner).topic_base.clone()
    }

    /// Retained message published after each subscription replay.
    pub fn set_birth_message(&self, message: Message) {
        lock(&self.inner).birth = Some(message);
    }

    pub fn on_message(&self, handler: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        lock(&self.inner).on_message = Some(Arc::new(handler));
    }

    /// Called once, when the client becomes Faulted.
    pub fn on_fault(&self, handler: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner).on_fault = Some(Arc::new(handler));
    }

    pub fn session(&self) -> MessagingSession {
        lock(&self.inner).session
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.inner).subscriptions.clone()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner).config.is_some()
    }

    /// Entry point for the client's event callback.
    pub fn handle_event(&self, event: MqttEvent) {
        let mut inner = lock(&self.inner);

        if inner.session == MessagingSession::Faulted {
            debug!("MQTT client faulted, dropping {:?}", event);
            return;
        }

        match event {
            MqttEvent::Connected => {
                info!("✅ MQTT connected");
                inner.session = MessagingSession::Connected;
                let replay = Replay::take(&inner);
                drop(inner);
                match replay {
                    Some(replay) => replay.run(),
                    None => debug!("Connected before the client finished starting"),
                }
            }
            MqttEvent::Disconnected => {
                warn!("📡 MQTT disconnected");
                inner.session = MessagingSession::Disconnected;
            }
            MqttEvent::Received { topic, payload } => {
                debug!("📨 MQTT data on {} ({} bytes)", topic, payload.len());
                self.status.pulse(Pulse::MessageReceived);
                let handler = inner.on_message.clone();
                drop(inner);
                if let Some(handler) = handler {
                    handler(&topic, &payload);
                }
            }
            MqttEvent::Published => {
                self.status.pulse(Pulse::MessagePublished);
            }
            MqttEvent::Error(MqttErrorKind::Connection(detail)) => {
                warn!("📡 MQTT connection error, waiting for reconnect: {}", detail);
            }
            MqttEvent::Error(MqttErrorKind::Protocol(detail)) => {
                warn!("⚠️ MQTT error: {}", detail);
            }
            MqttEvent::Error(MqttErrorKind::Transport(detail)) => {
                error!("❌ MQTT transport error, client is now faulted: {}", detail);
                inner.session = MessagingSession::Faulted;
                let handler = inner.on_fault.clone();
                drop(inner);
                if let Some(handler) = handler {
                    handler();
                }
            }
        }
    }
}

/// Wire calls owed to the broker after a connect, taken out of the lock.
struct Replay {
    transport: Arc<dyn MqttTransport>,
    subscriptions: Vec<(String, QoS)>,
    birth: Option<Message>,
}

impl Replay {
    fn take(inner: &Inner) -> Option<Self> {
        Some(Self {
            transport: inner.transport.clone()?,
            subscriptions: inner.subscriptions.clone(),
            birth: inner.birth.clone(),
        })
    }

    fn run(self) {
        for (topic, qos) in &self.subscriptions {
            info!("📨 Subscribing to {}", topic);
            if let Err(e) = self.transport.subscribe(topic, *qos) {
                error!("❌ Failed to subscribe to {}: {}", topic, e);
            }
        }

        if let Some(birth) = &self.birth {
            if let Err(e) = self
                .transport
                .publish(&birth.topic, birth.qos, birth.retain, &birth.payload)
            {
                warn!("⚠️ Failed to publish birth message: {}", e);
            }
        }
    }
}
