// Device Orchestrator
// Single owner of every subsystem: strict startup ordering, status indication,
// post-boot firmware verification and the re-provisioning button watcher

use std::net::Ipv4Addr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

// Import Embassy future combinators to run the button watcher next to startup
use embassy_futures::select::{select, Either};

// Import logging macros for debug output
use log::{error, info, warn};

// Import anyhow for error handling following existing patterns
use anyhow::{Context, Result};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::DeviceSettings;
use crate::control::ControlPlane;
use crate::firmware_updater::{BootSlots, FirmwareSource, UpdateEngine};
use crate::identity::DeviceIdentity;
use crate::mqtt_client::{
    qos_from_level, Message, MessagingClient, MqttConnector, MqttError, QoS, DEFAULT_TOPIC_BASE,
};
use crate::provisioning::{Provisioner, ProvisioningTransport, WifiStation};
use crate::reset_manager::{ButtonInput, ResetManager};
use crate::status::{StatusBoard, StatusSignal};
use crate::store::{get_non_empty, CredentialStore, MQTT_NAMESPACE, TOPIC_BASE_KEY};
use crate::RestartHandle;

const PRESENCE_TOPIC: &str = "status";
const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-device HTTP server hosting the control routes.
pub trait RequestServer {
    fn start(
        &mut self,
        stack_size: usize,
        max_uri_handlers: usize,
        control: Arc<ControlPlane>,
    ) -> Result<()>;
}

/// mDNS registration of the HTTP service.
pub trait ServiceDiscovery {
    fn register(&mut self, hostname: &str, instance_name: &str) -> Result<()>;
}

/// Hardware adapters handed over by the board, each owned by exactly one subsystem.
pub struct Subsystems {
    pub provisioning: Box<dyn ProvisioningTransport>,
    pub station: Box<dyn WifiStation>,
    pub boot_slots: Box<dyn BootSlots>,
    pub firmware: Box<dyn FirmwareSource>,
    pub mqtt: Box<dyn MqttConnector>,
    pub server: Box<dyn RequestServer>,
    pub discovery: Box<dyn ServiceDiscovery>,
    pub button: Box<dyn ButtonInput>,
    pub restart: RestartHandle,
}

/// Platform bring-up, called in this order by `Device::bring_up`.
pub trait Board {
    fn mount_store(&mut self) -> Result<Arc<dyn CredentialStore>>;
    fn mac_address(&self) -> [u8; 6];
    fn init_network(&mut self, hostname: &str) -> Result<()>;
    fn init_wifi(&mut self) -> Result<()>;
    fn subsystems(&mut self, settings: &DeviceSettings) -> Result<Subsystems>;

    /// Deliver provisioning, WiFi and IP events to the provisioner.
    fn route_events(&mut self, provisioner: Arc<Provisioner>) -> Result<()>;

    /// Drive the status indicator from the board.
    fn attach_status(&mut self, status: StatusBoard) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct Presence<'a> {
    state: &'a str,
    hostname: &'a str,
    serial_number: &'a str,
    firmware_version: &'a str,
    boot_id: Uuid,
    timestamp: String,
}

pub struct Device {
    settings: DeviceSettings,
    identity: DeviceIdentity,
    status: StatusBoard,
    store: Arc<dyn CredentialStore>,
    provisioner: Arc<Provisioner>,
    updater: Arc<UpdateEngine>,
    messaging: Arc<MessagingClient>,
    control: Arc<ControlPlane>,
    server: Box<dyn RequestServer>,
    discovery: Box<dyn ServiceDiscovery>,
    watcher: Option<ResetManager>,
    _board: Box<dyn Board>, // Keeps the drivers alive
}

impl Device {
    /// Mount storage, bring up the network stack and construct every subsystem.
    pub fn bring_up(mut board: Box<dyn Board>) -> Result<Self> {
        info!("🚀 Bringing up device");

        let store = board.mount_store().context("Failed to mount credential store")?;
        let settings = DeviceSettings::load(store.as_ref());
        let identity = DeviceIdentity::load(store.as_ref(), board.mac_address());
        info!(
            "🏷️ {} ({}), MAC {}",
            identity.hostname,
            identity.serial_number,
            identity.mac_string()
        );

        board
            .init_network(&identity.hostname)
            .context("Failed to initialize network interfaces")?;
        board.init_wifi().context("Failed to initialize WiFi driver")?;

        let status = StatusBoard::new();
        let parts = board.subsystems(&settings).context("Failed to create subsystems")?;

        let updater = Arc::new(UpdateEngine::new(
            parts.boot_slots,
            parts.firmware,
            parts.restart.clone(),
        ));
        let messaging = Arc::new(MessagingClient::new(
            store.clone(),
            parts.mqtt,
            identity.hostname.clone(),
            status.pulse_handle(),
        ));
        let provisioner = Arc::new(Provisioner::new(
            parts.provisioning,
            parts.station,
            identity.service_name.clone(),
            settings.max_credential_retries,
            status.pulse_handle(),
        ));
        let control = Arc::new(ControlPlane::new(updater.clone(), parts.restart.clone()));

        board
            .route_events(provisioner.clone())
            .context("Failed to route system events")?;
        board
            .attach_status(status.clone())
            .context("Failed to attach status indicator")?;

        let fault_status = status.clone();
        messaging.on_fault(move || fault_status.set(StatusSignal::Fault));

        let watcher = ResetManager::new(
            parts.button,
            provisioner.clone(),
            status.pulse_handle(),
            parts.restart,
            settings.button.clone(),
        );

        Ok(Self {
            settings,
            identity,
            status,
            store,
            provisioner,
            updater,
            messaging,
            control,
            server: parts.server,
            discovery: parts.discovery,
            watcher: Some(watcher),
            _board: board,
        })
    }

    /// Run the startup sequence next to the re-provisioning button watcher.
    /// Only returns if startup fails.
    pub async fn run(mut self, diagnostics: impl FnOnce() -> bool) -> Result<()> {
        let Some(watcher) = self.watcher.take() else {
            return self.start(diagnostics).await.map(|_| ());
        };

        let mut watch = pin!(watcher.run());
        match select(&mut watch, self.start(diagnostics)).await {
            Either::First(()) => Ok(()),
            Either::Second(started) => {
                started?;
                watch.await;
                Ok(())
            }
        }
    }

    /// Provisioning, discovery, HTTP server, verification decision and
    /// messaging, in that order. `diagnostics` decides whether a freshly
    /// installed image is kept.
    pub async fn start(&mut self, diagnostics: impl FnOnce() -> bool) -> Result<Ipv4Addr> {
        self.status.set(StatusSignal::Provisioning);
        let proof_of_possession = self
            .settings
            .proof_of_possession
            .as_deref()
            .unwrap_or(&self.identity.proof_of_possession);
        let ip = self
            .provisioner
            .provision(&self.settings.country_code, proof_of_possession)
            .await
            .context("Provisioning failed")?;
        self.status.set(StatusSignal::Connected);

        if let Err(e) = self
            .discovery
            .register(&self.identity.hostname, &self.settings.mdns_instance_name)
        {
            warn!("⚠️ mDNS registration failed: {:#}", e);
        }

        if let Err(e) = self.server.start(
            self.settings.http_stack_size,
            self.settings.http_max_uri_handlers,
            self.control.clone(),
        ) {
            error!("❌ Failed to start HTTP server: {:#}", e);
        }

        if self.updater.pending_verification() {
            if diagnostics() {
                info!("✅ Diagnostics passed, keeping the new firmware");
                if let Err(e) = self.updater.commit() {
                    error!("❌ Failed to commit firmware: {}", e);
                }
            } else {
                error!("❌ Diagnostics failed, rolling back");
                self.updater.rollback();
            }
        }

        if let Err(e) = self.start_messaging() {
            warn!("⚠️ Messaging unavailable: {}", e);
        }

        info!("✅ Device started at {}", ip);
        Ok(ip)
    }

    fn start_messaging(&self) -> std::result::Result<(), MqttError> {
        // The will is fixed at connect time, so its topic comes straight from NVS
        let base = get_non_empty(self.store.as_ref(), MQTT_NAMESPACE, TOPIC_BASE_KEY)?
            .unwrap_or_else(|| DEFAULT_TOPIC_BASE.to_string());
        let presence_topic = format!("{}{}", base, PRESENCE_TOPIC);

        let last_will = if self.settings.presence {
            self.presence_message("offline", &presence_topic)
        } else {
            None
        };

        self.messaging.init(
            last_will,
            Duration::from_secs(self.settings.keep_alive_seconds),
        )?;

        if self.settings.presence {
            if let Some(birth) = self.presence_message("online", &presence_topic) {
                self.messaging.set_birth_message(birth);
            }
        }

        for subscription in &self.settings.subscriptions {
            self.add_subscription(&subscription.topic, true, qos_from_level(subscription.qos));
        }

        self.messaging.start()
    }

    fn presence_message(&self, state: &str, topic: &str) -> Option<Message> {
        let presence = Presence {
            state,
            hostname: &self.identity.hostname,
            serial_number: &self.identity.serial_number,
            firmware_version: FIRMWARE_VERSION,
            boot_id: self.identity.boot_id,
            timestamp: Utc::now().to_rfc3339(),
        };

        match serde_json::to_vec(&presence) {
            Ok(payload) => Some(Message {
                topic: topic.to_string(),
                payload,
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            Err(e) => {
                warn!("⚠️ Failed to encode presence message: {}", e);
                None
            }
        }
    }

    /// Publish with QoS 1, not retained.
    pub fn publish(&self, topic: &str, payload: &[u8], prefixed: bool) -> std::result::Result<(), MqttError> {
        self.publish_with(topic, payload, prefixed, QoS::AtLeastOnce, false)
    }

    pub fn publish_with(
        &self,
        topic: &str,
        payload: &[u8],
        prefixed: bool,
        qos: QoS,
        retain: bool,
    ) -> std::result::Result<(), MqttError> {
        let topic = self.topic(topic, prefixed);
        self.messaging.publish(&topic, payload, qos, retain)
    }

    pub fn add_subscription(&self, topic: &str, prefixed: bool, qos: QoS) {
        let topic = self.topic(topic, prefixed);
        self.messaging.add_subscription(&topic, qos);
    }

    fn topic(&self, topic: &str, prefixed: bool) -> String {
        if prefixed {
            self.messaging.prefixed(topic)
        } else {
            topic.to_string()
        }
    }

    pub fn topic_base(&self) -> String {
        self.messaging.topic_base()
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn updater(&self) -> &Arc<UpdateEngine> {
        &self.updater
    }

    pub fn messaging(&self) -> &Arc<MessagingClient> {
        &self.messaging
    }
}
