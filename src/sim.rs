// Host simulation adapters
// In-memory stand-ins for every hardware port, used by the tests and the host binary
// Adapters share a `Journal` so startup ordering can be observed from the outside

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::config::DeviceSettings;
use crate::control::{ControlError, ControlPlane, ROUTES};
use crate::firmware_updater::{BootSlots, FirmwareSource, ImageState, SlotWriter, UpdateError};
use crate::lock;
use crate::mqtt_client::{BrokerConfig, EventSink, MqttConnector, MqttError, MqttEvent, MqttTransport, QoS};
use crate::orchestrator::{Board, RequestServer, ServiceDiscovery, Subsystems};
use crate::provisioning::{Provisioner, ProvisioningError, ProvisioningEvent, ProvisioningTransport, WifiStation};
use crate::reset_manager::ButtonInput;
use crate::status::StatusBoard;
use crate::store::{CredentialStore, MemoryStore};
use crate::Restart;

// Chunk size used when streaming canned firmware images
const FIRMWARE_CHUNK: usize = 4096;

/// Ordered record of externally visible steps.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: &str) {
        debug!("📝 {}", entry);
        lock(&self.entries).push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Position of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }
}

// ---------------------------------------------------------------------------
// Provisioning transport and WiFi station
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningLog {
    pub provisioned: bool,
    pub country: Option<String>,
    pub sessions_started: Vec<(String, String)>, // Service name and proof of possession
    pub sessions_ended: u32,
    pub failure_resets: u32,
    pub credential_clears: u32,
    pub station_starts: u32,
    pub connects: u32,
}

struct Automation {
    provisioner: Weak<Provisioner>,
    ip: Ipv4Addr,
    ssid: String,
}

struct RadioShared {
    log: Mutex<ProvisioningLog>,
    automation: Mutex<Option<Automation>>,
}

/// BLE provisioning manager plus WiFi station.
///
/// Without automation it only records calls; once `automate` is called it
/// answers like a phone and an access point would, from a separate thread.
#[derive(Clone)]
pub struct SimRadio {
    shared: Arc<RadioShared>,
    journal: Journal,
}

impl SimRadio {
    pub fn new(provisioned: bool) -> Self {
        Self {
            shared: Arc::new(RadioShared {
                log: Mutex::new(ProvisioningLog {
                    provisioned,
                    ..ProvisioningLog::default()
                }),
                automation: Mutex::new(None),
            }),
            journal: Journal::new(),
        }
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn transport(&self) -> SimProvisioning {
        SimProvisioning { radio: self.clone() }
    }

    pub fn station(&self) -> SimStation {
        SimStation { radio: self.clone() }
    }

    pub fn log(&self) -> ProvisioningLog {
        lock(&self.shared.log).clone()
    }

    pub fn automate(&self, provisioner: &Arc<Provisioner>, ip: Ipv4Addr) {
        *lock(&self.shared.automation) = Some(Automation {
            provisioner: Arc::downgrade(provisioner),
            ip,
            ssid: "pup-home".to_string(),
        });
    }

    fn automated(&self) -> Option<(Weak<Provisioner>, Ipv4Addr, String)> {
        lock(&self.shared.automation)
            .as_ref()
            .map(|a| (a.provisioner.clone(), a.ip, a.ssid.clone()))
    }

    // Delivered from another thread: the coordinator calls us with its lock held
    fn deliver(&self, before: impl FnOnce(&RadioShared) + Send + 'static, events: Vec<ProvisioningEvent>) {
        let Some((provisioner, _, _)) = self.automated() else {
            return;
        };
        let shared = self.shared.clone();

        std::thread::spawn(move || {
            before(&shared);
            if let Some(provisioner) = provisioner.upgrade() {
                for event in events {
                    provisioner.handle_event(event);
                }
            }
        });
    }
}

pub struct SimProvisioning {
    radio: SimRadio,
}

impl ProvisioningTransport for SimProvisioning {
    fn is_provisioned(&mut self) -> Result<bool, ProvisioningError> {
        Ok(lock(&self.radio.shared.log).provisioned)
    }

    fn start_session(
        &mut self,
        service_name: &str,
        proof_of_possession: &str,
        _service_uuid: &[u8; 16],
    ) -> Result<(), ProvisioningError> {
        lock(&self.radio.shared.log)
            .sessions_started
            .push((service_name.to_string(), proof_of_possession.to_string()));
        self.radio.journal.record("prov.session");

        let ssid = self
            .radio
            .automated()
            .map(|(_, _, ssid)| ssid)
            .unwrap_or_default();
        self.radio.deliver(
            |shared| lock(&shared.log).provisioned = true,
            vec![
                ProvisioningEvent::SessionStarted,
                ProvisioningEvent::TransportConnected,
                ProvisioningEvent::SecureSessionEstablished,
                ProvisioningEvent::CredentialsReceived { ssid },
                ProvisioningEvent::StationStarted,
                ProvisioningEvent::CredentialSuccess,
                ProvisioningEvent::TransportDisconnected,
                ProvisioningEvent::SessionEnded,
            ],
        );
        Ok(())
    }

    fn reset_session_on_failure(&mut self) -> Result<(), ProvisioningError> {
        lock(&self.radio.shared.log).failure_resets += 1;
        Ok(())
    }

    fn clear_credentials(&mut self) -> Result<(), ProvisioningError> {
        let mut log = lock(&self.radio.shared.log);
        log.provisioned = false;
        log.credential_clears += 1;
        Ok(())
    }

    fn end_session(&mut self) {
        lock(&self.radio.shared.log).sessions_ended += 1;
    }
}

pub struct SimStation {
    radio: SimRadio,
}

impl WifiStation for SimStation {
    fn set_country(&mut self, country_code: &str) -> Result<(), ProvisioningError> {
        lock(&self.radio.shared.log).country = Some(country_code.to_string());
        Ok(())
    }

    fn start(&mut self) -> Result<(), ProvisioningError> {
        lock(&self.radio.shared.log).station_starts += 1;
        self.radio.journal.record("wifi.start");
        self.radio
            .deliver(|_| {}, vec![ProvisioningEvent::StationStarted]);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), ProvisioningError> {
        let provisioned = {
            let mut log = lock(&self.radio.shared.log);
            log.connects += 1;
            log.provisioned
        };

        if let Some((_, ip, _)) = self.radio.automated() {
            if provisioned {
                self.radio.deliver(|_| {}, vec![ProvisioningEvent::GotIp(ip)]);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Boot slots and firmware download
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BootLog {
    pub running: ImageState,
    pub next_boot: Option<Vec<u8>>, // Image selected for the next boot
    pub aborted: u32,
}

#[derive(Clone)]
pub struct MemoryBootSlots {
    shared: Arc<Mutex<BootLog>>,
    capacity: Option<usize>, // Flash writes past this many bytes fail
    journal: Journal,
}

impl MemoryBootSlots {
    pub fn new(running: ImageState) -> Self {
        Self {
            shared: Arc::new(Mutex::new(BootLog {
                running,
                next_boot: None,
                aborted: 0,
            })),
            capacity: None,
            journal: Journal::new(),
        }
    }

    /// Slots whose writes fail once `capacity` bytes have been staged.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn snapshot(&self) -> BootLog {
        lock(&self.shared).clone()
    }
}

struct MemorySlotWriter {
    shared: Arc<Mutex<BootLog>>,
    staged: Vec<u8>,
    capacity: Option<usize>,
}

impl SlotWriter for MemorySlotWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        if let Some(capacity) = self.capacity {
            if self.staged.len() + chunk.len() > capacity {
                return Err(UpdateError::Flash(format!(
                    "slot full after {} bytes",
                    self.staged.len()
                )));
            }
        }
        self.staged.extend_from_slice(chunk);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), UpdateError> {
        if self.staged.is_empty() {
            return Err(UpdateError::Flash("image is empty".to_string()));
        }
        lock(&self.shared).next_boot = Some(self.staged);
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<(), UpdateError> {
        lock(&self.shared).aborted += 1;
        Ok(())
    }
}

impl BootSlots for MemoryBootSlots {
    fn running_state(&mut self) -> Result<ImageState, UpdateError> {
        Ok(lock(&self.shared).running)
    }

    fn begin_update(&mut self) -> Result<Box<dyn SlotWriter + '_>, UpdateError> {
        Ok(Box::new(MemorySlotWriter {
            shared: self.shared.clone(),
            staged: Vec::new(),
            capacity: self.capacity,
        }))
    }

    fn mark_valid(&mut self) -> Result<(), UpdateError> {
        lock(&self.shared).running = ImageState::Valid;
        self.journal.record("ota.mark_valid");
        Ok(())
    }

    fn mark_invalid(&mut self) -> Result<(), UpdateError> {
        lock(&self.shared).running = ImageState::Invalid;
        self.journal.record("ota.mark_invalid");
        Ok(())
    }
}

#[derive(Clone)]
struct CannedResponse {
    status: u16,
    body: Vec<u8>,
    drop_after: Option<usize>, // Connection drops after this many chunks
}

/// Firmware server answering from a fixed table of URLs.
#[derive(Clone, Default)]
pub struct CannedFirmwareServer {
    routes: Arc<Mutex<HashMap<String, CannedResponse>>>,
    requests: Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>,
}

impl CannedFirmwareServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(self, url: &str, status: u16, body: Vec<u8>, drop_after: Option<usize>) -> Self {
        lock(&self.routes).insert(
            url.to_string(),
            CannedResponse {
                status,
                body,
                drop_after,
            },
        );
        self
    }

    pub fn with_image(self, url: &str, image: Vec<u8>) -> Self {
        self.route(url, 200, image, None)
    }

    /// Serves the first `chunks` chunks of `image`, then drops the connection.
    pub fn with_dropped_image(self, url: &str, image: Vec<u8>, chunks: usize) -> Self {
        self.route(url, 200, image, Some(chunks))
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.route(url, status, Vec::new(), None)
    }

    /// Every request seen so far, with its headers.
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        lock(&self.requests).clone()
    }
}

impl FirmwareSource for CannedFirmwareServer {
    fn fetch(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        sink: &mut dyn FnMut(&[u8]) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        lock(&self.requests).push((url.to_string(), headers.to_vec()));

        let route = lock(&self.routes).get(url).cloned();
        let response =
            route.ok_or_else(|| UpdateError::Transport(format!("no route to {}", url)))?;

        if !(200..300).contains(&response.status) {
            return Err(UpdateError::HttpStatus(response.status));
        }

        for (index, chunk) in response.body.chunks(FIRMWARE_CHUNK).enumerate() {
            if response.drop_after == Some(index) {
                return Err(UpdateError::Transport("connection reset".to_string()));
            }
            sink(chunk)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WireCall {
    Subscribe(String, QoS),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
}

#[derive(Default)]
struct MqttShared {
    calls: Vec<WireCall>,
    configs: Vec<BrokerConfig>,
    sink: Option<EventSink>,
    auto_connect: bool,
}

/// Broker connection that records every wire call.
#[derive(Clone, Default)]
pub struct RecordingMqtt {
    shared: Arc<Mutex<MqttShared>>,
    journal: Journal,
}

impl RecordingMqtt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `Connected` as soon as the client is started.
    pub fn auto_connecting() -> Self {
        let mqtt = Self::default();
        lock(&mqtt.shared).auto_connect = true;
        mqtt
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn calls(&self) -> Vec<WireCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WireCall::Subscribe(topic, qos) => Some((topic, qos)),
                WireCall::Publish { .. } => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    pub fn last_config(&self) -> Option<BrokerConfig> {
        lock(&self.shared).configs.last().cloned()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared).sink.is_some()
    }

    /// Feed an event through the client's callback, as the broker would.
    pub fn emit(&self, event: MqttEvent) {
        let sink = lock(&self.shared).sink.clone();
        match sink {
            Some(sink) => sink(event),
            None => warn!("MQTT client not started, dropping {:?}", event),
        }
    }
}

impl MqttConnector for RecordingMqtt {
    fn connect(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Arc<dyn MqttTransport>, MqttError> {
        let auto_connect = {
            let mut shared = lock(&self.shared);
            shared.configs.push(config.clone());
            shared.sink = Some(events.clone());
            shared.auto_connect
        };
        self.journal.record("mqtt.connect");

        if auto_connect {
            // Delivered from another thread, as the broker's task would
            std::thread::spawn(move || events(MqttEvent::Connected));
        }

        Ok(Arc::new(RecordingTransport {
            shared: self.shared.clone(),
        }))
    }
}

struct RecordingTransport {
    shared: Arc<Mutex<MqttShared>>,
}

impl MqttTransport for RecordingTransport {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        lock(&self.shared)
            .calls
            .push(WireCall::Subscribe(topic.to_string(), qos));
        Ok(())
    }

    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), MqttError> {
        lock(&self.shared).calls.push(WireCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Restart, button, HTTP server, mDNS
// ---------------------------------------------------------------------------

/// Unwind payload standing in for a device restart.
#[derive(Debug)]
pub struct RestartRequested;

/// Restart that unwinds the calling thread; catch it with `catch_unwind`.
#[derive(Default)]
pub struct UnwindingRestart {
    count: AtomicUsize,
    journal: Journal,
}

impl UnwindingRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journaled(journal: &Journal) -> Self {
        Self {
            count: AtomicUsize::new(0),
            journal: journal.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Restart for UnwindingRestart {
    fn restart(&self) -> ! {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.journal.record("restart");
        warn!("🔄 Simulated restart");
        std::panic::resume_unwind(Box::new(RestartRequested))
    }
}

/// Whether a `catch_unwind` outcome is a simulated restart.
pub fn restart_requested<T>(outcome: std::thread::Result<T>) -> bool {
    match outcome {
        Ok(_) => false,
        Err(payload) => payload.downcast_ref::<RestartRequested>().is_some(),
    }
}

/// Restart for the host binary: ends the process.
pub struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self) -> ! {
        info!("🔄 Restart requested, exiting simulation");
        std::process::exit(0)
    }
}

#[derive(Clone)]
pub struct SimButton {
    pressed: Arc<AtomicBool>,
}

impl SimButton {
    pub fn released() -> Self {
        Self {
            pressed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn held() -> Self {
        Self {
            pressed: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_pressed(&self, pressed: bool) {
        self.pressed.store(pressed, Ordering::SeqCst);
    }
}

impl ButtonInput for SimButton {
    fn is_pressed(&mut self) -> bool {
        self.pressed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ServerShared {
    started: Option<(usize, usize)>,
    control: Option<Arc<ControlPlane>>,
}

/// Request server that dispatches in-process `post` calls to the control routes.
#[derive(Clone, Default)]
pub struct SimServer {
    shared: Arc<Mutex<ServerShared>>,
    journal: Journal,
}

impl SimServer {
    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    /// Stack size and route count the server was started with.
    pub fn started_with(&self) -> Option<(usize, usize)> {
        lock(&self.shared).started
    }

    /// Status and body of the reply to a POST request.
    pub fn post(&self, path: &str, body: &[u8]) -> (u16, String) {
        let control = lock(&self.shared).control.clone();
        let Some(control) = control else {
            return (503, "Server not started".to_string());
        };
        let Some((_, route)) = ROUTES.iter().find(|(p, _)| *p == path) else {
            return (404, "Not found".to_string());
        };

        let mut reply = None;
        let result = control.serve(*route, body, &mut |status, text| {
            reply = Some((status, text.to_string()));
            Ok(())
        });

        match (reply, result) {
            (Some(reply), _) => reply,
            (None, Err(e)) => (500, e.to_string()),
            (None, Ok(())) => (500, ControlError::Reply("no reply".to_string()).to_string()),
        }
    }
}

impl RequestServer for SimServer {
    fn start(&mut self, stack_size: usize, max_uri_handlers: usize, control: Arc<ControlPlane>) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.started = Some((stack_size, max_uri_handlers));
        shared.control = Some(control);
        self.journal.record("httpd.start");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SimDiscovery {
    registrations: Arc<Mutex<Vec<(String, String)>>>,
    failing: bool,
    journal: Journal,
}

impl SimDiscovery {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        lock(&self.registrations).clone()
    }
}

impl ServiceDiscovery for SimDiscovery {
    fn register(&mut self, hostname: &str, instance_name: &str) -> Result<()> {
        self.journal.record("mdns.register");
        if self.failing {
            return Err(anyhow!("mDNS responder unavailable"));
        }
        lock(&self.registrations).push((hostname.to_string(), instance_name.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub const SIM_MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0xa1, 0xb2, 0x0c];
pub const SIM_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

/// Complete simulated device. Clones share every adapter, so a test can keep
/// one clone for inspection while the device owns another.
#[derive(Clone)]
pub struct SimBoard {
    pub store: Arc<MemoryStore>,
    pub radio: SimRadio,
    pub slots: MemoryBootSlots,
    pub firmware: CannedFirmwareServer,
    pub mqtt: RecordingMqtt,
    pub server: SimServer,
    pub discovery: SimDiscovery,
    pub button: SimButton,
    pub restart: Arc<dyn Restart>,
    pub journal: Journal,
    status: Arc<Mutex<Option<StatusBoard>>>,
}

impl SimBoard {
    pub fn new(provisioned: bool) -> Self {
        let journal = Journal::new();
        Self {
            store: Arc::new(MemoryStore::new()),
            radio: SimRadio::new(provisioned).journaled(&journal),
            slots: MemoryBootSlots::new(ImageState::Valid).journaled(&journal),
            firmware: CannedFirmwareServer::new(),
            mqtt: RecordingMqtt::auto_connecting().journaled(&journal),
            server: SimServer::default().journaled(&journal),
            discovery: SimDiscovery::default().journaled(&journal),
            button: SimButton::released(),
            restart: Arc::new(UnwindingRestart::journaled(&journal)),
            journal,
            status: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn with_boot_state(mut self, running: ImageState) -> Self {
        self.slots = MemoryBootSlots::new(running).journaled(&self.journal);
        self
    }

    pub fn with_mqtt(mut self, mqtt: RecordingMqtt) -> Self {
        self.mqtt = mqtt.journaled(&self.journal);
        self
    }

    pub fn with_discovery(mut self, discovery: SimDiscovery) -> Self {
        self.discovery = discovery.journaled(&self.journal);
        self
    }

    pub fn with_restart(mut self, restart: Arc<dyn Restart>) -> Self {
        self.restart = restart;
        self
    }

    /// Status board attached by the orchestrator, once bring-up got that far.
    pub fn status(&self) -> Option<StatusBoard> {
        lock(&self.status).clone()
    }
}

impl Board for SimBoard {
    fn mount_store(&mut self) -> Result<Arc<dyn CredentialStore>> {
        self.journal.record("store.mount");
        Ok(self.store.clone())
    }

    fn mac_address(&self) -> [u8; 6] {
        SIM_MAC
    }

    fn init_network(&mut self, hostname: &str) -> Result<()> {
        info!("🌐 Simulated netif up as '{}'", hostname);
        self.journal.record("netif.init");
        Ok(())
    }

    fn init_wifi(&mut self) -> Result<()> {
        self.journal.record("wifi.init");
        Ok(())
    }

    fn subsystems(&mut self, _settings: &DeviceSettings) -> Result<Subsystems> {
        self.journal.record("subsystems");
        Ok(Subsystems {
            provisioning: Box::new(self.radio.transport()),
            station: Box::new(self.radio.station()),
            boot_slots: Box::new(self.slots.clone()),
            firmware: Box::new(self.firmware.clone()),
            mqtt: Box::new(self.mqtt.clone()),
            server: Box::new(self.server.clone()),
            discovery: Box::new(self.discovery.clone()),
            button: Box::new(self.button.clone()),
            restart: self.restart.clone(),
        })
    }

    fn route_events(&mut self, provisioner: Arc<Provisioner>) -> Result<()> {
        self.radio.automate(&provisioner, SIM_IP);
        self.journal.record("events.route");
        Ok(())
    }

    fn attach_status(&mut self, status: StatusBoard) -> Result<()> {
        *lock(&self.status) = Some(status);
        self.journal.record("status.attach");
        Ok(())
    }
}
