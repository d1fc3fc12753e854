// Provisioning Coordinator
// Out-of-band (BLE) WiFi credential exchange, station (re)connection and retry escalation
// Driven by provisioning manager, WiFi and IP events delivered from the system event loop

use std::net::Ipv4Addr;
use std::sync::Mutex;

// Import Embassy's one-shot signal used to release the pending provision call
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

// Import logging macros for debug output
use log::{debug, error, info, warn};

use crate::lock;
use crate::status::{Pulse, StatusPulse};

// Custom 128-bit GATT service UUID for the provisioning endpoint (LSB to MSB)
pub const PROVISIONING_SERVICE_UUID: [u8; 16] = [
    0xb4, 0xdf, 0x5a, 0x1c, 0x3f, 0x6b, 0xf4, 0xbf, //
    0xea, 0x4a, 0x82, 0x03, 0x04, 0x90, 0x1a, 0x02,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unprovisioned,                  // No session yet, or the last one was reset
    AwaitingCredentials,            // BLE session advertising, waiting for a phone
    Connecting,                     // Station has credentials and is associating
    Connected,                      // IP address acquired
    CredentialFailureRetrying(u32), // Association failed this many times in a row
    ResetRequested,                 // Credentials wiped, restart pending
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailureReason {
    AuthError,
    ApNotFound,
}

/// Everything the system event loop can tell the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningEvent {
    // Provisioning manager
    SessionStarted,
    CredentialsReceived { ssid: String },
    CredentialFailure(CredentialFailureReason),
    CredentialSuccess,
    SessionEnded,

    // BLE transport and secure session
    TransportConnected,
    TransportDisconnected,
    SecureSessionEstablished,
    InvalidSecurityParams,
    CredentialsMismatch,

    // WiFi station and IP stack
    StationStarted,
    StationDisconnected,
    GotIp(Ipv4Addr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningError {
    Transport(String),
    Station(String),
}

impl std::fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningError::Transport(msg) => write!(f, "provisioning transport error: {}", msg),
            ProvisioningError::Station(msg) => write!(f, "WiFi station error: {}", msg),
        }
    }
}

impl std::error::Error for ProvisioningError {}

/// Out-of-band credential exchange (the BLE provisioning manager).
pub trait ProvisioningTransport: Send {
    /// Whether station credentials are already stored.
    fn is_provisioned(&mut self) -> Result<bool, ProvisioningError>;

    /// Advertise a secured (proof-of-possession) provisioning session.
    fn start_session(
        &mut self,
        service_name: &str,
        proof_of_possession: &str,
        service_uuid: &[u8; 16],
    ) -> Result<(), ProvisioningError>;

    /// Re-arm the session state machine after repeated credential failures.
    fn reset_session_on_failure(&mut self) -> Result<(), ProvisioningError>;

    /// Wipe the stored station credentials.
    fn clear_credentials(&mut self) -> Result<(), ProvisioningError>;

    /// Release the provisioning manager once it is no longer needed.
    fn end_session(&mut self);
}

/// WiFi station interface.
pub trait WifiStation: Send {
    fn set_country(&mut self, country_code: &str) -> Result<(), ProvisioningError>;
    fn start(&mut self) -> Result<(), ProvisioningError>;
    fn connect(&mut self) -> Result<(), ProvisioningError>;
}

struct Inner {
    state: ProvisioningState,
    retries: u32,
    awaiting_ip: bool, // A provision call is waiting for its first IP event
    transport: Box<dyn ProvisioningTransport>,
    station: Box<dyn WifiStation>,
}

/// Owns the provisioning state machine.
///
/// Event delivery (`handle_event`) and application calls share one lock, so the
/// system event loop and application tasks never race on the state.
pub struct Provisioner {
    inner: Mutex<Inner>,
    connected: Signal<CriticalSectionRawMutex, Ipv4Addr>,
    service_name: String,
    max_retries: u32,
    status: StatusPulse,
}

impl Provisioner {
    pub fn new(
        transport: Box<dyn ProvisioningTransport>,
        station: Box<dyn WifiStation>,
        service_name: String,
        max_retries: u32,
        status: StatusPulse,
    ) -> Self {
        info!(
            "📶 Creating provisioner '{}' (max {} credential retries)",
            service_name, max_retries
        );

        Self {
            inner: Mutex::new(Inner {
                state: ProvisioningState::Unprovisioned,
                retries: 0,
                awaiting_ip: false,
                transport,
                station,
            }),
            connected: Signal::new(),
            service_name,
            max_retries: max_retries.max(1),
            status,
        }
    }

    /// Bring the station online, provisioning credentials over BLE first when
    /// none are stored. Completes once an IP address has been acquired.
    pub async fn provision(
        &self,
        country_code: &str,
        proof_of_possession: &str,
    ) -> Result<Ipv4Addr, ProvisioningError> {
        {
            let mut inner = lock(&self.inner);

            if let Err(e) = inner.station.set_country(country_code) {
                warn!("⚠️ Failed to set country code '{}': {}", country_code, e);
            }

            // Armed before anything can produce an IP event, the signal keeps
            // the address if it arrives before we start waiting
            self.connected.reset();
            inner.awaiting_ip = true;

            if inner.transport.is_provisioned()? {
                info!("✅ Already provisioned, starting Wi-Fi STA");
                inner.transport.end_session();
                inner.state = ProvisioningState::Connecting;
                inner.station.start()?;
            } else {
                info!(
                    "🔵 Starting BLE provisioning as '{}'",
                    self.service_name
                );
                inner.retries = 0;
                inner
                    .transport
                    .start_session(&self.service_name, proof_of_possession, &PROVISIONING_SERVICE_UUID)?;
            }
        }

        let ip = self.connected.wait().await;
        info!("🌐 Provisioning complete, station IP {}", ip);
        Ok(ip)
    }

    /// Clear stored credentials and re-arm for a future `provision` call.
    /// Does not restart the device.
    pub fn reset_provisioning(&self) -> Result<(), ProvisioningError> {
        let mut inner = lock(&self.inner);
        Self::clear(&mut inner)
    }

    /// Clear credentials and park the state machine until the restart that
    /// must follow.
    pub fn factory_reset(&self) -> Result<(), ProvisioningError> {
        let mut inner = lock(&self.inner);
        let result = Self::clear(&mut inner);
        inner.state = ProvisioningState::ResetRequested;
        result
    }

    fn clear(inner: &mut Inner) -> Result<(), ProvisioningError> {
        info!("🧹 Resetting provisioning state");
        inner.transport.clear_credentials()?;
        inner.retries = 0;
        inner.state = ProvisioningState::Unprovisioned;
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        match lock(&self.inner).transport.is_provisioned() {
            Ok(provisioned) => provisioned,
            Err(e) => {
                error!("❌ Failed to query provisioning status: {}", e);
                false
            }
        }
    }

    pub fn state(&self) -> ProvisioningState {
        lock(&self.inner).state
    }

    pub fn retries(&self) -> u32 {
        lock(&self.inner).retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Entry point for the system event loop.
    pub fn handle_event(&self, event: ProvisioningEvent) {
        let mut inner = lock(&self.inner);

        if inner.state == ProvisioningState::ResetRequested {
            debug!("Reset pending, ignoring {:?}", event);
            return;
        }

        match event {
            ProvisioningEvent::SessionStarted => {
                info!("🔵 Provisioning session started");
                inner.state = ProvisioningState::AwaitingCredentials;
            }
            ProvisioningEvent::CredentialsReceived { ssid } => {
                info!("📥 Received Wi-Fi credentials for SSID '{}'", ssid);
                inner.state = ProvisioningState::Connecting;
            }
            ProvisioningEvent::CredentialFailure(reason) => {
                self.on_credential_failure(&mut inner, reason);
            }
            ProvisioningEvent::CredentialSuccess => {
                info!("✅ Provisioning successful");
                inner.retries = 0;
            }
            ProvisioningEvent::SessionEnded => {
                debug!("Provisioning session ended, releasing manager");
                inner.transport.end_session();
            }
            ProvisioningEvent::TransportConnected => info!("📱 BLE transport: Connected!"),
            ProvisioningEvent::TransportDisconnected => info!("📱 BLE transport: Disconnected!"),
            ProvisioningEvent::SecureSessionEstablished => info!("🔒 Secured session established!"),
            ProvisioningEvent::InvalidSecurityParams => {
                error!("❌ Received invalid security parameters for establishing secure session!")
            }
            ProvisioningEvent::CredentialsMismatch => {
                error!("❌ Received incorrect username and/or PoP for establishing secure session!")
            }
            ProvisioningEvent::StationStarted => {
                Self::connect_station(&mut inner);
            }
            ProvisioningEvent::StationDisconnected => {
                info!("📡 Disconnected. Connecting to the AP again...");
                self.status.pulse(Pulse::WifiDropped);
                if inner.state == ProvisioningState::Connected {
                    inner.state = ProvisioningState::Connecting;
                }
                // No backoff: the station is the only way back onto the network
                Self::connect_station(&mut inner);
            }
            ProvisioningEvent::GotIp(ip) => {
                info!("🌐 Connected with IP Address: {}", ip);
                inner.state = ProvisioningState::Connected;
                if std::mem::take(&mut inner.awaiting_ip) {
                    self.connected.signal(ip);
                }
            }
        }
    }

    fn on_credential_failure(&self, inner: &mut Inner, reason: CredentialFailureReason) {
        let reason = match reason {
            CredentialFailureReason::AuthError => "Wi-Fi station authentication failed",
            CredentialFailureReason::ApNotFound => "Wi-Fi access-point not found",
        };

        inner.retries += 1;
        error!(
            "❌ Provisioning failed ({} of {}): {}",
            inner.retries, self.max_retries, reason
        );

        if inner.retries >= self.max_retries {
            warn!("🔄 Failed to connect with provisioned AP, resetting provisioned credentials");
            if let Err(e) = inner.transport.reset_session_on_failure() {
                error!("❌ Failed to reset provisioning session: {}", e);
            }
            inner.retries = 0;
            inner.state = ProvisioningState::Unprovisioned;
        } else {
            inner.state = ProvisioningState::CredentialFailureRetrying(inner.retries);
        }
    }

    fn connect_station(inner: &mut Inner) {
        if let Err(e) = inner.station.connect() {
            warn!("⚠️ Station connect request failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRadio;
    use crate::status::StatusBoard;
    use embassy_futures::block_on;
    use std::sync::Arc;
    use std::time::Duration;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

    fn provisioner(radio: &SimRadio, max_retries: u32) -> Provisioner {
        Provisioner::new(
            Box::new(radio.transport()),
            Box::new(radio.station()),
            "PROV_A1B2C3".to_string(),
            max_retries,
            StatusBoard::new().pulse_handle(),
        )
    }

    fn wait_for_state(prov: &Provisioner, wanted: ProvisioningState) {
        for _ in 0..2000 {
            if prov.state() == wanted {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("provisioner never reached {:?}", wanted);
    }

    #[test]
    fn retry_counter_never_reaches_the_bound() {
        let radio = SimRadio::new(false);
        let prov = provisioner(&radio, 3);

        for _ in 0..10 {
            prov.handle_event(ProvisioningEvent::CredentialFailure(
                CredentialFailureReason::AuthError,
            ));
            assert!(prov.retries() < prov.max_retries());
            if let ProvisioningState::CredentialFailureRetrying(count) = prov.state() {
                assert!(count < prov.max_retries());
            }
        }
    }

    #[test]
    fn fifth_failure_resets_to_unprovisioned() {
        let radio = SimRadio::new(false);
        let prov = provisioner(&radio, 5);

        for attempt in 1..5 {
            prov.handle_event(ProvisioningEvent::CredentialFailure(
                CredentialFailureReason::ApNotFound,
            ));
            assert_eq!(
                prov.state(),
                ProvisioningState::CredentialFailureRetrying(attempt)
            );
        }

        prov.handle_event(ProvisioningEvent::CredentialFailure(
            CredentialFailureReason::AuthError,
        ));

        assert_eq!(prov.state(), ProvisioningState::Unprovisioned);
        assert_eq!(prov.retries(), 0);
        assert_eq!(radio.log().failure_resets, 1);
    }

    #[test]
    fn credential_success_clears_the_counter() {
        let radio = SimRadio::new(false);
        let prov = provisioner(&radio, 5);

        prov.handle_event(ProvisioningEvent::CredentialFailure(
            CredentialFailureReason::AuthError,
        ));
        prov.handle_event(ProvisioningEvent::CredentialSuccess);

        assert_eq!(prov.retries(), 0);
    }

    #[test]
    fn reset_twice_equals_reset_once() {
        let radio = SimRadio::new(true);
        let prov = provisioner(&radio, 5);
        prov.handle_event(ProvisioningEvent::GotIp(IP));

        prov.reset_provisioning().unwrap();
        let once = (prov.state(), prov.retries(), prov.is_provisioned());
        prov.reset_provisioning().unwrap();
        let twice = (prov.state(), prov.retries(), prov.is_provisioned());

        assert_eq!(once, twice);
        assert_eq!(once, (ProvisioningState::Unprovisioned, 0, false));
    }

    #[test]
    fn session_events_walk_through_the_states() {
        let radio = SimRadio::new(false);
        let prov = provisioner(&radio, 5);

        prov.handle_event(ProvisioningEvent::SessionStarted);
        assert_eq!(prov.state(), ProvisioningState::AwaitingCredentials);

        prov.handle_event(ProvisioningEvent::CredentialsReceived {
            ssid: "home".to_string(),
        });
        assert_eq!(prov.state(), ProvisioningState::Connecting);

        prov.handle_event(ProvisioningEvent::GotIp(IP));
        assert_eq!(prov.state(), ProvisioningState::Connected);

        prov.handle_event(ProvisioningEvent::SessionEnded);
        assert_eq!(radio.log().sessions_ended, 1);
    }

    #[test]
    fn every_disconnect_reissues_a_connect() {
        let radio = SimRadio::new(true);
        let prov = provisioner(&radio, 5);
        prov.handle_event(ProvisioningEvent::GotIp(IP));

        for _ in 0..3 {
            prov.handle_event(ProvisioningEvent::StationDisconnected);
        }

        assert_eq!(radio.log().connects, 3);
        assert_eq!(prov.state(), ProvisioningState::Connecting);
    }

    #[test]
    fn provisioned_device_starts_the_station_directly() {
        let radio = SimRadio::new(true);
        let prov = Arc::new(provisioner(&radio, 5));

        let events = prov.clone();
        let delivery = std::thread::spawn(move || {
            wait_for_state(&events, ProvisioningState::Connecting);
            events.handle_event(ProvisioningEvent::StationStarted);
            events.handle_event(ProvisioningEvent::GotIp(IP));
        });

        let ip = block_on(prov.provision("CH", "secret")).unwrap();
        delivery.join().unwrap();

        let log = radio.log();
        assert_eq!(ip, IP);
        assert_eq!(log.station_starts, 1);
        assert_eq!(log.connects, 1);
        assert!(log.sessions_started.is_empty());
        assert_eq!(log.country.as_deref(), Some("CH"));
    }

    #[test]
    fn unprovisioned_device_advertises_a_ble_session() {
        let radio = SimRadio::new(false);
        let prov = Arc::new(provisioner(&radio, 5));

        let events = prov.clone();
        let log = radio.clone();
        let delivery = std::thread::spawn(move || {
            while log.log().sessions_started.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
            events.handle_event(ProvisioningEvent::SessionStarted);
            events.handle_event(ProvisioningEvent::CredentialsReceived {
                ssid: "home".to_string(),
            });
            events.handle_event(ProvisioningEvent::GotIp(IP));
        });

        let ip = block_on(prov.provision("CH", "secret")).unwrap();
        delivery.join().unwrap();

        assert_eq!(ip, IP);
        assert_eq!(
            radio.log().sessions_started,
            vec![("PROV_A1B2C3".to_string(), "secret".to_string())]
        );
    }

    #[test]
    fn reconnect_ip_does_not_release_twice() {
        let radio = SimRadio::new(true);
        let prov = Arc::new(provisioner(&radio, 5));

        let events = prov.clone();
        let delivery = std::thread::spawn(move || {
            wait_for_state(&events, ProvisioningState::Connecting);
            events.handle_event(ProvisioningEvent::GotIp(IP));
            events.handle_event(ProvisioningEvent::StationDisconnected);
            events.handle_event(ProvisioningEvent::GotIp(Ipv4Addr::new(10, 0, 0, 9)));
        });

        block_on(prov.provision("CH", "secret")).unwrap();
        delivery.join().unwrap();

        // The second address never reached the signal
        assert!(!prov.connected.signaled());
    }

    #[test]
    fn factory_reset_freezes_the_state() {
        let radio = SimRadio::new(true);
        let prov = provisioner(&radio, 5);

        prov.factory_reset().unwrap();
        prov.handle_event(ProvisioningEvent::GotIp(IP));

        assert_eq!(prov.state(), ProvisioningState::ResetRequested);
        assert!(!prov.is_provisioned());
    }
}
