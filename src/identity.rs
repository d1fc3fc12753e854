use log::{info, warn};
use uuid::Uuid;

use crate::store::{get_non_empty, CredentialStore, HOSTNAME_KEY, POP_KEY, SYSTEM_NAMESPACE};

const SERVICE_NAME_PREFIX: &str = "PROV_";
const POP_LENGTH: usize = 8;

/// Who this device is for the lifetime of the process.
///
/// Read once at startup; changing the stored hostname takes effect after a
/// restart.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub service_name: String, // BLE provisioning advertisement name
    pub serial_number: String,
    pub proof_of_possession: String, // Unique per device, survives factory reset
    pub mac_address: [u8; 6],
    pub boot_id: Uuid,
}

impl DeviceIdentity {
    pub fn load(store: &dyn CredentialStore, mac: [u8; 6]) -> Self {
        let hostname = match get_non_empty(store, SYSTEM_NAMESPACE, HOSTNAME_KEY) {
            Ok(Some(hostname)) => {
                info!("🏷️ Hostname : {}", hostname);
                hostname
            }
            Ok(None) => default_hostname(&mac),
            Err(e) => {
                warn!("Failed to read hostname from NVS: {}", e);
                default_hostname(&mac)
            }
        };

        Self {
            hostname,
            service_name: service_name(&mac),
            serial_number: serial_number(&mac),
            proof_of_possession: load_proof_of_possession(store, &mac),
            mac_address: mac,
            boot_id: Uuid::new_v4(),
        }
    }

    pub fn mac_string(&self) -> String {
        let m = &self.mac_address;
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// The stored proof of possession, or a fresh random one that is persisted
/// on first boot.
fn load_proof_of_possession(store: &dyn CredentialStore, mac: &[u8; 6]) -> String {
    match get_non_empty(store, SYSTEM_NAMESPACE, POP_KEY) {
        Ok(Some(pop)) => return pop,
        Ok(None) => {}
        Err(e) => warn!("Failed to read proof of possession from NVS: {}", e),
    }

    let mut pop = Uuid::new_v4().simple().to_string();
    pop.truncate(POP_LENGTH);

    match store.set_str(SYSTEM_NAMESPACE, POP_KEY, &pop) {
        Ok(()) => info!("🔑 Generated proof of possession for {}: {}", service_name(mac), pop),
        Err(e) => warn!("⚠️ Proof of possession not persisted, valid until restart: {}", e),
    }
    pop
}

/// Provisioning service name advertised over BLE, e.g. `PROV_A1B2C3`.
pub fn service_name(mac: &[u8; 6]) -> String {
    format!(
        "{}{:02X}{:02X}{:02X}",
        SERVICE_NAME_PREFIX, mac[3], mac[4], mac[5]
    )
}

pub fn default_hostname(mac: &[u8; 6]) -> String {
    format!("pup-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
}

pub fn serial_number(mac: &[u8; 6]) -> String {
    format!(
        "ESP32-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
