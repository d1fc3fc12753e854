// Device Settings Module
// Compile-time defaults with an optional JSON override stored in NVS

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::store::{CredentialStore, SETTINGS_KEY, SYSTEM_NAMESPACE};

// Provisioning defaults
const DEFAULT_COUNTRY_CODE: &str = "CH";
const DEFAULT_MAX_CREDENTIAL_RETRIES: u32 = 5;

// Re-provisioning button timings
const DEFAULT_BUTTON_POLL_MS: u64 = 100;
const DEFAULT_BUTTON_DEBOUNCE_MS: u64 = 50;
const DEFAULT_BUTTON_HOLD_MS: u64 = 10_000;
const DEFAULT_RESET_GRACE_MS: u64 = 2_000; // Indicator stays on before credentials are wiped
const DEFAULT_RESTART_GRACE_MS: u64 = 500;

const DEFAULT_KEEP_ALIVE_SECONDS: u64 = 120;
const DEFAULT_HTTP_STACK_SIZE: usize = 8 * 1024;
const DEFAULT_HTTP_MAX_URI_HANDLERS: usize = 32;
const DEFAULT_UPDATE_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonTiming {
    pub poll_ms: u64,
    pub debounce_ms: u64,
    pub hold_ms: u64,
    pub reset_grace_ms: u64,
    pub restart_grace_ms: u64,
}

impl Default for ButtonTiming {
    fn default() -> Self {
        Self {
            poll_ms: DEFAULT_BUTTON_POLL_MS,
            debounce_ms: DEFAULT_BUTTON_DEBOUNCE_MS,
            hold_ms: DEFAULT_BUTTON_HOLD_MS,
            reset_grace_ms: DEFAULT_RESET_GRACE_MS,
            restart_grace_ms: DEFAULT_RESTART_GRACE_MS,
        }
    }
}

/// Subscription requested at boot, relative to the topic base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSetting {
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub country_code: String,
    pub proof_of_possession: Option<String>, // Replaces the per-device value when set
    pub max_credential_retries: u32,
    pub button: ButtonTiming,
    pub keep_alive_seconds: u64,
    pub http_stack_size: usize,
    pub http_max_uri_handlers: usize,
    pub mdns_instance_name: String,
    pub update_buffer_size: usize,
    pub presence: bool, // Publish retained online/offline status messages
    pub subscriptions: Vec<SubscriptionSetting>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            proof_of_possession: None,
            max_credential_retries: DEFAULT_MAX_CREDENTIAL_RETRIES,
            button: ButtonTiming::default(),
            keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            http_stack_size: DEFAULT_HTTP_STACK_SIZE,
            http_max_uri_handlers: DEFAULT_HTTP_MAX_URI_HANDLERS,
            mdns_instance_name: "Pup Device".to_string(),
            update_buffer_size: DEFAULT_UPDATE_BUFFER_SIZE,
            presence: true,
            subscriptions: Vec::new(),
        }
    }
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<()> {
        if self.country_code.len() != 2 || !self.country_code.is_ascii() {
            return Err(anyhow!(
                "Country code must be two ASCII letters, got '{}'",
                self.country_code
            ));
        }

        if self.proof_of_possession.as_deref() == Some("") {
            return Err(anyhow!("Proof of possession cannot be empty"));
        }

        if self.max_credential_retries == 0 {
            return Err(anyhow!("Credential retry bound must be at least 1"));
        }

        if self.button.poll_ms == 0 || self.button.hold_ms <= self.button.debounce_ms {
            return Err(anyhow!(
                "Button hold time must exceed the debounce time and polling must be non-zero"
            ));
        }

        if self.update_buffer_size < 512 {
            return Err(anyhow!("Update buffer must be at least 512 bytes"));
        }

        if let Some(bad) = self.subscriptions.iter().find(|s| s.qos > 2) {
            return Err(anyhow!("Invalid QoS {} for '{}'", bad.qos, bad.topic));
        }

        Ok(())
    }

    /// Defaults, overridden by `system/settings` when it holds valid JSON.
    pub fn load(store: &dyn CredentialStore) -> Self {
        match store.get_str(SYSTEM_NAMESPACE, SETTINGS_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<DeviceSettings>(&json) {
                Ok(settings) => match settings.validate() {
                    Ok(()) => {
                        info!("⚙️ Loaded device settings override from NVS");
                        settings
                    }
                    Err(e) => {
                        warn!("⚠️ Ignoring stored settings: {}", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("⚠️ Failed to parse stored settings: {}", e);
                    Self::default()
                }
            },
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("⚠️ Could not read stored settings: {}", e);
                Self::default()
            }
        }
    }
}
