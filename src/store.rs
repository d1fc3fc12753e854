// Credential Store Module
// Typed key/value access to persistent configuration, grouped by namespace
// Every operation opens the namespace, works on it and closes it again

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

// Import logging macros for debug output
use log::{debug, warn};

use crate::lock;

// NVS namespaces and keys consumed by the coordination core
pub const MQTT_NAMESPACE: &str = "mqtt";
pub const SYSTEM_NAMESPACE: &str = "system";

pub const BROKER_KEY: &str = "broker"; // Broker URI, mandatory for messaging
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const TOPIC_BASE_KEY: &str = "topic-base"; // Prefix for all application topics
pub const HOSTNAME_KEY: &str = "hostname";
pub const SETTINGS_KEY: &str = "settings"; // JSON override for DeviceSettings
pub const POP_KEY: &str = "pop"; // Per-device provisioning proof of possession

// NVS limits namespace and key names to 15 characters
pub const MAX_KEY_LENGTH: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotMounted,
    InvalidKey(String),
    ValueTooLarge { key: String, len: usize },
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotMounted => write!(f, "credential store is not mounted"),
            StoreError::InvalidKey(key) => write!(f, "invalid namespace or key: '{}'", key),
            StoreError::ValueTooLarge { key, len } => {
                write!(f, "value for '{}' is too large ({} bytes)", key, len)
            }
            StoreError::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent configuration store.
///
/// Implementations open the namespace for each call and close it before
/// returning; writes are durably committed before `Ok` is reported.
pub trait CredentialStore: Send + Sync {
    /// Read a string value, `Ok(None)` when the key does not exist.
    fn get_str(&self, namespace: &str, key: &str) -> StoreResult<Option<String>>;

    /// Write and commit a string value.
    fn set_str(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a key. Returns whether the key existed.
    fn erase_key(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    /// Remove every key of a namespace.
    fn erase_namespace(&self, namespace: &str) -> StoreResult<()>;
}

/// Reject names NVS would refuse, so the in-memory store behaves like flash.
pub fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.len() > MAX_KEY_LENGTH {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(())
}

/// Read a value and treat an empty string the same as a missing key.
pub fn get_non_empty(
    store: &dyn CredentialStore,
    namespace: &str,
    key: &str,
) -> StoreResult<Option<String>> {
    Ok(store
        .get_str(namespace, key)?
        .filter(|value| !value.is_empty()))
}

/// Volatile store used by the host simulation and the tests.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding of a value, panics on invalid names.
    pub fn with(self, namespace: &str, key: &str, value: &str) -> Self {
        if let Err(e) = self.set_str(namespace, key, value) {
            panic!("cannot seed memory store: {}", e);
        }
        self
    }

    pub fn len(&self, namespace: &str) -> usize {
        lock(&self.namespaces)
            .get(namespace)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }
}

impl CredentialStore for MemoryStore {
    fn get_str(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        validate_name(namespace)?;
        validate_name(key)?;

        Ok(lock(&self.namespaces)
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn set_str(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        validate_name(namespace)?;
        validate_name(key)?;

        debug!("💾 {}:{} <- {} bytes", namespace, key, value.len());
        lock(&self.namespaces)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn erase_key(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        validate_name(namespace)?;
        validate_name(key)?;

        Ok(lock(&self.namespaces)
            .get_mut(namespace)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    fn erase_namespace(&self, namespace: &str) -> StoreResult<()> {
        validate_name(namespace)?;

        if lock(&self.namespaces).remove(namespace).is_none() {
            warn!("Namespace '{}' was already empty", namespace);
        }
        Ok(())
    }
}
