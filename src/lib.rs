// Pup Coordinator
// Device coordination layer: provisioning, OTA updates, MQTT messaging and startup orchestration
// Hardware is reached through the traits defined next to each subsystem; `esp` holds the
// ESP-IDF adapters and `sim` the host simulation used by the tests

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod control;
pub mod firmware_updater;
pub mod identity;
pub mod mqtt_client;
pub mod orchestrator;
pub mod provisioning;
pub mod reset_manager;
pub mod status;
pub mod store;

#[cfg(target_os = "espidf")]
pub mod esp;

#[cfg(not(target_os = "espidf"))]
pub mod sim;

/// Device restart. Never returns.
pub trait Restart: Send + Sync {
    fn restart(&self) -> !;
}

pub type RestartHandle = Arc<dyn Restart>;

// A panic while a subsystem lock is held must not take the event loop down with it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
