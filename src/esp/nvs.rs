// NVS-backed credential store
// Each call opens the namespace handle, works on it and drops it again
// Reads open read-only, so looking up a key never creates its namespace

use std::sync::Mutex;

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{esp, nvs_commit, nvs_erase_all, EspError, ESP_ERR_NVS_NOT_FOUND};
use log::debug;

use crate::lock;
use crate::store::{validate_name, CredentialStore, StoreError, StoreResult};

// Largest value read back in one piece (settings JSON is the biggest entry)
const MAX_VALUE_LENGTH: usize = 4000;

pub struct EspNvsStore {
    partition: EspDefaultNvsPartition,
    guard: Mutex<()>,
}

impl EspNvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            guard: Mutex::new(()),
        }
    }

    fn open(&self, namespace: &str) -> StoreResult<EspNvs<NvsDefault>> {
        validate_name(namespace)?;
        EspNvs::new(self.partition.clone(), namespace, true).map_err(backend)
    }

    /// `None` when the namespace has never been written.
    fn open_read_only(&self, namespace: &str) -> StoreResult<Option<EspNvs<NvsDefault>>> {
        validate_name(namespace)?;
        match EspNvs::new(self.partition.clone(), namespace, false) {
            Ok(nvs) => Ok(Some(nvs)),
            Err(e) if e.code() == ESP_ERR_NVS_NOT_FOUND as i32 => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }
}

fn backend(e: EspError) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl CredentialStore for EspNvsStore {
    fn get_str(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        validate_name(key)?;
        let _guard = lock(&self.guard);
        let Some(nvs) = self.open_read_only(namespace)? else {
            return Ok(None);
        };

        let Some(len) = nvs.str_len(key).map_err(backend)? else {
            return Ok(None);
        };
        if len > MAX_VALUE_LENGTH {
            return Err(StoreError::ValueTooLarge {
                key: key.to_string(),
                len,
            });
        }

        let mut buffer = vec![0u8; len.max(1)];
        Ok(nvs
            .get_str(key, &mut buffer)
            .map_err(backend)?
            .map(str::to_string))
    }

    fn set_str(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        validate_name(key)?;
        let _guard = lock(&self.guard);
        let mut nvs = self.open(namespace)?;

        debug!("💾 {}:{} <- {} bytes", namespace, key, value.len());
        nvs.set_str(key, value).map_err(backend)
    }

    fn erase_key(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        validate_name(key)?;
        let _guard = lock(&self.guard);
        let mut nvs = self.open(namespace)?;

        nvs.remove(key).map_err(backend)
    }

    fn erase_namespace(&self, namespace: &str) -> StoreResult<()> {
        let _guard = lock(&self.guard);
        let nvs = self.open(namespace)?;

        debug!("🗑️ Erasing NVS namespace: {}", namespace);
        esp!(unsafe { nvs_erase_all(nvs.handle()) }).map_err(backend)?;
        esp!(unsafe { nvs_commit(nvs.handle()) }).map_err(backend)
    }
}
