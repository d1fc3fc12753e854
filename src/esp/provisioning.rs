// BLE provisioning manager (wifi_provisioning component)

use std::ffi::{c_void, CString};

use esp_idf_svc::sys::{
    esp, wifi_prov_event_handler_t, wifi_prov_mgr_config_t, wifi_prov_mgr_deinit,
    wifi_prov_mgr_init, wifi_prov_mgr_is_provisioned, wifi_prov_mgr_reset_provisioning,
    wifi_prov_mgr_reset_sm_state_on_failure, wifi_prov_mgr_start_provisioning,
    wifi_prov_scheme_ble, wifi_prov_scheme_ble_event_cb_free_btdm,
    wifi_prov_scheme_ble_set_service_uuid, wifi_prov_security_WIFI_PROV_SECURITY_1, EspError,
};
use log::{debug, info};

use crate::provisioning::{ProvisioningError, ProvisioningTransport};

fn transport_error(e: EspError) -> ProvisioningError {
    ProvisioningError::Transport(e.to_string())
}

pub struct EspProvisioning {
    initialized: bool,
    // The manager keeps pointers to both for the whole session
    service_uuid: Box<[u8; 16]>,
    proof_of_possession: Option<CString>,
}

impl EspProvisioning {
    pub fn new() -> Self {
        Self {
            initialized: false,
            service_uuid: Box::new([0; 16]),
            proof_of_possession: None,
        }
    }

    fn ensure_initialized(&mut self) -> Result<(), ProvisioningError> {
        if self.initialized {
            return Ok(());
        }

        let config = wifi_prov_mgr_config_t {
            scheme: unsafe { wifi_prov_scheme_ble },
            scheme_event_handler: wifi_prov_event_handler_t {
                event_cb: Some(wifi_prov_scheme_ble_event_cb_free_btdm),
                user_data: std::ptr::null_mut(),
            },
            ..Default::default()
        };
        esp!(unsafe { wifi_prov_mgr_init(config) }).map_err(transport_error)?;

        debug!("BLE provisioning manager initialized");
        self.initialized = true;
        Ok(())
    }
}

impl ProvisioningTransport for EspProvisioning {
    fn is_provisioned(&mut self) -> Result<bool, ProvisioningError> {
        self.ensure_initialized()?;
        let mut provisioned = false;
        esp!(unsafe { wifi_prov_mgr_is_provisioned(&mut provisioned) }).map_err(transport_error)?;
        Ok(provisioned)
    }

    fn start_session(
        &mut self,
        service_name: &str,
        proof_of_possession: &str,
        service_uuid: &[u8; 16],
    ) -> Result<(), ProvisioningError> {
        self.ensure_initialized()?;

        let name = CString::new(service_name)
            .map_err(|_| ProvisioningError::Transport("service name contains NUL".to_string()))?;
        let pop = CString::new(proof_of_possession)
            .map_err(|_| ProvisioningError::Transport("PoP contains NUL".to_string()))?;

        *self.service_uuid = *service_uuid;
        esp!(unsafe { wifi_prov_scheme_ble_set_service_uuid(self.service_uuid.as_mut_ptr()) })
            .map_err(transport_error)?;

        let pop = self.proof_of_possession.insert(pop);
        esp!(unsafe {
            wifi_prov_mgr_start_provisioning(
                wifi_prov_security_WIFI_PROV_SECURITY_1,
                pop.as_ptr() as *const c_void,
                name.as_ptr(),
                std::ptr::null(),
            )
        })
        .map_err(transport_error)?;

        info!("📡 Advertising provisioning service '{}'", service_name);
        Ok(())
    }

    fn reset_session_on_failure(&mut self) -> Result<(), ProvisioningError> {
        esp!(unsafe { wifi_prov_mgr_reset_sm_state_on_failure() }).map_err(transport_error)
    }

    fn clear_credentials(&mut self) -> Result<(), ProvisioningError> {
        self.ensure_initialized()?;
        esp!(unsafe { wifi_prov_mgr_reset_provisioning() }).map_err(transport_error)
    }

    fn end_session(&mut self) {
        if self.initialized {
            unsafe { wifi_prov_mgr_deinit() };
            self.initialized = false;
            debug!("BLE provisioning manager released");
        }
    }
}
