// WiFi station driver and system event routing
// Station credentials are owned by the provisioning manager, the driver
// here only starts the radio and (re)connects with what is stored

use std::ffi::{c_void, CString};
use std::net::Ipv4Addr;
use std::sync::Arc;

use esp_idf_svc::sys::{
    esp, esp_event_base_t, esp_event_handler_instance_register, esp_event_handler_instance_t,
    esp_netif_create_default_wifi_sta, esp_netif_init, esp_netif_set_hostname, esp_netif_t,
    esp_wifi_set_country_code, esp_wifi_set_mode, ip_event_got_ip_t, ip_event_t_IP_EVENT_STA_GOT_IP,
    protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_CREDENTIALS_MISMATCH,
    protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_INVALID_SECURITY_PARAMS,
    protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_SETUP_OK,
    protocomm_transport_ble_event_t_PROTOCOMM_TRANSPORT_BLE_CONNECTED,
    protocomm_transport_ble_event_t_PROTOCOMM_TRANSPORT_BLE_DISCONNECTED,
    wifi_event_t_WIFI_EVENT_STA_DISCONNECTED, wifi_event_t_WIFI_EVENT_STA_START,
    wifi_mode_t_WIFI_MODE_STA, wifi_prov_cb_event_t_WIFI_PROV_CRED_FAIL,
    wifi_prov_cb_event_t_WIFI_PROV_CRED_RECV, wifi_prov_cb_event_t_WIFI_PROV_CRED_SUCCESS,
    wifi_prov_cb_event_t_WIFI_PROV_END, wifi_prov_cb_event_t_WIFI_PROV_START,
    wifi_prov_sta_fail_reason_t, wifi_prov_sta_fail_reason_t_WIFI_PROV_STA_AUTH_ERROR,
    wifi_sta_config_t, EspError, ESP_EVENT_ANY_ID, IP_EVENT, PROTOCOMM_SECURITY_SESSION_EVENT,
    PROTOCOMM_TRANSPORT_BLE_EVENT, WIFI_EVENT, WIFI_PROV_EVENT,
};
use esp_idf_svc::wifi::WifiDriver;
use log::{debug, info};

use crate::provisioning::{
    CredentialFailureReason, Provisioner, ProvisioningError, ProvisioningEvent, WifiStation,
};

fn station_error(e: EspError) -> ProvisioningError {
    ProvisioningError::Station(e.to_string())
}

/// Create the default station interface and give it our hostname.
pub fn init_station_netif(hostname: &str) -> Result<*mut esp_netif_t, EspError> {
    esp!(unsafe { esp_netif_init() })?;

    let netif = unsafe { esp_netif_create_default_wifi_sta() };
    if netif.is_null() {
        return Err(EspError::from_infallible::<{ esp_idf_svc::sys::ESP_FAIL }>());
    }

    let hostname = CString::new(hostname)
        .map_err(|_| EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>())?;
    esp!(unsafe { esp_netif_set_hostname(netif, hostname.as_ptr()) })?;

    info!("🌐 Station netif created as '{}'", hostname.to_string_lossy());
    Ok(netif)
}

pub struct EspStation {
    driver: WifiDriver<'static>,
}

impl EspStation {
    pub fn new(driver: WifiDriver<'static>) -> Self {
        Self { driver }
    }
}

impl WifiStation for EspStation {
    fn set_country(&mut self, country_code: &str) -> Result<(), ProvisioningError> {
        let code = CString::new(country_code)
            .map_err(|_| ProvisioningError::Station(format!("bad country code '{}'", country_code)))?;
        esp!(unsafe { esp_wifi_set_country_code(code.as_ptr(), true) }).map_err(station_error)
    }

    fn start(&mut self) -> Result<(), ProvisioningError> {
        esp!(unsafe { esp_wifi_set_mode(wifi_mode_t_WIFI_MODE_STA) }).map_err(station_error)?;
        self.driver.start().map_err(station_error)
    }

    fn connect(&mut self) -> Result<(), ProvisioningError> {
        debug!("📶 Connecting station");
        self.driver.connect().map_err(station_error)
    }
}

/// Keeps the provisioner alive for the raw event handlers.
pub struct EventRouting {
    _provisioner: Arc<Provisioner>,
    _instances: Vec<esp_event_handler_instance_t>,
}

/// Register one handler per event base, all delivering to `provisioner`.
pub fn route_system_events(provisioner: Arc<Provisioner>) -> Result<EventRouting, EspError> {
    let context = Arc::as_ptr(&provisioner) as *mut c_void;
    let bases = unsafe {
        [
            WIFI_PROV_EVENT,
            PROTOCOMM_TRANSPORT_BLE_EVENT,
            PROTOCOMM_SECURITY_SESSION_EVENT,
            WIFI_EVENT,
            IP_EVENT,
        ]
    };

    let mut instances = Vec::with_capacity(bases.len());
    for base in bases {
        let mut instance: esp_event_handler_instance_t = std::ptr::null_mut();
        esp!(unsafe {
            esp_event_handler_instance_register(
                base,
                ESP_EVENT_ANY_ID,
                Some(on_system_event),
                context,
                &mut instance,
            )
        })?;
        instances.push(instance);
    }

    Ok(EventRouting {
        _provisioner: provisioner,
        _instances: instances,
    })
}

unsafe extern "C" fn on_system_event(
    context: *mut c_void,
    base: esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    // `context` is the provisioner pinned by EventRouting for the program lifetime
    let provisioner = &*(context as *const Provisioner);
    if let Some(event) = translate(base, id as u32, data) {
        provisioner.handle_event(event);
    }
}

unsafe fn translate(base: esp_event_base_t, id: u32, data: *mut c_void) -> Option<ProvisioningEvent> {
    if base == WIFI_PROV_EVENT {
        match id {
            wifi_prov_cb_event_t_WIFI_PROV_START => Some(ProvisioningEvent::SessionStarted),
            wifi_prov_cb_event_t_WIFI_PROV_CRED_RECV if !data.is_null() => {
                let config = &*(data as *const wifi_sta_config_t);
                let len = config.ssid.iter().position(|&b| b == 0).unwrap_or(config.ssid.len());
                Some(ProvisioningEvent::CredentialsReceived {
                    ssid: String::from_utf8_lossy(&config.ssid[..len]).into_owned(),
                })
            }
            wifi_prov_cb_event_t_WIFI_PROV_CRED_FAIL if !data.is_null() => {
                let reason = *(data as *const wifi_prov_sta_fail_reason_t);
                Some(ProvisioningEvent::CredentialFailure(
                    if reason == wifi_prov_sta_fail_reason_t_WIFI_PROV_STA_AUTH_ERROR {
                        CredentialFailureReason::AuthError
                    } else {
                        CredentialFailureReason::ApNotFound
                    },
                ))
            }
            wifi_prov_cb_event_t_WIFI_PROV_CRED_SUCCESS => Some(ProvisioningEvent::CredentialSuccess),
            wifi_prov_cb_event_t_WIFI_PROV_END => Some(ProvisioningEvent::SessionEnded),
            _ => None,
        }
    } else if base == PROTOCOMM_TRANSPORT_BLE_EVENT {
        match id {
            protocomm_transport_ble_event_t_PROTOCOMM_TRANSPORT_BLE_CONNECTED => {
                Some(ProvisioningEvent::TransportConnected)
            }
            protocomm_transport_ble_event_t_PROTOCOMM_TRANSPORT_BLE_DISCONNECTED => {
                Some(ProvisioningEvent::TransportDisconnected)
            }
            _ => None,
        }
    } else if base == PROTOCOMM_SECURITY_SESSION_EVENT {
        match id {
            protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_SETUP_OK => {
                Some(ProvisioningEvent::SecureSessionEstablished)
            }
            protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_INVALID_SECURITY_PARAMS => {
                Some(ProvisioningEvent::InvalidSecurityParams)
            }
            protocomm_security_session_event_t_PROTOCOMM_SECURITY_SESSION_CREDENTIALS_MISMATCH => {
                Some(ProvisioningEvent::CredentialsMismatch)
            }
            _ => None,
        }
    } else if base == WIFI_EVENT {
        match id {
            wifi_event_t_WIFI_EVENT_STA_START => Some(ProvisioningEvent::StationStarted),
            wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => Some(ProvisioningEvent::StationDisconnected),
            _ => None,
        }
    } else if base == IP_EVENT && id == ip_event_t_IP_EVENT_STA_GOT_IP && !data.is_null() {
        let got_ip = &*(data as *const ip_event_got_ip_t);
        // lwIP keeps the address in network byte order
        Some(ProvisioningEvent::GotIp(Ipv4Addr::from(
            got_ip.ip_info.ip.addr.to_le_bytes(),
        )))
    } else {
        None
    }
}
