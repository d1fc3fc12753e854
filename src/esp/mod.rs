// ESP32 board: owns the peripherals and hands each subsystem its driver

mod httpd;
mod led;
mod mqtt;
mod nvs;
mod ota;
mod provisioning;
mod wifi;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use embassy_executor::Spawner;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::{Gpio0, Gpio2, Gpio4, Gpio5, Input, PinDriver, Pull};
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::{esp, esp_mac_type_t_ESP_MAC_WIFI_STA, esp_read_mac};
use esp_idf_svc::wifi::WifiDriver;
use log::{info, warn};

use crate::config::DeviceSettings;
use crate::orchestrator::{Board, Subsystems};
use crate::provisioning::Provisioner;
use crate::reset_manager::ButtonInput;
use crate::status::StatusBoard;
use crate::store::CredentialStore;
use crate::Restart;

pub use self::httpd::{EspDiscovery, EspRequestServer};
pub use self::led::{status_led_task, StatusLeds};
pub use self::mqtt::EspMqttConnector;
pub use self::nvs::EspNvsStore;
pub use self::ota::{EspBootSlots, EspHttpFirmware};
pub use self::provisioning::EspProvisioning;
pub use self::wifi::{EspStation, EventRouting};

/// Restarts the chip.
pub struct EspRestart;

impl Restart for EspRestart {
    fn restart(&self) -> ! {
        info!("🔄 Restarting");
        unsafe { esp_idf_svc::sys::esp_restart() }
    }
}

/// BOOT button on GPIO0, active low.
pub struct BootButton {
    pin: PinDriver<'static, Gpio0, Input>,
}

impl BootButton {
    pub fn new(pin: Gpio0) -> Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Up)?;
        Ok(Self { pin })
    }
}

impl ButtonInput for BootButton {
    fn is_pressed(&mut self) -> bool {
        self.pin.is_low()
    }
}

pub struct EspBoard {
    spawner: Spawner,
    sys_loop: EspSystemEventLoop,
    partition: Option<EspDefaultNvsPartition>,
    modem: Option<Modem>,
    button: Option<Gpio0>,
    leds: Option<(Gpio2, Gpio4, Gpio5)>,
    wifi: Option<WifiDriver<'static>>,
    _events: Option<EventRouting>, // Owns the provisioner the raw handlers point at
}

impl EspBoard {
    pub fn new(spawner: Spawner) -> Result<Self> {
        let peripherals = Peripherals::take().context("Peripherals already taken")?;
        let pins = peripherals.pins;

        Ok(Self {
            spawner,
            sys_loop: EspSystemEventLoop::take()?,
            partition: None,
            modem: Some(peripherals.modem),
            button: Some(pins.gpio0),
            leds: Some((pins.gpio2, pins.gpio4, pins.gpio5)),
            wifi: None,
            _events: None,
        })
    }
}

impl Board for EspBoard {
    fn mount_store(&mut self) -> Result<Arc<dyn CredentialStore>> {
        // Erases and re-initializes the partition if its layout is outdated
        let partition = EspDefaultNvsPartition::take()?;
        self.partition = Some(partition.clone());
        info!("💾 NVS mounted");
        Ok(Arc::new(EspNvsStore::new(partition)))
    }

    fn mac_address(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        if let Err(e) = esp!(unsafe { esp_read_mac(mac.as_mut_ptr(), esp_mac_type_t_ESP_MAC_WIFI_STA) }) {
            warn!("⚠️ Failed to read station MAC: {}", e);
        }
        mac
    }

    fn init_network(&mut self, hostname: &str) -> Result<()> {
        wifi::init_station_netif(hostname)?;
        Ok(())
    }

    fn init_wifi(&mut self) -> Result<()> {
        let modem = self.modem.take().ok_or_else(|| anyhow!("WiFi already initialized"))?;
        let driver = WifiDriver::new(modem, self.sys_loop.clone(), self.partition.clone())?;
        self.wifi = Some(driver);
        Ok(())
    }

    fn subsystems(&mut self, settings: &DeviceSettings) -> Result<Subsystems> {
        let wifi = self.wifi.take().ok_or_else(|| anyhow!("WiFi driver not initialized"))?;
        let button = self.button.take().ok_or_else(|| anyhow!("Button already taken"))?;

        Ok(Subsystems {
            provisioning: Box::new(EspProvisioning::new()),
            station: Box::new(EspStation::new(wifi)),
            boot_slots: Box::new(EspBootSlots::new()?),
            firmware: Box::new(EspHttpFirmware::new(settings.update_buffer_size)),
            mqtt: Box::new(EspMqttConnector),
            server: Box::new(EspRequestServer::default()),
            discovery: Box::new(EspDiscovery::default()),
            button: Box::new(BootButton::new(button)?),
            restart: Arc::new(EspRestart),
        })
    }

    fn route_events(&mut self, provisioner: Arc<Provisioner>) -> Result<()> {
        self._events = Some(wifi::route_system_events(provisioner)?);
        Ok(())
    }

    fn attach_status(&mut self, status: StatusBoard) -> Result<()> {
        let (red, green, blue) = self.leds.take().ok_or_else(|| anyhow!("LEDs already taken"))?;
        let leds = StatusLeds {
            red: PinDriver::output(red)?,
            green: PinDriver::output(green)?,
            blue: PinDriver::output(blue)?,
        };

        self.spawner
            .spawn(status_led_task(leds, status))
            .map_err(|e| anyhow!("Failed to spawn status LED task: {:?}", e))
    }
}
