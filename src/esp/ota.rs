// OTA partitions and HTTPS image download

use std::time::Duration;

use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::Method;
use embedded_svc::io::Read;
use embedded_svc::ota::SlotState;
use esp_idf_svc::http::client::{Configuration as HttpClientConfiguration, EspHttpConnection};
use esp_idf_svc::ota::{EspOta, EspOtaUpdate};
use esp_idf_svc::sys::EspError;

use crate::firmware_updater::{BootSlots, FirmwareSource, ImageState, SlotWriter, UpdateError};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn flash_error(e: EspError) -> UpdateError {
    UpdateError::Flash(e.to_string())
}

fn boot_error(e: EspError) -> UpdateError {
    UpdateError::Boot(e.to_string())
}

pub struct EspBootSlots {
    ota: EspOta,
}

impl EspBootSlots {
    pub fn new() -> Result<Self, EspError> {
        Ok(Self { ota: EspOta::new()? })
    }
}

impl BootSlots for EspBootSlots {
    fn running_state(&mut self) -> Result<ImageState, UpdateError> {
        let slot = self.ota.get_running_slot().map_err(boot_error)?;
        Ok(match slot.state {
            SlotState::Valid => ImageState::Valid,
            SlotState::Unverified => ImageState::PendingVerify,
            SlotState::Invalid => ImageState::Invalid,
            _ => ImageState::Unknown,
        })
    }

    fn begin_update(&mut self) -> Result<Box<dyn SlotWriter + '_>, UpdateError> {
        let update = self.ota.initiate_update().map_err(flash_error)?;
        Ok(Box::new(OtaWriter { update }))
    }

    fn mark_valid(&mut self) -> Result<(), UpdateError> {
        self.ota.mark_running_slot_valid().map_err(boot_error)
    }

    fn mark_invalid(&mut self) -> Result<(), UpdateError> {
        // Only comes back if the bootloader refused the rollback
        Err(boot_error(self.ota.mark_running_slot_invalid_and_reboot()))
    }
}

struct OtaWriter<'a> {
    update: EspOtaUpdate<'a>,
}

impl SlotWriter for OtaWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.update.write(chunk).map(|_| ()).map_err(flash_error)
    }

    fn complete(self: Box<Self>) -> Result<(), UpdateError> {
        self.update.complete().map_err(flash_error)
    }

    fn abort(self: Box<Self>) -> Result<(), UpdateError> {
        self.update.abort().map_err(flash_error)
    }
}

/// Streams images over HTTP(S), trusting the built-in certificate bundle.
pub struct EspHttpFirmware {
    buffer_size: usize,
}

impl EspHttpFirmware {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl FirmwareSource for EspHttpFirmware {
    fn fetch(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        sink: &mut dyn FnMut(&[u8]) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError> {
        let transport = |e: &dyn std::fmt::Debug| UpdateError::Transport(format!("{:?}", e));

        let config = HttpClientConfiguration {
            timeout: Some(DOWNLOAD_TIMEOUT),
            buffer_size: Some(self.buffer_size),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(|e| transport(&e))?;
        let mut client = HttpClient::wrap(connection);

        let headers: Vec<(&str, &str)> = headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let request = client
            .request(Method::Get, url, &headers)
            .map_err(|e| transport(&e))?;
        let mut response = request.submit().map_err(|e| transport(&e))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(UpdateError::HttpStatus(status));
        }

        let mut chunk = vec![0u8; self.buffer_size];
        loop {
            let read = response.read(&mut chunk).map_err(|e| transport(&e))?;
            if read == 0 {
                return Ok(());
            }
            sink(&chunk[..read])?;
        }
    }
}
