// Control routes served by the on-device HTTP server
// POST /firmware-upgrade starts an OTA update, POST /reset restarts the device

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::firmware_updater::{UpdateEngine, UpdateError};
use crate::RestartHandle;

pub const FIRMWARE_UPGRADE_PATH: &str = "/firmware-upgrade";
pub const RESET_PATH: &str = "/reset";

const UPGRADE_STARTED: &str = "Firmware update started\n";
const RESETTING: &str = "Resetting device\n";

// Lets the reset reply reach the client before the restart
const DEFAULT_RESET_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareUpgradeRequest {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRoute {
    FirmwareUpgrade,
    Reset,
}

pub const ROUTES: [(&str, ControlRoute); 2] = [
    (FIRMWARE_UPGRADE_PATH, ControlRoute::FirmwareUpgrade),
    (RESET_PATH, ControlRoute::Reset),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ControlError {
    BadRequest(String),
    Update(UpdateError),
    Reply(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ControlError::Update(e) => write!(f, "firmware update failed: {}", e),
            ControlError::Reply(msg) => write!(f, "failed to send reply: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<UpdateError> for ControlError {
    fn from(e: UpdateError) -> Self {
        ControlError::Update(e)
    }
}

pub fn parse_upgrade_request(body: &[u8]) -> Result<FirmwareUpgradeRequest, ControlError> {
    let request: FirmwareUpgradeRequest = serde_json::from_slice(body)
        .map_err(|e| ControlError::BadRequest(format!("Failed to parse JSON: {}", e)))?;

    if !(request.url.starts_with("https://") || request.url.starts_with("http://")) {
        return Err(ControlError::BadRequest(format!(
            "Unsupported firmware URL '{}'",
            request.url
        )));
    }

    Ok(request)
}

pub struct ControlPlane {
    engine: Arc<UpdateEngine>,
    restart: RestartHandle,
    reset_grace: Duration,
}

impl ControlPlane {
    pub fn new(engine: Arc<UpdateEngine>, restart: RestartHandle) -> Self {
        Self {
            engine,
            restart,
            reset_grace: DEFAULT_RESET_GRACE,
        }
    }

    pub fn with_reset_grace(mut self, grace: Duration) -> Self {
        self.reset_grace = grace;
        self
    }

    /// Serve one request. `respond` sends the status and body; the action
    /// runs afterwards, so a successful upgrade or reset never returns.
    pub fn serve(
        &self,
        route: ControlRoute,
        body: &[u8],
        respond: &mut dyn FnMut(u16, &str) -> Result<(), ControlError>,
    ) -> Result<(), ControlError> {
        match route {
            ControlRoute::FirmwareUpgrade => {
                let request = match parse_upgrade_request(body) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("⚠️ Rejecting firmware upgrade: {}", e);
                        respond(400, &e.to_string())?;
                        return Err(e);
                    }
                };

                info!("📦 Firmware upgrade requested from {}", request.url);
                respond(200, UPGRADE_STARTED)?;
                match self.firmware_upgrade(&request) {
                    Ok(never) => match never {},
                    Err(e) => Err(e),
                }
            }
            ControlRoute::Reset => {
                respond(200, RESETTING)?;
                self.reset()
            }
        }
    }

    pub fn firmware_upgrade(&self, request: &FirmwareUpgradeRequest) -> Result<Infallible, ControlError> {
        let result = match request.sha256.as_deref() {
            Some(digest) => self.engine.update_verified(&request.url, digest),
            None => self.engine.update(&request.url),
        };
        Ok(result?)
    }

    /// Wait for the grace period, then restart.
    pub fn reset(&self) -> ! {
        info!("🔄 Reset requested, restarting in {:?}", self.reset_grace);
        std::thread::sleep(self.reset_grace);
        self.restart.restart()
    }
}
