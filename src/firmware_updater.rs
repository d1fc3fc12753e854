// Firmware Update Engine
// Streams an image into the inactive boot slot and drives the post-boot verification decision

use std::convert::Infallible;
use std::sync::Mutex;

// Import logging macros for debug output
use log::{error, info, warn};
use sha2::{Digest, Sha256};

use crate::{lock, RestartHandle};

// Log download progress every this many bytes
const PROGRESS_STEP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Downloading,
    BootPending,         // New image written, restart pending
    VerificationPending, // Running a freshly installed image that has not been confirmed yet
    Committed,
    RolledBack,
}

/// Persistent state of the running boot slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Valid,
    PendingVerify,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateError {
    Transport(String),
    HttpStatus(u16),
    Integrity { expected: String, actual: String },
    InvalidDigest(String),
    Flash(String),
    Boot(String),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Transport(msg) => write!(f, "download failed: {}", msg),
            UpdateError::HttpStatus(status) => write!(f, "server answered HTTP {}", status),
            UpdateError::Integrity { expected, actual } => {
                write!(f, "image digest mismatch: expected {}, got {}", expected, actual)
            }
            UpdateError::InvalidDigest(digest) => write!(f, "invalid SHA-256 digest '{}'", digest),
            UpdateError::Flash(msg) => write!(f, "flash write failed: {}", msg),
            UpdateError::Boot(msg) => write!(f, "boot partition error: {}", msg),
        }
    }
}

impl std::error::Error for UpdateError {}

/// In-progress write of the inactive slot.
pub trait SlotWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError>;

    /// Validate the written image and make it the next boot partition.
    fn complete(self: Box<Self>) -> Result<(), UpdateError>;

    /// Drop the partial image; the boot partition stays unchanged.
    fn abort(self: Box<Self>) -> Result<(), UpdateError>;
}

/// Boot partition metadata (the OTA data partition).
pub trait BootSlots: Send {
    fn running_state(&mut self) -> Result<ImageState, UpdateError>;
    fn begin_update(&mut self) -> Result<Box<dyn SlotWriter + '_>, UpdateError>;
    fn mark_valid(&mut self) -> Result<(), UpdateError>;
    fn mark_invalid(&mut self) -> Result<(), UpdateError>;
}

/// HTTPS download of a firmware image.
pub trait FirmwareSource: Send {
    /// Stream the body of `url` into `sink`. Any non-2xx status is an error.
    fn fetch(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        sink: &mut dyn FnMut(&[u8]) -> Result<(), UpdateError>,
    ) -> Result<(), UpdateError>;
}

struct Inner {
    state: UpdateState,
    headers: Vec<(String, String)>,
    bytes_written: usize,
    slots: Box<dyn BootSlots>,
    source: Box<dyn FirmwareSource>,
}

pub struct UpdateEngine {
    inner: Mutex<Inner>,
    restart: RestartHandle,
}

impl UpdateEngine {
    pub fn new(
        mut slots: Box<dyn BootSlots>,
        source: Box<dyn FirmwareSource>,
        restart: RestartHandle,
    ) -> Self {
        let state = match slots.running_state() {
            Ok(ImageState::PendingVerify) => {
                info!("🆕 Running a new firmware image, verification pending");
                UpdateState::VerificationPending
            }
            Ok(_) => UpdateState::Idle,
            Err(e) => {
                warn!("⚠️ Could not read the running slot state: {}", e);
                UpdateState::Idle
            }
        };

        Self {
            inner: Mutex::new(Inner {
                state,
                headers: Vec::new(),
                bytes_written: 0,
                slots,
                source,
            }),
            restart,
        }
    }

    /// Extra header sent with every download request.
    pub fn add_header(&self, name: &str, value: &str) {
        lock(&self.inner)
            .headers
            .push((name.to_string(), value.to_string()));
    }

    pub fn add_bearer_token(&self, token: &str) {
        self.add_header("Authorization", &format!("Bearer {}", token));
    }

    /// Download `url` into the inactive slot and restart into it.
    /// Only returns on failure, with the boot partition unchanged.
    pub fn update(&self, url: &str) -> Result<Infallible, UpdateError> {
        self.install(url, None)
    }

    /// Like `update`, rejecting the image unless its SHA-256 matches.
    pub fn update_verified(&self, url: &str, sha256_hex: &str) -> Result<Infallible, UpdateError> {
        let expected = parse_digest(sha256_hex)?;
        self.install(url, Some(expected))
    }

    fn install(&self, url: &str, expected: Option<[u8; 32]>) -> Result<Infallible, UpdateError> {
        self.download(url, expected)?;

        info!("🔄 Firmware update complete, restarting");
        self.restart.restart()
    }

    fn download(&self, url: &str, expected: Option<[u8; 32]>) -> Result<(), UpdateError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        info!("⬇️ Starting firmware download from {}", url);
        let previous = inner.state;
        inner.state = UpdateState::Downloading;
        inner.bytes_written = 0;

        let result = stream_image(
            inner.slots.as_mut(),
            inner.source.as_mut(),
            &inner.headers,
            url,
            expected,
        );

        match result {
            Ok(written) => {
                info!("✅ Firmware image written ({} bytes)", written);
                inner.bytes_written = written;
                inner.state = UpdateState::BootPending;
                Ok(())
            }
            Err((e, written)) => {
                error!("❌ Firmware update failed: {}", e);
                inner.bytes_written = written;
                inner.state = previous;
                Err(e)
            }
        }
    }

    /// Whether the running image still awaits its verification decision.
    pub fn pending_verification(&self) -> bool {
        match lock(&self.inner).slots.running_state() {
            Ok(state) => state == ImageState::PendingVerify,
            Err(e) => {
                warn!("⚠️ Failed to query running slot state: {}", e);
                false
            }
        }
    }

    /// Confirm the running image. One-way.
    pub fn commit(&self) -> Result<(), UpdateError> {
        let mut inner = lock(&self.inner);
        inner.slots.mark_valid()?;
        inner.state = UpdateState::Committed;
        info!("✅ Running firmware marked valid");
        Ok(())
    }

    /// Reject the running image and restart into the previous one.
    pub fn rollback(&self) -> ! {
        {
            let mut inner = lock(&self.inner);
            warn!("⏪ Rolling back to the previous firmware");
            if let Err(e) = inner.slots.mark_invalid() {
                error!("❌ Failed to mark running image invalid: {}", e);
            }
            inner.state = UpdateState::RolledBack;
        }

        self.restart.restart()
    }

    pub fn state(&self) -> UpdateState {
        lock(&self.inner).state
    }

    /// Bytes written to flash by the last update attempt.
    pub fn bytes_written(&self) -> usize {
        lock(&self.inner).bytes_written
    }
}

fn stream_image(
    slots: &mut dyn BootSlots,
    source: &mut dyn FirmwareSource,
    headers: &[(String, String)],
    url: &str,
    expected: Option<[u8; 32]>,
) -> Result<usize, (UpdateError, usize)> {
    let mut writer = slots.begin_update().map_err(|e| (e, 0))?;
    let mut hasher = Sha256::new();
    let mut written = 0usize;
    let mut next_report = PROGRESS_STEP;

    let fetched = source.fetch(url, headers, &mut |chunk: &[u8]| {
        writer.write(chunk)?;
        hasher.update(chunk);
        written += chunk.len();
        if written >= next_report {
            info!("📦 Firmware download: {} KiB", written / 1024);
            next_report += PROGRESS_STEP;
        }
        Ok(())
    });

    let checked = fetched.and_then(|()| match expected {
        Some(expected) => {
            let actual: [u8; 32] = hasher.finalize().into();
            if actual == expected {
                Ok(())
            } else {
                Err(UpdateError::Integrity {
                    expected: to_hex(&expected),
                    actual: to_hex(&actual),
                })
            }
        }
        None => Ok(()),
    });

    match checked {
        Ok(()) => writer.complete().map(|()| written).map_err(|e| (e, written)),
        Err(e) => {
            if let Err(abort_err) = writer.abort() {
                warn!("⚠️ Failed to abort slot write: {}", abort_err);
            }
            Err((e, written))
        }
    }
}

fn parse_digest(hex: &str) -> Result<[u8; 32], UpdateError> {
    let hex = hex.trim();
    let invalid = || UpdateError::InvalidDigest(hex.to_string());

    if hex.len() != 64 || !hex.is_ascii() {
        return Err(invalid());
    }

    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(digest)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{restart_requested, CannedFirmwareServer, MemoryBootSlots, UnwindingRestart};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    const URL: &str = "https://updates.example.com/pup.bin";

    fn engine(slots: &MemoryBootSlots, server: &CannedFirmwareServer) -> (UpdateEngine, Arc<UnwindingRestart>) {
        let restart = Arc::new(UnwindingRestart::new());
        let engine = UpdateEngine::new(
            Box::new(slots.clone()),
            Box::new(server.clone()),
            restart.clone(),
        );
        (engine, restart)
    }

    fn image() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn successful_update_switches_slot_and_restarts() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_image(URL, image());
        let (engine, restart) = engine(&slots, &server);

        let outcome = catch_unwind(AssertUnwindSafe(|| engine.update(URL)));

        assert!(restart_requested(outcome));
        assert_eq!(restart.count(), 1);
        assert_eq!(engine.state(), UpdateState::BootPending);
        assert_eq!(engine.bytes_written(), 200_000);
        assert_eq!(slots.snapshot().next_boot, Some(image()));
    }

    #[test]
    fn http_error_leaves_boot_partition_alone() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_status(URL, 404);
        let (engine, restart) = engine(&slots, &server);

        let result = engine.update(URL);

        assert!(matches!(result, Err(UpdateError::HttpStatus(404))));
        assert_eq!(restart.count(), 0);
        assert_eq!(engine.state(), UpdateState::Idle);
        let boot = slots.snapshot();
        assert_eq!(boot.next_boot, None);
        assert_eq!(boot.aborted, 1);
    }

    #[test]
    fn digest_mismatch_aborts_the_write() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_image(URL, image());
        let (engine, _restart) = engine(&slots, &server);

        let result = engine.update_verified(URL, &"00".repeat(32));

        assert!(matches!(result, Err(UpdateError::Integrity { .. })));
        let boot = slots.snapshot();
        assert_eq!(boot.next_boot, None);
        assert_eq!(boot.aborted, 1);
    }

    #[test]
    fn connection_drop_mid_download_aborts_the_write() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_dropped_image(URL, image(), 10);
        let (engine, restart) = engine(&slots, &server);

        let result = engine.update(URL);

        assert!(matches!(result, Err(UpdateError::Transport(_))));
        assert_eq!(restart.count(), 0);
        assert_eq!(engine.state(), UpdateState::Idle);
        assert_eq!(engine.bytes_written(), 10 * 4096);
        let boot = slots.snapshot();
        assert_eq!(boot.next_boot, None);
        assert_eq!(boot.aborted, 1);
    }

    #[test]
    fn flash_error_mid_download_aborts_the_write() {
        let slots = MemoryBootSlots::new(ImageState::Valid).with_capacity(64 * 1024);
        let server = CannedFirmwareServer::new().with_image(URL, image());
        let (engine, restart) = engine(&slots, &server);

        let result = engine.update(URL);

        assert!(matches!(result, Err(UpdateError::Flash(_))));
        assert_eq!(restart.count(), 0);
        assert_eq!(engine.bytes_written(), 16 * 4096);
        let boot = slots.snapshot();
        assert_eq!(boot.next_boot, None);
        assert_eq!(boot.aborted, 1);
    }

    #[test]
    fn matching_digest_installs_the_image() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_image(URL, image());
        let (engine, _restart) = engine(&slots, &server);
        let digest = to_hex(&Sha256::digest(image()));

        let outcome = catch_unwind(AssertUnwindSafe(|| engine.update_verified(URL, &digest)));

        assert!(restart_requested(outcome));
        assert_eq!(slots.snapshot().next_boot, Some(image()));
    }

    #[test]
    fn malformed_digest_is_rejected_before_download() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_image(URL, image());
        let (engine, _restart) = engine(&slots, &server);

        let result = engine.update_verified(URL, "not-a-digest");

        assert!(matches!(result, Err(UpdateError::InvalidDigest(_))));
        assert!(server.requests().is_empty());
    }

    #[test]
    fn headers_are_sent_with_the_download() {
        let slots = MemoryBootSlots::new(ImageState::Valid);
        let server = CannedFirmwareServer::new().with_status(URL, 500);
        let (engine, _restart) = engine(&slots, &server);

        engine.add_header("X-Device", "pup-a1b2c3");
        engine.add_bearer_token("t0k3n");
        let _ = engine.update(URL);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].1,
            vec![
                ("X-Device".to_string(), "pup-a1b2c3".to_string()),
                ("Authorization".to_string(), "Bearer t0k3n".to_string()),
            ]
        );
    }

    #[test]
    fn commit_clears_pending_verification() {
        let slots = MemoryBootSlots::new(ImageState::PendingVerify);
        let server = CannedFirmwareServer::new();
        let (engine, _restart) = engine(&slots, &server);

        assert_eq!(engine.state(), UpdateState::VerificationPending);
        assert!(engine.pending_verification());

        engine.commit().unwrap();

        assert!(!engine.pending_verification());
        assert_eq!(engine.state(), UpdateState::Committed);
    }

    #[test]
    fn rollback_always_restarts() {
        let slots = MemoryBootSlots::new(ImageState::PendingVerify);
        let server = CannedFirmwareServer::new();
        let (engine, restart) = engine(&slots, &server);

        let outcome = catch_unwind(AssertUnwindSafe(|| engine.rollback()));

        assert!(restart_requested(outcome));
        assert_eq!(restart.count(), 1);
        assert_eq!(engine.state(), UpdateState::RolledBack);
        assert_eq!(slots.snapshot().running, ImageState::Invalid);
    }

    #[test]
    fn digest_parsing_accepts_upper_and_lower_case() {
        let lower = "ab".repeat(32);
        let upper = "AB".repeat(32);
        assert_eq!(parse_digest(&lower).unwrap(), [0xab; 32]);
        assert_eq!(parse_digest(&upper).unwrap(), [0xab; 32]);
    }
}
