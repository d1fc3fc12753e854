// Reset Manager Module
// Re-provisioning button monitoring with debounce and hold detection
// A long press wipes the WiFi credentials and restarts into a fresh provisioning cycle

use std::sync::Arc;

// Import Embassy time utilities for polling and grace delays
use embassy_time::{Duration, Instant, Timer};

// Import logging macros for debug output
use log::{debug, error, info};

use crate::config::ButtonTiming;
use crate::provisioning::Provisioner;
use crate::status::{Pulse, StatusPulse};
use crate::RestartHandle;

/// Debounced view of a single button sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Idle,
    Pressed,  // Down for longer than the debounce time
    Released, // Let go after a debounced press
    Held,     // Down for longer than the hold time
}

/// Pure debounce and hold tracking, fed with timestamped samples.
#[derive(Debug)]
pub struct HoldDetector {
    debounce_ms: u64,
    hold_ms: u64,
    pressed_since: Option<u64>,
    announced: bool,
}

impl HoldDetector {
    pub fn new(debounce_ms: u64, hold_ms: u64) -> Self {
        Self {
            debounce_ms,
            hold_ms,
            pressed_since: None,
            announced: false,
        }
    }

    pub fn sample(&mut self, pressed: bool, now_ms: u64) -> ButtonAction {
        if !pressed {
            self.pressed_since = None;
            return if std::mem::take(&mut self.announced) {
                ButtonAction::Released
            } else {
                ButtonAction::Idle
            };
        }

        let since = *self.pressed_since.get_or_insert(now_ms);
        let elapsed = now_ms.saturating_sub(since);

        if elapsed >= self.hold_ms {
            ButtonAction::Held
        } else if !self.announced && elapsed >= self.debounce_ms {
            self.announced = true;
            ButtonAction::Pressed
        } else {
            ButtonAction::Idle
        }
    }
}

/// Physical re-provisioning button.
pub trait ButtonInput: Send {
    fn is_pressed(&mut self) -> bool;
}

/// Re-provisioning button watcher - the only long-running loop besides the executor
pub struct ResetManager {
    button: Box<dyn ButtonInput>,
    provisioner: Arc<Provisioner>,
    status: StatusPulse,
    restart: RestartHandle,
    timing: ButtonTiming,
}

impl ResetManager {
    pub fn new(
        button: Box<dyn ButtonInput>,
        provisioner: Arc<Provisioner>,
        status: StatusPulse,
        restart: RestartHandle,
        timing: ButtonTiming,
    ) -> Self {
        Self {
            button,
            provisioner,
            status,
            restart,
            timing,
        }
    }

    /// Poll the button forever. Never returns: a long press ends in a restart.
    pub async fn run(mut self) {
        info!(
            "🚀 Starting re-provisioning button watcher (hold {}ms)",
            self.timing.hold_ms
        );

        let mut detector = HoldDetector::new(self.timing.debounce_ms, self.timing.hold_ms);

        loop {
            let pressed = self.button.is_pressed();
            match detector.sample(pressed, Instant::now().as_millis()) {
                ButtonAction::Pressed => info!("🔘 Button pressed"),
                ButtonAction::Released => info!("🔘 Button released"),
                ButtonAction::Held => self.reprovision().await,
                ButtonAction::Idle => {}
            }

            Timer::after(Duration::from_millis(self.timing.poll_ms)).await;
        }
    }

    async fn reprovision(&self) {
        info!("🔥 Button held, starting reprovisioning");
        self.status.pulse(Pulse::ResetArmed);

        Timer::after(Duration::from_millis(self.timing.reset_grace_ms)).await;

        if let Err(e) = self.provisioner.factory_reset() {
            error!("❌ Failed to clear provisioning data: {}", e);
        }

        Timer::after(Duration::from_millis(self.timing.restart_grace_ms)).await;

        debug!("Restarting after reprovisioning request");
        self.restart.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::ProvisioningState;
    use crate::sim::{restart_requested, SimButton, SimRadio, UnwindingRestart};
    use crate::status::StatusBoard;
    use embassy_futures::block_on;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn bounces_shorter_than_debounce_are_ignored() {
        let mut detector = HoldDetector::new(50, 10_000);

        assert_eq!(detector.sample(true, 0), ButtonAction::Idle);
        assert_eq!(detector.sample(true, 20), ButtonAction::Idle);
        assert_eq!(detector.sample(false, 40), ButtonAction::Idle);
    }

    #[test]
    fn press_and_release_are_reported_once() {
        let mut detector = HoldDetector::new(50, 10_000);

        assert_eq!(detector.sample(true, 0), ButtonAction::Idle);
        assert_eq!(detector.sample(true, 60), ButtonAction::Pressed);
        assert_eq!(detector.sample(true, 500), ButtonAction::Idle);
        assert_eq!(detector.sample(false, 600), ButtonAction::Released);
        assert_eq!(detector.sample(false, 700), ButtonAction::Idle);
    }

    #[test]
    fn hold_fires_after_the_threshold() {
        let mut detector = HoldDetector::new(50, 10_000);

        detector.sample(true, 1_000);
        assert_eq!(detector.sample(true, 10_999), ButtonAction::Pressed);
        assert_eq!(detector.sample(true, 11_000), ButtonAction::Held);
    }

    #[test]
    fn release_restarts_the_hold_timer() {
        let mut detector = HoldDetector::new(50, 1_000);

        detector.sample(true, 0);
        detector.sample(true, 900);
        detector.sample(false, 950);
        detector.sample(true, 1_000);

        assert_eq!(detector.sample(true, 1_500), ButtonAction::Pressed);
        assert_eq!(detector.sample(true, 2_000), ButtonAction::Held);
    }

    #[test]
    fn long_press_resets_provisioning_and_restarts() {
        let radio = SimRadio::new(true);
        let board = StatusBoard::new();
        let provisioner = Arc::new(Provisioner::new(
            Box::new(radio.transport()),
            Box::new(radio.station()),
            "PROV_A1B2C3".to_string(),
            5,
            board.pulse_handle(),
        ));
        let restart = Arc::new(UnwindingRestart::new());
        let timing = ButtonTiming {
            poll_ms: 2,
            debounce_ms: 4,
            hold_ms: 20,
            reset_grace_ms: 5,
            restart_grace_ms: 5,
        };
        let manager = ResetManager::new(
            Box::new(SimButton::held()),
            provisioner.clone(),
            board.pulse_handle(),
            restart.clone(),
            timing,
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| block_on(manager.run())));

        assert!(restart_requested(outcome));
        assert_eq!(restart.count(), 1);
        assert_eq!(provisioner.state(), ProvisioningState::ResetRequested);
        assert!(!provisioner.is_provisioned());
        assert_eq!(board.try_next_pulse(), Some(Pulse::ResetArmed));
    }
}
