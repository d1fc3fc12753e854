// Status indication shared between the orchestrator and the LED driver
// The steady state is owned by the orchestrator; subsystems may only raise pulses

use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, info};

use crate::lock;

// Pulses beyond this many pending flashes are dropped
const PULSE_QUEUE_SIZE: usize = 8;

/// Coarse lifecycle signal shown by the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Unprovisioned, // Red: booting or no network identity yet
    Provisioning,  // Blinking blue: waiting for BLE credentials / WiFi
    Connected,     // Green: provisioned and online
    Fault,         // Solid red: a subsystem is permanently degraded
}

/// Short flash layered on top of the steady signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    WifiDropped,
    MessageReceived,
    MessagePublished,
    ResetArmed, // Button held long enough, factory reset follows
}

struct Shared {
    steady: Mutex<StatusSignal>,
    pulses: Channel<CriticalSectionRawMutex, Pulse, PULSE_QUEUE_SIZE>,
}

/// Owner handle of the status indicator.
#[derive(Clone)]
pub struct StatusBoard {
    shared: Arc<Shared>,
}

/// Pulse-only view handed to subsystems.
#[derive(Clone)]
pub struct StatusPulse {
    shared: Arc<Shared>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                steady: Mutex::new(StatusSignal::Unprovisioned),
                pulses: Channel::new(),
            }),
        }
    }

    pub fn set(&self, signal: StatusSignal) {
        let mut steady = lock(&self.shared.steady);
        if *steady != signal {
            info!("💡 Status: {:?} -> {:?}", *steady, signal);
            *steady = signal;
        }
    }

    pub fn current(&self) -> StatusSignal {
        *lock(&self.shared.steady)
    }

    pub fn pulse_handle(&self) -> StatusPulse {
        StatusPulse {
            shared: self.shared.clone(),
        }
    }

    /// Next pending pulse, without waiting.
    pub fn try_next_pulse(&self) -> Option<Pulse> {
        self.shared.pulses.try_receive().ok()
    }

    /// Wait for the next pulse.
    pub async fn next_pulse(&self) -> Pulse {
        self.shared.pulses.receive().await
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPulse {
    pub fn pulse(&self, pulse: Pulse) {
        // The indicator is best-effort, a full queue just loses a flash
        if self.shared.pulses.try_send(pulse).is_err() {
            debug!("Pulse queue full, dropping {:?}", pulse);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_starts_unprovisioned() {
        assert_eq!(StatusBoard::new().current(), StatusSignal::Unprovisioned);
    }

    #[test]
    fn pulses_reach_the_board_in_order() {
        let board = StatusBoard::new();
        let handle = board.pulse_handle();

        handle.pulse(Pulse::WifiDropped);
        handle.pulse(Pulse::MessageReceived);

        assert_eq!(board.try_next_pulse(), Some(Pulse::WifiDropped));
        assert_eq!(board.try_next_pulse(), Some(Pulse::MessageReceived));
        assert_eq!(board.try_next_pulse(), None);
    }

    #[test]
    fn overflowing_pulses_are_dropped_silently() {
        let board = StatusBoard::new();
        let handle = board.pulse_handle();

        for _ in 0..PULSE_QUEUE_SIZE + 4 {
            handle.pulse(Pulse::MessagePublished);
        }

        let mut drained = 0;
        while board.try_next_pulse().is_some() {
            drained += 1;
        }
        assert_eq!(drained, PULSE_QUEUE_SIZE);
    }
}
