// Status LED Module
// Renders the steady status signal on an RGB LED and flashes it for transient pulses
// Red = unprovisioned or fault, blinking blue = provisioning, green = connected

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};
use esp_idf_svc::hal::gpio::{Gpio2, Gpio4, Gpio5, Output, PinDriver};
use log::info;

use crate::status::{Pulse, StatusBoard, StatusSignal};

const TICK: Duration = Duration::from_millis(250); // Blink period while provisioning
const FLASH: Duration = Duration::from_millis(80);

/// The three channels of the status LED, active high.
pub struct StatusLeds {
    pub red: PinDriver<'static, Gpio2, Output>,
    pub green: PinDriver<'static, Gpio4, Output>,
    pub blue: PinDriver<'static, Gpio5, Output>,
}

impl StatusLeds {
    fn show(&mut self, red: bool, green: bool, blue: bool) {
        self.red.set_level(red.into()).ok();
        self.green.set_level(green.into()).ok();
        self.blue.set_level(blue.into()).ok();
    }

    fn render(&mut self, signal: StatusSignal, blink_on: bool) {
        match signal {
            StatusSignal::Unprovisioned | StatusSignal::Fault => self.show(true, false, false),
            StatusSignal::Provisioning => self.show(false, false, blink_on),
            StatusSignal::Connected => self.show(false, true, false),
        }
    }

    /// White flashes, more of them for the pulses that matter more.
    async fn flash(&mut self, pulse: Pulse) {
        let repeats = match pulse {
            Pulse::ResetArmed => 5,
            Pulse::WifiDropped => 2,
            Pulse::MessageReceived | Pulse::MessagePublished => 1,
        };

        for _ in 0..repeats {
            self.show(true, true, true);
            Timer::after(FLASH).await;
            self.show(false, false, false);
            Timer::after(FLASH).await;
        }
    }
}

/// Drives the LED for the lifetime of the device. Pulses interrupt the steady
/// pattern and are shown in arrival order.
#[embassy_executor::task]
pub async fn status_led_task(mut leds: StatusLeds, status: StatusBoard) {
    info!("💡 Status LED task started");

    let mut blink_on = false;
    loop {
        leds.render(status.current(), blink_on);

        match select(status.next_pulse(), Timer::after(TICK)).await {
            Either::First(pulse) => leds.flash(pulse).await,
            Either::Second(()) => blink_on = !blink_on,
        }
    }
}
