use std::time::Duration;

use common::node::Clock;

/// Monotonic millisecond counter plus blocking delays.
pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            epoch: std::time::Instant::now(),
        }
    }

    #[cfg(target_os = "espidf")]
    fn uptime(&self) -> Duration {
        esp_idf_svc::systime::EspSystemTime {}.now()
    }

    #[cfg(not(target_os = "espidf"))]
    fn uptime(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // truncation is the wraparound
        self.uptime().as_millis() as u32
    }

    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(target_os = "espidf")]
pub fn random_u16() -> u16 {
    // hardware RNG, seeded by the radio once Wi-Fi is up
    (unsafe { esp_idf_sys::esp_random() } & 0xffff) as u16
}

#[cfg(not(target_os = "espidf"))]
pub fn random_u16() -> u16 {
    rand::random()
}
