// DHT11 / DHT22 (AM2302) single wire temperature and humidity sensor.
//
// A transfer is 40 bits, MSB first: humidity (16), temperature (16),
// checksum (8). Each bit is a ~50us low followed by a high pulse of ~27us
// (0) or ~70us (1).

use common::node::{Sensor, SensorError};
use common::{Reading, SensorKind};

#[allow(unused)]
pub const FRAME_BITS: usize = 40;

pub type Frame = [u8; 5];

/// (low, high) durations of one bit, in any consistent unit.
#[allow(unused)]
pub type Pulse = (u32, u32);

#[allow(unused)]
pub fn frame_from_pulses(pulses: &[Pulse; FRAME_BITS]) -> Frame {
    let mut frame = [0u8; 5];
    for (i, (low, high)) in pulses.iter().enumerate() {
        frame[i / 8] <<= 1;
        // a 1 keeps the line high longer than the low lead-in
        if high > low {
            frame[i / 8] |= 1;
        }
    }
    frame
}

pub fn checksum(frame: &Frame) -> u8 {
    frame[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

pub fn decode(kind: SensorKind, frame: &Frame) -> Result<Reading, SensorError> {
    if checksum(frame) != frame[4] {
        return Err(SensorError::Checksum);
    }

    let reading = match kind {
        SensorKind::Dht11 => {
            let humidity = frame[0] as f32 + frame[1] as f32 * 0.1;
            let mut temperature = frame[2] as f32 + (frame[3] & 0x0f) as f32 * 0.1;
            if frame[3] & 0x80 != 0 {
                temperature = -temperature;
            }
            Reading::new(temperature, humidity)
        }
        SensorKind::Dht22 => {
            let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f32 * 0.1;
            let mut temperature = u16::from_be_bytes([frame[2] & 0x7f, frame[3]]) as f32 * 0.1;
            if frame[2] & 0x80 != 0 {
                temperature = -temperature;
            }
            Reading::new(temperature, humidity)
        }
    };

    Ok(reading)
}

#[cfg(target_os = "espidf")]
pub use esp::Dht;

#[cfg(not(target_os = "espidf"))]
pub use host::Dht;

#[cfg(target_os = "espidf")]
mod esp {
    use std::time::Duration;

    use anyhow::Result;
    use esp_idf_hal::delay::Ets;
    use esp_idf_hal::gpio::{AnyIOPin, InputOutput, PinDriver, Pull};
    use esp_idf_hal::interrupt;
    use log::info;

    use super::*;

    const RESPONSE_TIMEOUT_US: i64 = 1000;

    pub struct Dht {
        pin: PinDriver<'static, AnyIOPin, InputOutput>,
        kind: SensorKind,
    }

    impl Dht {
        pub fn new(pin_number: u8, kind: SensorKind) -> Result<Self> {
            // pin number comes from configuration, not from `Peripherals`
            let pin = unsafe { AnyIOPin::new(pin_number as i32) };
            let mut pin = PinDriver::input_output_od(pin)?;
            pin.set_pull(Pull::Up)?;
            pin.set_high()?;

            info!("{:?} on GPIO{}", kind, pin_number);

            // sensor needs ~1s after power up before the first transfer
            std::thread::sleep(Duration::from_secs(1));

            Ok(Self { pin, kind })
        }

        fn start_signal(&self) -> Duration {
            match self.kind {
                SensorKind::Dht11 => Duration::from_millis(20),
                SensorKind::Dht22 => Duration::from_micros(1100),
            }
        }

        fn transfer(&mut self) -> Result<Frame, SensorError> {
            let driver = |e: esp_idf_sys::EspError| SensorError::Driver(e.to_string());

            self.pin.set_low().map_err(driver)?;
            Ets::delay_us(self.start_signal().as_micros() as u32);

            let mut pulses = [(0u32, 0u32); FRAME_BITS];

            // bit timing is tens of microseconds, keep interrupts out
            interrupt::free(|| -> Result<Frame, SensorError> {
                self.pin.set_high().map_err(driver)?;
                Ets::delay_us(40);

                // sensor acknowledges with 80us low, 80us high
                self.wait_while(false)?;
                self.wait_while(true)?;

                for pulse in pulses.iter_mut() {
                    let low = self.wait_while(false)?;
                    let high = self.wait_while(true)?;
                    *pulse = (low, high);
                }
                Ok(frame_from_pulses(&pulses))
            })
        }

        /// Waits for the line to leave `level`; returns how long that took in us.
        fn wait_while(&self, level: bool) -> Result<u32, SensorError> {
            let start = now_us();
            while self.pin.is_high() == level {
                if now_us() - start > RESPONSE_TIMEOUT_US {
                    return Err(SensorError::Timeout);
                }
            }
            Ok((now_us() - start) as u32)
        }
    }

    fn now_us() -> i64 {
        unsafe { esp_idf_sys::esp_timer_get_time() }
    }

    impl Sensor for Dht {
        fn read(&mut self) -> Result<Reading, SensorError> {
            let frame = self.transfer();

            // release the line for the next transfer
            let _ = self.pin.set_high();

            decode(self.kind, &frame?)
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use log::debug;
    use rand::Rng;

    use super::*;

    /// Chance of a corrupted transfer, like a real DHT on a long wire.
    const FAILURE_ODDS: f64 = 0.05;

    /// Desktop stand-in: a slow random walk encoded into a DHT frame and run
    /// through the same decoder the device uses.
    pub struct Dht {
        kind: SensorKind,
        temperature: f32,
        humidity: f32,
    }

    impl Dht {
        pub fn new(pin_number: u8, kind: SensorKind) -> anyhow::Result<Self> {
            debug!("simulated {:?} on GPIO{}", kind, pin_number);
            Ok(Self {
                kind,
                temperature: 22.0,
                humidity: 50.0,
            })
        }

        fn encode(&self) -> Frame {
            let mut frame = [0u8; 5];
            match self.kind {
                SensorKind::Dht11 => {
                    let t = self.temperature.abs();
                    frame[0] = self.humidity as u8;
                    frame[1] = ((self.humidity.fract() * 10.0) as u8).min(9);
                    frame[2] = t as u8;
                    frame[3] = ((t.fract() * 10.0) as u8).min(9);
                    if self.temperature < 0.0 {
                        frame[3] |= 0x80;
                    }
                }
                SensorKind::Dht22 => {
                    let h = (self.humidity * 10.0).round() as u16;
                    let t = (self.temperature.abs() * 10.0).round() as u16;
                    frame[..2].copy_from_slice(&h.to_be_bytes());
                    frame[2..4].copy_from_slice(&t.to_be_bytes());
                    if self.temperature < 0.0 {
                        frame[2] |= 0x80;
                    }
                }
            }
            frame[4] = checksum(&frame);
            frame
        }
    }

    impl Sensor for Dht {
        fn read(&mut self) -> Result<Reading, SensorError> {
            let mut rng = rand::rng();

            self.temperature = (self.temperature + rng.random_range(-0.3..0.3)).clamp(-40.0, 80.0);
            self.humidity = (self.humidity + rng.random_range(-1.0..1.0)).clamp(0.0, 100.0);

            let mut frame = self.encode();
            if rng.random_bool(FAILURE_ODDS) {
                // flipped bit on the wire
                frame[rng.random_range(0..4usize)] ^= 1u8 << rng.random_range(0..8u32);
            }

            decode(self.kind, &frame)
        }
    }
}
