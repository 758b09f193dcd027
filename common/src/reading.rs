use core::fmt::Write;

use thiserror::Error;

/// Longest message that still fits the 100 byte buffer the node publishes
/// from, leaving room for the terminator.
pub const MESSAGE_CAPACITY: usize = 99;

pub type Message = heapless::String<MESSAGE_CAPACITY>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("reading contains NaN")]
    NotANumber,
    #[error("message exceeds {MESSAGE_CAPACITY} bytes")]
    Overflow,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Reading {
    pub temperature: f32, // °C
    pub humidity: f32,    // percent
}

impl Reading {
    pub fn new(temperature: f32, humidity: f32) -> Self {
        Self {
            temperature,
            humidity,
        }
    }

    /// A failed sensor read shows up as NaN in either channel.
    pub fn is_valid(&self) -> bool {
        !self.temperature.is_nan() && !self.humidity.is_nan()
    }

    /// `{"temperature":X.XX,"humidity":Y.YY}`
    pub fn to_message(&self) -> Result<Message, MessageError> {
        if !self.is_valid() {
            return Err(MessageError::NotANumber);
        }

        let mut msg = Message::new();
        write!(
            msg,
            "{{\"temperature\":{:.2},\"humidity\":{:.2}}}",
            self.temperature, self.humidity
        )
        .map_err(|_| MessageError::Overflow)?;

        Ok(msg)
    }
}

impl core::fmt::Display for Reading {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Temperature: {:.2} °C, Humidity: {:.2} %",
            self.temperature, self.humidity
        )
    }
}
