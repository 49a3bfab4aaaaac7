//! This module defines the error types used by the `rangefinder` crate.

#![warn(missing_docs)]

/// Error type for ranging hardware operations.
///
/// Timeouts, spurious edges and reads after cancellation are not errors in
/// this crate; they surface as sentinel durations or `None`. This enum only
/// covers failures of the hardware surface itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RangingError {
    /// The GPIO backend could not be opened or refused an operation.
    Gpio(String),
    /// The PWM backend refused an operation.
    Pwm(String),
    /// A pin number is not usable on this backend.
    InvalidPin(u8),
    /// A pin is in the wrong mode for the requested operation.
    WrongMode(u8, &'static str),
    /// A time-of-flight device reported a failure.
    Device(String),
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
}

impl core::fmt::Display for RangingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RangingError::Gpio(msg) => write!(f, "GPIO error: {}", msg),
            RangingError::Pwm(msg) => write!(f, "PWM error: {}", msg),
            RangingError::InvalidPin(pin) => write!(f, "Invalid GPIO pin: {}", pin),
            RangingError::WrongMode(pin, msg) => write!(f, "GPIO {} in wrong mode: {}", pin, msg),
            RangingError::Device(msg) => write!(f, "Time-of-flight device error: {}", msg),
            RangingError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl core::error::Error for RangingError {}

/// Shorthand result used across the crate.
pub type Result<T> = core::result::Result<T, RangingError>;
