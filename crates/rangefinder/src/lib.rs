#![warn(missing_docs)]
#![doc = "GPIO-level drivers for HC-SR04 style ultrasonic rangers."]
#![doc = ""]
#![doc = "Echo widths are measured from backend edge timestamps rather than by"]
#![doc = "busy-polling the echo line. On top of the single-sensor [`Ranger`] sit a"]
#![doc = "4-bit multiplexer sequencer ([`MuxRanger`]), a servo-mounted scanner"]
#![doc = "([`ScanningRanger`]) and bring-up sequencing for a bank of I2C"]
#![doc = "time-of-flight sensors ([`TofArray`])."]
#![doc = ""]
#![doc = "Hardware is reached only through the [`Gpio`] and [`Pwm`] traits. The"]
#![doc = "[`sim`] backend is always built; the `rpi` feature adds a Raspberry Pi"]
#![doc = "backend."]

pub mod capture;
pub mod error;
pub mod gpio;
pub mod mux;
pub mod ranger;
pub mod scanner;
pub mod sim;
pub mod tof;

#[cfg(feature = "rpi")]
pub mod rpi;

pub use capture::{EdgeCapture, Measurement, Phase, SharedCapture};
pub use error::{RangingError, Result};
pub use gpio::{EdgeEvent, Gpio, Level, PinClaim, PinMode, Pwm, Subscription};
pub use mux::{MUX_CHANNELS, MuxConfig, MuxRanger, MuxReadings};
pub use ranger::{Ranger, RangerConfig, round_trip_to_meters};
pub use scanner::{ScanReading, ScannerConfig, ScanningRanger};
pub use tof::{AccuracyMode, TofArray, TofConfig, TofSensor, TofSlot};
