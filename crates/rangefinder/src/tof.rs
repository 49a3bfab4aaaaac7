//! Bring-up sequencing for several I2C time-of-flight sensors on one bus.
//!
//! All parts power up answering at the same address. They are held in reset
//! through their shutdown lines, then released one at a time and given a
//! unique address before the next one wakes up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gpio::{Gpio, Level, PinClaim, PinMode};

/// Address every sensor answers at after reset.
pub const DEFAULT_ADDRESS: u8 = 0x29;

/// Shortest interval between distance polls, in microseconds.
pub const MIN_POLL_INTERVAL_US: u32 = 20_000;

/// Ranging profiles offered by VL53L0X-class parts.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccuracyMode {
    /// Default timing budget.
    Good,
    /// Longer budget, better accuracy.
    #[default]
    Better,
    /// Longest budget, best accuracy.
    Best,
    /// Extended range at reduced accuracy.
    LongRange,
    /// Shortest budget.
    HighSpeed,
}

/// Device driver boundary for one time-of-flight sensor.
pub trait TofSensor: Send {
    /// Move the device to a new 7-bit I2C address.
    fn set_address(&mut self, address: u8) -> Result<()>;

    /// Start continuous ranging.
    fn start_ranging(&mut self, mode: AccuracyMode) -> Result<()>;

    /// Stop ranging.
    fn stop_ranging(&mut self) -> Result<()>;

    /// Latest distance in millimetres.
    fn distance_mm(&mut self) -> Result<u16>;

    /// Measurement timing budget in microseconds.
    fn timing_budget_us(&self) -> u32;
}

/// Timing and mode for [`TofArray::bring_up`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TofConfig {
    /// How long all shutdown lines are held low.
    pub reset_hold: Duration,
    /// Delay after releasing one device before talking to it.
    pub boot_delay: Duration,
    /// Ranging profile.
    pub mode: AccuracyMode,
}

impl Default for TofConfig {
    fn default() -> Self {
        TofConfig {
            reset_hold: Duration::from_millis(500),
            boot_delay: Duration::from_millis(500),
            mode: AccuracyMode::Better,
        }
    }
}

/// One sensor to bring up: its shutdown line, target address and driver.
pub struct TofSlot {
    /// GPIO wired to the device's XSHUT input.
    pub shutdown_pin: u8,
    /// Address to assign.
    pub address: u8,
    /// Driver handle.
    pub device: Box<dyn TofSensor>,
}

impl TofSlot {
    /// Describe one sensor.
    pub fn new(shutdown_pin: u8, address: u8, device: Box<dyn TofSensor>) -> Self {
        TofSlot { shutdown_pin, address, device }
    }
}

struct Active {
    claim: PinClaim,
    address: u8,
    device: Box<dyn TofSensor>,
}

/// A set of time-of-flight sensors that have been re-addressed and started.
pub struct TofArray {
    sensors: Vec<Active>,
    running: bool,
}

impl TofArray {
    /// Reset every sensor, then wake and address them in order.
    pub fn bring_up(gpio: Arc<dyn Gpio>, slots: Vec<TofSlot>, config: TofConfig) -> Result<Self> {
        info!(count = slots.len(), mode = ?config.mode, "Bringing up time-of-flight sensors");

        let mut claims = Vec::with_capacity(slots.len());
        for slot in &slots {
            let claim = PinClaim::new(Arc::clone(&gpio), slot.shutdown_pin, PinMode::Output)?;
            claim.write(Level::Low)?;
            claims.push(claim);
        }
        spin_sleep::sleep(config.reset_hold);

        // Dropping `array` on an early return shuts down whatever started.
        let mut array = TofArray { sensors: Vec::with_capacity(slots.len()), running: true };
        for (slot, claim) in slots.into_iter().zip(claims) {
            let TofSlot { shutdown_pin, address, mut device } = slot;
            claim.write(Level::High)?;
            spin_sleep::sleep(config.boot_delay);
            device.set_address(address)?;
            device.start_ranging(config.mode)?;
            debug!(shutdown_pin, address, "Sensor ranging");
            array.sensors.push(Active { claim, address, device });
        }
        Ok(array)
    }

    /// Number of sensors.
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// `true` when no sensors were configured.
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Assigned addresses in bring-up order.
    pub fn addresses(&self) -> Vec<u8> {
        self.sensors.iter().map(|s| s.address).collect()
    }

    /// Interval to wait between polls: the largest timing budget, at least
    /// [`MIN_POLL_INTERVAL_US`].
    pub fn poll_interval(&self) -> Duration {
        let budget = self
            .sensors
            .iter()
            .map(|s| s.device.timing_budget_us())
            .max()
            .unwrap_or(0)
            .max(MIN_POLL_INTERVAL_US);
        Duration::from_micros(budget as u64)
    }

    /// Distance from every sensor, `None` where the device failed or the
    /// array was shut down.
    pub fn read_all(&mut self) -> Vec<Option<u16>> {
        let running = self.running;
        self.sensors
            .iter_mut()
            .map(|s| {
                if !running {
                    return None;
                }
                match s.device.distance_mm() {
                    Ok(mm) => Some(mm),
                    Err(e) => {
                        warn!(address = s.address, error = %e, "Time-of-flight read failed");
                        None
                    }
                }
            })
            .collect()
    }

    /// Stop ranging in reverse order, hold each device in reset and restore
    /// the shutdown pins. Further calls do nothing.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for sensor in self.sensors.iter_mut().rev() {
            if let Err(e) = sensor.device.stop_ranging() {
                warn!(address = sensor.address, error = %e, "Failed to stop ranging");
            }
            if let Err(e) = sensor.claim.write(Level::Low) {
                warn!(pin = sensor.claim.pin(), error = %e, "Failed to assert shutdown line");
            }
            sensor.claim.release();
        }
        info!("Time-of-flight sensors shut down");
    }
}

impl Drop for TofArray {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimGpio, SimTof};

    fn fast() -> TofConfig {
        TofConfig {
            reset_hold: Duration::ZERO,
            boot_delay: Duration::ZERO,
            mode: AccuracyMode::Better,
        }
    }

    #[test]
    fn test_bring_up_sequence() {
        let sim = Arc::new(SimGpio::new());
        let slots = vec![
            TofSlot::new(6, 0x2B, Box::new(SimTof::new(sim.clone(), 6, 150))),
            TofSlot::new(5, 0x2D, Box::new(SimTof::new(sim.clone(), 5, 900))),
        ];

        let mut array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.addresses(), vec![0x2B, 0x2D]);
        // Both lines low before either is raised, then raised in order.
        assert_eq!(
            sim.writes(),
            vec![(6, Level::Low), (5, Level::Low), (6, Level::High), (5, Level::High)]
        );
        assert_eq!(array.read_all(), vec![Some(150), Some(900)]);
    }

    #[test]
    fn test_second_device_addressed_while_first_already_up() {
        // SimTof refuses to be addressed while held in reset, so success means
        // every line was raised before its device was addressed.
        let sim = Arc::new(SimGpio::new());
        let slots = vec![
            TofSlot::new(6, 0x2B, Box::new(SimTof::new(sim.clone(), 6, 1))),
            TofSlot::new(5, 0x2D, Box::new(SimTof::new(sim.clone(), 5, 2))),
        ];
        let array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        assert_eq!(sim.level(6), Level::High);
        assert_eq!(sim.level(5), Level::High);
        drop(array);
    }

    #[test]
    fn test_shutdown_restores_pins() {
        let sim = Arc::new(SimGpio::new());
        sim.set_mode(6, PinMode::Alt(2)).unwrap();
        let slots = vec![TofSlot::new(6, 0x2B, Box::new(SimTof::new(sim.clone(), 6, 10)))];
        let mut array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        assert_eq!(sim.mode(6).unwrap(), PinMode::Output);

        array.shutdown();
        assert_eq!(sim.level(6), Level::Low);
        assert_eq!(sim.mode(6).unwrap(), PinMode::Alt(2));
        assert_eq!(array.read_all(), vec![None]);
        array.shutdown(); // idempotent
    }

    #[test]
    fn test_failed_read_is_absorbed() {
        let sim = Arc::new(SimGpio::new());
        let slots = vec![TofSlot::new(6, 0x2B, Box::new(SimTof::new(sim.clone(), 6, 10)))];
        let mut array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        sim.set_mode(6, PinMode::Output).unwrap();
        sim.write(6, Level::Low).unwrap(); // device falls back into reset
        assert_eq!(array.read_all(), vec![None]);
    }

    #[test]
    fn test_poll_interval_floor() {
        let sim = Arc::new(SimGpio::new());
        let slots = vec![
            TofSlot::new(6, 0x2B, Box::new(SimTof::new(sim.clone(), 6, 1).with_timing_budget(8_000))),
        ];
        let array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        assert_eq!(array.poll_interval(), Duration::from_micros(20_000));

        let slots = vec![
            TofSlot::new(5, 0x2D, Box::new(SimTof::new(sim.clone(), 5, 1).with_timing_budget(33_000))),
        ];
        let array = TofArray::bring_up(sim.clone(), slots, fast()).unwrap();
        assert_eq!(array.poll_interval(), Duration::from_micros(33_000));
    }

    #[test]
    fn test_bring_up_fails_on_bad_pin() {
        let sim = Arc::new(SimGpio::new());
        let slots = vec![TofSlot::new(99, 0x2B, Box::new(SimTof::new(sim.clone(), 99, 1)))];
        assert!(TofArray::bring_up(sim, slots, fast()).is_err());
    }
}
