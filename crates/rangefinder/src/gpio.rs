//! Hardware control surface consumed by the rangers.
//!
//! The rangers never talk to a GPIO driver directly. They go through the
//! [`Gpio`] and [`Pwm`] traits, which a backend implements (`sim` for tests
//! and desk runs, `rpi` for a Raspberry Pi). Edge callbacks and pin modes are
//! tied to owners through [`Subscription`] and [`PinClaim`], both released
//! deterministically on drop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

/// Digital level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Logic low.
    Low,
    /// Logic high.
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl core::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Function of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    /// Digital input.
    Input,
    /// Digital output.
    Output,
    /// One of the SoC alternate functions (ALT0..ALTn).
    Alt(u8),
}

/// A level change observed on a pin.
///
/// `tick` is a wrapping 32-bit microsecond counter. Only differences between
/// ticks from the same backend are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Pin that changed.
    pub pin: u8,
    /// Level after the change.
    pub level: Level,
    /// Backend tick at the change, in microseconds.
    pub tick: u32,
}

impl EdgeEvent {
    /// Construct an edge event.
    pub const fn new(pin: u8, level: Level, tick: u32) -> Self {
        EdgeEvent { pin, level, tick }
    }
}

/// Callback invoked from the backend's dispatch thread for every edge on a
/// watched pin.
pub type EdgeCallback = Box<dyn FnMut(EdgeEvent) + Send + 'static>;

/// Handle for a registered edge callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Digital GPIO control surface.
pub trait Gpio: Send + Sync {
    /// Current mode of `pin`.
    fn mode(&self, pin: u8) -> Result<PinMode>;

    /// Switch `pin` to `mode`.
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()>;

    /// Drive an output pin.
    fn write(&self, pin: u8, level: Level) -> Result<()>;

    /// Sample a pin.
    fn read(&self, pin: u8) -> Result<Level>;

    /// Emit a single pulse of `width` at `level` on an output pin, returning
    /// the line to the opposite level afterwards.
    ///
    /// Watchers of `pin` observe both edges of the pulse.
    fn trigger(&self, pin: u8, width: Duration, level: Level) -> Result<()>;

    /// Register `callback` for both edges of `pin`.
    fn watch(&self, pin: u8, callback: EdgeCallback) -> Result<WatchId>;

    /// Remove a callback. Unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// Current backend tick in microseconds (wrapping).
    fn tick(&self) -> u32;
}

/// PWM control surface used to drive hobby servos.
pub trait Pwm: Send + Sync {
    /// Set the PWM frequency of `pin` in hertz.
    fn set_frequency(&self, pin: u8, hz: u32) -> Result<()>;

    /// Set the number of duty steps in one PWM period.
    fn set_range(&self, pin: u8, range: u32) -> Result<()>;

    /// Set the duty value, in steps of the configured range.
    fn set_duty_cycle(&self, pin: u8, duty: u32) -> Result<()>;
}

/// Scoped edge-callback registration.
///
/// Dropping the subscription unregisters the callback.
pub struct Subscription {
    gpio: Arc<dyn Gpio>,
    id: Option<WatchId>,
    pin: u8,
}

impl Subscription {
    /// Register `callback` on `pin` for as long as the returned value lives.
    pub fn new<F>(gpio: Arc<dyn Gpio>, pin: u8, callback: F) -> Result<Self>
    where
        F: FnMut(EdgeEvent) + Send + 'static,
    {
        let id = gpio.watch(pin, Box::new(callback))?;
        debug!(pin, id = id.0, "Edge callback registered");
        Ok(Subscription { gpio, id: Some(id), pin })
    }

    /// Pin this subscription listens on.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Unregister now. Further calls do nothing.
    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            self.gpio.unwatch(id);
            debug!(pin = self.pin, id = id.0, "Edge callback released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A pin switched into a mode for the lifetime of its owner.
///
/// The prior mode is recorded on construction and put back by
/// [`PinClaim::release`] or on drop.
pub struct PinClaim {
    gpio: Arc<dyn Gpio>,
    pin: u8,
    prior: PinMode,
    released: bool,
}

impl PinClaim {
    /// Record the current mode of `pin` and switch it to `mode`.
    pub fn new(gpio: Arc<dyn Gpio>, pin: u8, mode: PinMode) -> Result<Self> {
        let prior = gpio.mode(pin)?;
        gpio.set_mode(pin, mode)?;
        Ok(PinClaim { gpio, pin, prior, released: false })
    }

    /// The claimed pin.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Mode the pin had before it was claimed.
    pub fn prior_mode(&self) -> PinMode {
        self.prior
    }

    /// Drive the claimed pin.
    pub fn write(&self, level: Level) -> Result<()> {
        self.gpio.write(self.pin, level)
    }

    /// Restore the prior mode. Further calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.gpio.set_mode(self.pin, self.prior) {
            warn!(pin = self.pin, error = %e, "Failed to restore pin mode");
        }
    }
}

impl Drop for PinClaim {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpio;
    use parking_lot::Mutex;

    #[test]
    fn test_level_conversions() {
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::from(false), Level::Low);
        assert_eq!(!Level::High, Level::Low);
        assert_eq!(!Level::Low, Level::High);
    }

    #[test]
    fn test_subscription_unregisters_on_drop() {
        let sim = Arc::new(SimGpio::new());
        let gpio: Arc<dyn Gpio> = sim.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = {
            let seen = Arc::clone(&seen);
            Subscription::new(gpio, 24, move |ev| seen.lock().push(ev)).unwrap()
        };
        assert_eq!(sub.pin(), 24);
        assert_eq!(sim.watcher_count(24), 1);

        sim.inject(24, Level::High);
        drop(sub);
        assert_eq!(sim.watcher_count(24), 0);
        sim.inject(24, Level::Low);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, Level::High);
    }

    #[test]
    fn test_pin_claim_restores_prior_mode() {
        let sim = Arc::new(SimGpio::new());
        sim.set_mode(18, PinMode::Alt(5)).unwrap();

        let mut claim = PinClaim::new(sim.clone(), 18, PinMode::Output).unwrap();
        assert_eq!(claim.prior_mode(), PinMode::Alt(5));
        assert_eq!(sim.mode(18).unwrap(), PinMode::Output);

        claim.release();
        assert_eq!(sim.mode(18).unwrap(), PinMode::Alt(5));

        // A second release must not clobber a mode set by someone else.
        sim.set_mode(18, PinMode::Input).unwrap();
        drop(claim);
        assert_eq!(sim.mode(18).unwrap(), PinMode::Input);
    }
}
