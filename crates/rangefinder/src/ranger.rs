//! Single trigger/echo ultrasonic ranger.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capture::{EdgeCapture, SharedCapture};
use crate::error::{RangingError, Result};
use crate::gpio::{Gpio, Level, PinClaim, PinMode, Subscription};

/// Longest a [`Ranger::read`] waits for an echo by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Round trip reported when no echo arrives, in microseconds.
pub const TIMEOUT_SENTINEL_US: u32 = 20_000;

/// Width of the trigger pulse.
pub const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Speed of sound used for conversions, in cm/s.
pub const SPEED_OF_SOUND_CM_S: f64 = 34_330.0;

/// Convert a round-trip time to a one-way distance in metres.
///
/// `(duration / 2) / 1e6 * speed_cm_s / 100`
pub fn round_trip_to_meters(duration_us: u32, speed_cm_s: f64) -> f64 {
    (duration_us as f64 / 2.0) / 1_000_000.0 * speed_cm_s / 100.0
}

/// Tuning for a [`Ranger`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangerConfig {
    /// How long `read` waits for the echo.
    pub timeout: Duration,
    /// Value returned for "no echo / out of range".
    pub sentinel_us: u32,
    /// Echo widths at or above this are reported as the sentinel.
    pub ceiling_us: Option<u32>,
    /// Trigger pulse width.
    pub pulse_width: Duration,
    /// Speed of sound in cm/s.
    pub speed_of_sound_cm_s: f64,
}

impl Default for RangerConfig {
    fn default() -> Self {
        RangerConfig {
            timeout: DEFAULT_TIMEOUT,
            sentinel_us: TIMEOUT_SENTINEL_US,
            ceiling_us: None,
            pulse_width: TRIGGER_PULSE,
            speed_of_sound_cm_s: SPEED_OF_SOUND_CM_S,
        }
    }
}

impl RangerConfig {
    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.speed_of_sound_cm_s <= 0.0 {
            return Err(RangingError::InvalidConfig("speed of sound must be positive"));
        }
        if self.pulse_width.is_zero() {
            return Err(RangingError::InvalidConfig("trigger pulse width must be non-zero"));
        }
        if self.ceiling_us == Some(0) {
            return Err(RangingError::InvalidConfig("echo ceiling must be positive"));
        }
        Ok(())
    }
}

/// An HC-SR04 style sensor with separate trigger and echo pins.
///
/// A pulse on the trigger starts a ping; the echo pin then stays high for
/// the sonar round trip. Edges are captured through backend callbacks.
///
/// `read` takes `&mut self`, so one ranger never has two pings in flight.
pub struct Ranger {
    gpio: Arc<dyn Gpio>,
    trigger: PinClaim,
    echo: PinClaim,
    capture: SharedCapture,
    subscriptions: Vec<Subscription>,
    config: RangerConfig,
    active: bool,
}

impl Ranger {
    /// Claim the pins and start listening for edges.
    pub fn new(gpio: Arc<dyn Gpio>, trigger_pin: u8, echo_pin: u8, config: RangerConfig) -> Result<Self> {
        config.validate()?;
        let trigger = PinClaim::new(Arc::clone(&gpio), trigger_pin, PinMode::Output)?;
        trigger.write(Level::Low)?;
        let echo = PinClaim::new(Arc::clone(&gpio), echo_pin, PinMode::Input)?;

        let mut edge_capture = EdgeCapture::new(trigger_pin, echo_pin);
        if let Some(ceiling) = config.ceiling_us {
            edge_capture = edge_capture.with_ceiling(ceiling);
        }
        let capture = SharedCapture::new(edge_capture);

        let mut subscriptions = Vec::with_capacity(2);
        for pin in [trigger_pin, echo_pin] {
            let capture = capture.clone();
            subscriptions.push(Subscription::new(Arc::clone(&gpio), pin, move |ev| {
                capture.handle_edge(ev)
            })?);
        }

        info!(trigger_pin, echo_pin, timeout = ?config.timeout, "Ranger ready");
        Ok(Ranger { gpio, trigger, echo, capture, subscriptions, config, active: true })
    }

    /// Trigger pin number.
    pub fn trigger_pin(&self) -> u8 {
        self.trigger.pin()
    }

    /// Echo pin number.
    pub fn echo_pin(&self) -> u8 {
        self.echo.pin()
    }

    /// Configuration in use.
    pub fn config(&self) -> &RangerConfig {
        &self.config
    }

    /// `false` once cancelled.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ping and wait for the round trip, in microseconds.
    ///
    /// Returns the sentinel when no echo arrives within the timeout and
    /// `None` after [`Ranger::cancel`].
    pub fn read(&mut self) -> Option<u32> {
        self.read_within(self.config.timeout)
    }

    /// Like [`Ranger::read`] with an explicit wait bound.
    pub fn read_within(&mut self, timeout: Duration) -> Option<u32> {
        if !self.active {
            return None;
        }
        let before = self.capture.generation();
        if !self.pulse() {
            return Some(self.config.sentinel_us);
        }

        match self.capture.wait_newer(before, timeout) {
            Some(m) if m.out_of_range => {
                debug!(pin = self.echo.pin(), duration_us = m.duration_us, "Echo out of range");
                Some(self.config.sentinel_us)
            }
            Some(m) => {
                debug!(pin = self.echo.pin(), duration_us = m.duration_us, "Echo");
                Some(m.duration_us)
            }
            None => {
                warn!(pin = self.echo.pin(), ?timeout, "No echo before timeout");
                Some(self.config.sentinel_us)
            }
        }
    }

    /// Ping and return the distance in metres.
    pub fn read_distance(&mut self) -> Option<f64> {
        self.read().map(|d| self.to_meters(d))
    }

    /// Emit one trigger pulse without waiting. Returns `false` if the
    /// ranger is cancelled or the backend refused the pulse.
    pub fn pulse(&mut self) -> bool {
        if !self.active {
            return false;
        }
        match self.gpio.trigger(self.trigger.pin(), self.config.pulse_width, Level::High) {
            Ok(()) => true,
            Err(e) => {
                warn!(pin = self.trigger.pin(), error = %e, "Trigger pulse failed");
                false
            }
        }
    }

    /// Most recent round trip without pinging: the sentinel if nothing has
    /// been measured yet or the last echo was out of range, `None` after
    /// cancel.
    pub fn last(&self) -> Option<u32> {
        if !self.active {
            return None;
        }
        Some(match self.capture.latest() {
            Some(m) if !m.out_of_range => m.duration_us,
            _ => self.config.sentinel_us,
        })
    }

    /// Convert a round trip to metres with this ranger's speed of sound.
    pub fn to_meters(&self, duration_us: u32) -> f64 {
        round_trip_to_meters(duration_us, self.config.speed_of_sound_cm_s)
    }

    #[cfg(test)]
    fn capture(&self) -> &SharedCapture {
        &self.capture
    }

    /// Stop listening and put the pins back in their prior modes. Further
    /// calls do nothing; reads afterwards return `None`.
    pub fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        for sub in self.subscriptions.iter_mut() {
            sub.cancel();
        }
        self.trigger.release();
        self.echo.release();
        info!(trigger_pin = self.trigger.pin(), echo_pin = self.echo.pin(), "Ranger cancelled");
    }
}

impl Drop for Ranger {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpio;
    use std::time::Instant;

    const EPSILON: f64 = 1e-6;
    const TRIG: u8 = 18;
    const ECHO: u8 = 24;

    fn quick() -> RangerConfig {
        RangerConfig { timeout: Duration::from_millis(20), ..RangerConfig::default() }
    }

    #[test]
    fn test_distance_formula() {
        // (5800 / 2) / 1e6 * 34330 / 100
        assert!((round_trip_to_meters(5800, SPEED_OF_SOUND_CM_S) - 0.99557).abs() < EPSILON);
        assert!((round_trip_to_meters(TIMEOUT_SENTINEL_US, SPEED_OF_SOUND_CM_S) - 3.433).abs() < EPSILON);
        assert_eq!(round_trip_to_meters(0, SPEED_OF_SOUND_CM_S), 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(RangerConfig::default().validate().is_ok());
        let bad = RangerConfig { speed_of_sound_cm_s: 0.0, ..RangerConfig::default() };
        assert!(matches!(bad.validate(), Err(RangingError::InvalidConfig(_))));
        let bad = RangerConfig { ceiling_us: Some(0), ..RangerConfig::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_read_returns_duration() {
        let sim = Arc::new(SimGpio::new());
        sim.script_echoes(TRIG, ECHO, vec![Some(5800), Some(1200)]);
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();

        assert_eq!(sim.mode(TRIG).unwrap(), PinMode::Output);
        assert_eq!(sim.mode(ECHO).unwrap(), PinMode::Input);
        assert_eq!(ranger.last(), Some(TIMEOUT_SENTINEL_US));

        assert_eq!(ranger.read(), Some(5800));
        assert_eq!(ranger.last(), Some(5800));
        let d = ranger.read_distance().unwrap();
        assert!((d - round_trip_to_meters(1200, SPEED_OF_SOUND_CM_S)).abs() < EPSILON);
        assert_eq!(sim.trigger_count(TRIG), 2);
    }

    #[test]
    fn test_no_echo_returns_sentinel() {
        let sim = Arc::new(SimGpio::new());
        sim.script_echoes(TRIG, ECHO, vec![None]);
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();

        let started = Instant::now();
        assert_eq!(ranger.read(), Some(TIMEOUT_SENTINEL_US));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_ceiling_reports_sentinel() {
        let sim = Arc::new(SimGpio::new());
        sim.script_echoes(TRIG, ECHO, vec![Some(23_508), Some(23_509), Some(40_000)]);
        let config = RangerConfig { ceiling_us: Some(23_509), sentinel_us: 23_509, ..quick() };
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, config).unwrap();

        assert_eq!(ranger.read(), Some(23_508));
        assert_eq!(ranger.read(), Some(23_509));
        assert_eq!(ranger.read(), Some(23_509));
    }

    #[test]
    fn test_trigger_failure_reports_sentinel() {
        let sim = Arc::new(SimGpio::new());
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();
        sim.set_faulty(TRIG, true);
        assert_eq!(ranger.read(), Some(TIMEOUT_SENTINEL_US));
        sim.set_faulty(TRIG, false);
    }

    #[test]
    fn test_cancel_restores_and_reads_none() {
        let sim = Arc::new(SimGpio::new());
        sim.set_mode(TRIG, PinMode::Alt(0)).unwrap();
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();
        assert_eq!(sim.watcher_count(TRIG), 1);
        assert_eq!(sim.watcher_count(ECHO), 1);

        ranger.cancel();
        assert!(!ranger.is_active());
        assert_eq!(ranger.read(), None);
        assert_eq!(ranger.last(), None);
        assert!(!ranger.pulse());
        assert_eq!(sim.watcher_count(TRIG), 0);
        assert_eq!(sim.watcher_count(ECHO), 0);
        assert_eq!(sim.mode(TRIG).unwrap(), PinMode::Alt(0));
        ranger.cancel();
    }

    #[test]
    fn test_drop_releases_callbacks() {
        let sim = Arc::new(SimGpio::new());
        {
            let _ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();
            assert_eq!(sim.watcher_count(ECHO), 1);
        }
        assert_eq!(sim.watcher_count(ECHO), 0);
    }

    #[test]
    fn test_echo_from_dispatch_thread() {
        let sim = Arc::new(SimGpio::new());
        let config = RangerConfig { timeout: Duration::from_secs(5), ..RangerConfig::default() };
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, config).unwrap();

        let remote = Arc::clone(&sim);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            remote.inject_at(ECHO, Level::High, 100_000);
            remote.inject_at(ECHO, Level::Low, 102_900);
        });
        let started = Instant::now();
        assert_eq!(ranger.read(), Some(2900));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_late_echo_not_attributed_to_next_ping() {
        let sim = Arc::new(SimGpio::new());
        sim.script_echoes(TRIG, ECHO, vec![None, Some(600)]);
        let mut ranger = Ranger::new(sim.clone(), TRIG, ECHO, quick()).unwrap();

        // First ping times out; its echo then rises late and never falls.
        assert_eq!(ranger.read(), Some(TIMEOUT_SENTINEL_US));
        sim.inject(ECHO, Level::High);

        // Second ping gets its own echo, and the first pulse's tail is dropped.
        assert_eq!(ranger.read(), Some(600));
        sim.inject(ECHO, Level::Low);
        assert_eq!(ranger.last(), Some(600));
        assert_eq!(ranger.capture().latest().unwrap().generation, 2);
    }
}
