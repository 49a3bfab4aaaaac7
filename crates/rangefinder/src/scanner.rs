//! Servo-mounted scanning ultrasonic ranger.
//!
//! A hobby servo points the sensor; readings are reported as a compass
//! bearing (the mount's `offset` minus the servo angle) and a distance.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{RangingError, Result};
use crate::gpio::{Gpio, Pwm};
use crate::ranger::{Ranger, RangerConfig, SPEED_OF_SOUND_CM_S, TRIGGER_PULSE};

/// Servo PWM frequency.
pub const SERVO_FREQUENCY_HZ: u32 = 50;

/// Duty steps per 20 ms servo period.
pub const SERVO_RANGE: u32 = 40_000;

/// Duty value the servo is parked at on start-up, and the zero-angle duty.
pub const SERVO_BASE_DUTY: u32 = 1_500;

/// Duty steps per degree of servo travel.
pub const DUTY_PER_DEGREE: f64 = 22.2;

/// Echoes at least this long are treated as "nothing in range".
pub const DEFAULT_TOO_LONG_US: u32 = 23_509;

/// Time allowed per sample; long enough for sound to cover about 5 m.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(30);

/// Smallest sweep increment `read_angle_range` accepts, in degrees.
pub const MIN_SWEEP_STEP: f64 = 0.1;

fn raw_duty(angle: f64) -> f64 {
    (SERVO_BASE_DUTY as f64 + angle * DUTY_PER_DEGREE).round()
}

/// Duty value for `angle`, after clamping it to `[min_angle, max_angle]`.
///
/// The result is kept within `1..=SERVO_RANGE`; [`ScannerConfig::validate`]
/// rejects angle limits that would need anything outside it.
pub fn duty_for_angle(angle: f64, min_angle: f64, max_angle: f64) -> u32 {
    raw_duty(angle.clamp(min_angle, max_angle)).clamp(1.0, SERVO_RANGE as f64) as u32
}

/// Compass bearing `offset - angle`, normalized to `(0, 360]`.
pub fn bearing(offset: f64, angle: f64) -> f64 {
    let b = (offset - angle).rem_euclid(360.0);
    if b <= 0.0 { b + 360.0 } else { b }
}

/// Mount geometry and timing of a [`ScanningRanger`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScannerConfig {
    /// Bearing the servo's zero angle points to, in degrees.
    pub offset: f64,
    /// Lowest servo angle, in degrees.
    pub min_angle: f64,
    /// Highest servo angle, in degrees.
    pub max_angle: f64,
    /// Default sweep increment, in degrees.
    pub step: f64,
    /// Echo ceiling and no-echo value, in microseconds.
    pub too_long_us: u32,
    /// Time budget of one sample.
    pub sample_interval: Duration,
    /// Speed of sound in cm/s.
    pub speed_of_sound_cm_s: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            offset: 0.0,
            min_angle: 10.0,
            max_angle: 160.0,
            step: 10.0,
            too_long_us: DEFAULT_TOO_LONG_US,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            speed_of_sound_cm_s: SPEED_OF_SOUND_CM_S,
        }
    }
}

impl ScannerConfig {
    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.min_angle > self.max_angle {
            return Err(RangingError::InvalidConfig("min_angle must not exceed max_angle"));
        }
        if !(self.step >= MIN_SWEEP_STEP) {
            return Err(RangingError::InvalidConfig("sweep step must be at least 0.1 degrees"));
        }
        if raw_duty(self.min_angle) < 1.0 {
            return Err(RangingError::InvalidConfig("min_angle maps below the servo PWM range"));
        }
        if raw_duty(self.max_angle) > SERVO_RANGE as f64 {
            return Err(RangingError::InvalidConfig("max_angle maps above the servo PWM range"));
        }
        Ok(())
    }

    fn ranger_config(&self) -> RangerConfig {
        RangerConfig {
            timeout: self.sample_interval,
            sentinel_us: self.too_long_us,
            ceiling_us: Some(self.too_long_us),
            pulse_width: TRIGGER_PULSE,
            speed_of_sound_cm_s: self.speed_of_sound_cm_s,
        }
    }
}

/// One reading of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanReading {
    /// Servo angle the reading was taken at, after clamping.
    pub angle: f64,
    /// Compass bearing in `(0, 360]`.
    pub bearing: f64,
    /// Distance in metres.
    pub distance_m: f64,
}

impl fmt::Display for ScanReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}°: {:.3} m)", self.bearing, self.distance_m)
    }
}

/// An ultrasonic ranger on a servo.
pub struct ScanningRanger {
    ranger: Ranger,
    pwm: Arc<dyn Pwm>,
    servo_pin: u8,
    config: ScannerConfig,
    angle: Option<f64>,
}

impl ScanningRanger {
    /// Configure the servo PWM, park the servo and claim the sensor pins.
    pub fn new(
        gpio: Arc<dyn Gpio>,
        pwm: Arc<dyn Pwm>,
        servo_pin: u8,
        trigger_pin: u8,
        echo_pin: u8,
        config: ScannerConfig,
    ) -> Result<Self> {
        config.validate()?;
        pwm.set_frequency(servo_pin, SERVO_FREQUENCY_HZ)?;
        pwm.set_range(servo_pin, SERVO_RANGE)?;
        pwm.set_duty_cycle(servo_pin, SERVO_BASE_DUTY)?;
        let ranger = Ranger::new(gpio, trigger_pin, echo_pin, config.ranger_config())?;
        info!(servo_pin, trigger_pin, echo_pin, offset = config.offset, "Scanning ranger ready");
        Ok(ScanningRanger { ranger, pwm, servo_pin, config, angle: None })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Last angle commanded, after clamping.
    pub fn angle(&self) -> Option<f64> {
        self.angle
    }

    /// Send a raw duty value to the servo.
    pub fn init_position(&mut self, duty: u32) -> Result<()> {
        self.pwm.set_duty_cycle(self.servo_pin, duty.min(SERVO_RANGE))
    }

    /// Point the servo at `angle`, clamped into the configured range.
    /// Returns the duty value sent.
    pub fn move_servo(&mut self, angle: f64) -> Result<u32> {
        let clamped = angle.clamp(self.config.min_angle, self.config.max_angle);
        let duty = duty_for_angle(clamped, self.config.min_angle, self.config.max_angle);
        self.pwm.set_duty_cycle(self.servo_pin, duty)?;
        self.angle = Some(clamped);
        debug!(servo_pin = self.servo_pin, angle = clamped, duty, "Servo moved");
        Ok(duty)
    }

    /// Most recent round trip in microseconds: the ceiling until the first
    /// echo, `None` after cancel.
    pub fn read(&self) -> Option<u32> {
        self.ranger.last()
    }

    /// Emit one trigger pulse without waiting.
    pub fn trig(&mut self) -> bool {
        self.ranger.pulse()
    }

    /// One sample: ping, wait up to the sample interval, then pad out the
    /// rest of the interval so consecutive pings do not overlap.
    fn sample(&mut self) -> Option<u32> {
        let started = Instant::now();
        let trip = self.ranger.read_within(self.config.sample_interval)?;
        if let Some(rest) = self.config.sample_interval.checked_sub(started.elapsed()) {
            spin_sleep::sleep(rest);
        }
        Some(trip)
    }

    /// Move to `angle`, average `samples` pings (at least one) and report
    /// the bearing and distance.
    ///
    /// `angle` is clamped into `[min_angle, max_angle]` first, and both the
    /// reported angle and the bearing are those of the clamped position, i.e.
    /// where the sensor actually pointed.
    ///
    /// Returns `None` after cancel or if the servo could not be moved.
    pub fn read_angle(&mut self, angle: f64, samples: usize) -> Option<ScanReading> {
        if !self.ranger.is_active() {
            return None;
        }
        if let Err(e) = self.move_servo(angle) {
            warn!(servo_pin = self.servo_pin, angle, error = %e, "Servo move failed");
            return None;
        }
        let angle = self.angle?;

        let samples = samples.max(1);
        let mut total: u64 = 0;
        for _ in 0..samples {
            total += self.sample()? as u64;
        }
        let mean_us = total as f64 / samples as f64;
        let distance_m = mean_us / 1_000_000.0 * self.config.speed_of_sound_cm_s / 2.0 / 100.0;

        let reading = ScanReading { angle, bearing: bearing(self.config.offset, angle), distance_m };
        debug!(servo_pin = self.servo_pin, %reading, mean_us, "Scan reading");
        Some(reading)
    }

    /// Sweep from `start` to `end` inclusive, one reading per position.
    ///
    /// A `step` of 0, or one finer than [`MIN_SWEEP_STEP`], uses the
    /// configured step; its sign is ignored and the sweep direction follows
    /// `start` and `end`. Both ends are clamped into the servo range.
    pub fn read_angle_range(&mut self, start: f64, end: f64, step: f64) -> Vec<ScanReading> {
        let step = if step.abs() >= MIN_SWEEP_STEP { step.abs() } else { self.config.step };
        let start = start.clamp(self.config.min_angle, self.config.max_angle);
        let end = end.clamp(self.config.min_angle, self.config.max_angle);
        let direction = if end < start { -1.0 } else { 1.0 };
        let positions = ((end - start).abs() / step + 1e-9).floor() as usize;

        let mut readings = Vec::new();
        for i in 0..=positions {
            match self.read_angle(start + direction * step * i as f64, 1) {
                Some(reading) => readings.push(reading),
                None => break,
            }
        }
        readings
    }

    /// Release the sensor pins. The servo keeps its last position.
    pub fn cancel(&mut self) {
        self.ranger.cancel();
    }
}
