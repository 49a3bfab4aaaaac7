//! Several ultrasonic sensors behind one 4-bit analog multiplexer.
//!
//! All sensors share a single trigger/echo circuit. Four select lines route
//! the circuit to one sensor at a time; after switching, the analog switch
//! needs a short settle time before a reading can be trusted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{RangingError, Result};
use crate::gpio::{Gpio, Level, PinClaim, PinMode};
use crate::ranger::{Ranger, RangerConfig};

/// Number of sensors the select table addresses.
pub const MUX_CHANNELS: usize = 9;

/// Delay after switching channels, and again after each read.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(10);

/// One distance in metres per channel; channels not scanned stay at 0.
pub type MuxReadings = [f64; MUX_CHANNELS];

const L: Level = Level::Low;
const H: Level = Level::High;

/// Select-line levels `(s0, s1, s2, s3)` for each channel.
///
/// Every line is driven for every channel, including s3 on channel 3.
pub const SELECT_PATTERNS: [[Level; 4]; MUX_CHANNELS] = [
    [L, L, L, L],
    [H, L, L, L],
    [L, H, L, L],
    [H, H, L, L],
    [L, L, H, L],
    [H, L, H, L],
    [L, H, H, L],
    [H, H, H, L],
    [L, L, L, H],
];

/// Tuning for a [`MuxRanger`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuxConfig {
    /// Settle time around each read.
    pub settle: Duration,
    /// Configuration of the shared ranger.
    pub ranger: RangerConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig { settle: DEFAULT_SETTLE, ranger: RangerConfig::default() }
    }
}

/// A [`Ranger`] fanned out to up to nine sensors through select lines.
pub struct MuxRanger {
    ranger: Ranger,
    select: Vec<PinClaim>,
    settle: Duration,
    channel: Option<usize>,
}

impl MuxRanger {
    /// Claim the trigger, echo and select pins `[s0, s1, s2, s3]`.
    pub fn new(
        gpio: Arc<dyn Gpio>,
        trigger_pin: u8,
        echo_pin: u8,
        select_pins: [u8; 4],
        config: MuxConfig,
    ) -> Result<Self> {
        let ranger = Ranger::new(Arc::clone(&gpio), trigger_pin, echo_pin, config.ranger)?;
        let mut select = Vec::with_capacity(select_pins.len());
        for pin in select_pins {
            let claim = PinClaim::new(Arc::clone(&gpio), pin, PinMode::Output)?;
            claim.write(Level::Low)?;
            select.push(claim);
        }
        Ok(MuxRanger { ranger, select, settle: config.settle, channel: None })
    }

    /// The shared ranger.
    pub fn ranger(&mut self) -> &mut Ranger {
        &mut self.ranger
    }

    /// Channel most recently selected.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }

    /// Route the shared circuit to `channel`. Channels at or past
    /// [`MUX_CHANNELS`] are rejected without touching the select lines.
    pub fn select(&mut self, channel: usize) -> Result<()> {
        let pattern = *SELECT_PATTERNS
            .get(channel)
            .ok_or(RangingError::InvalidConfig("mux channel out of range"))?;
        for (claim, level) in self.select.iter().zip(pattern) {
            claim.write(level)?;
        }
        self.channel = Some(channel);
        Ok(())
    }

    /// Select `channel`, let it settle, take one reading in metres and
    /// settle again. `None` once cancelled.
    ///
    /// A channel that cannot be selected, including one past
    /// [`MUX_CHANNELS`], reads as the sentinel distance without pinging.
    pub fn read_channel(&mut self, channel: usize) -> Option<f64> {
        if !self.ranger.is_active() {
            return None;
        }
        if let Err(e) = self.select(channel) {
            warn!(channel, error = %e, "Failed to drive select lines");
            return Some(self.ranger.to_meters(self.ranger.config().sentinel_us));
        }
        spin_sleep::sleep(self.settle);
        let trip = self.ranger.read()?;
        let distance = self.ranger.to_meters(trip);
        spin_sleep::sleep(self.settle);
        debug!(channel, trip_us = trip, distance_m = distance, "Channel read");
        Some(distance)
    }

    /// Read channels `0..sensors` in order.
    ///
    /// `sensors` is capped at [`MUX_CHANNELS`]. Channels past it stay at 0.
    /// Returns `None` if the ranger has been cancelled.
    pub fn scan(&mut self, sensors: usize) -> Option<MuxReadings> {
        if sensors > MUX_CHANNELS {
            warn!(sensors, max = MUX_CHANNELS, "Too many multiplexed sensors requested; capping");
        }
        let mut results = [0.0; MUX_CHANNELS];
        for (channel, slot) in results.iter_mut().enumerate().take(sensors) {
            *slot = self.read_channel(channel)?;
        }
        Some(results)
    }

    /// Cancel the ranger and restore the select pins. Further calls do
    /// nothing.
    pub fn cancel(&mut self) {
        self.ranger.cancel();
        for claim in self.select.iter_mut() {
            claim.release();
        }
    }
}

impl Drop for MuxRanger {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranger::{SPEED_OF_SOUND_CM_S, TIMEOUT_SENTINEL_US, round_trip_to_meters};
    use crate::sim::SimGpio;
    use std::collections::HashSet;

    const EPSILON: f64 = 1e-9;
    const TRIG: u8 = 18;
    const ECHO: u8 = 24;
    const SELECT: [u8; 4] = [20, 21, 19, 16];

    fn quick() -> MuxConfig {
        MuxConfig {
            settle: Duration::ZERO,
            ranger: RangerConfig { timeout: Duration::from_millis(10), ..RangerConfig::default() },
        }
    }

    /// Echo width encodes the selected channel: 1000 + 100 * channel.
    fn channel_echo(sim: &SimGpio) {
        sim.set_responder(TRIG, ECHO, 100, |levels| {
            let channel = SELECT
                .iter()
                .enumerate()
                .filter(|(_, pin)| levels.is_high(**pin))
                .map(|(bit, _)| 1u32 << bit)
                .sum::<u32>();
            Some(1000 + 100 * channel)
        });
    }

    #[test]
    fn test_patterns_are_binary_channel_codes() {
        for (channel, pattern) in SELECT_PATTERNS.iter().enumerate() {
            for (bit, level) in pattern.iter().enumerate() {
                assert_eq!(*level, Level::from((channel >> bit) & 1 == 1), "channel {channel} bit {bit}");
            }
        }
    }

    #[test]
    fn test_full_scan_visits_every_pattern() {
        let sim = Arc::new(SimGpio::new());
        channel_echo(&sim);
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();
        sim.clear_writes();

        let readings = mux.scan(MUX_CHANNELS).unwrap();
        for (channel, distance) in readings.iter().enumerate() {
            let expected = round_trip_to_meters(1000 + 100 * channel as u32, SPEED_OF_SOUND_CM_S);
            assert!((distance - expected).abs() < EPSILON, "channel {channel}");
        }

        let writes = sim.writes();
        assert_eq!(writes.len(), 4 * MUX_CHANNELS);
        let patterns: HashSet<Vec<Level>> = writes
            .chunks(4)
            .map(|chunk| chunk.iter().map(|(_, level)| *level).collect())
            .collect();
        assert_eq!(patterns.len(), MUX_CHANNELS);
        assert_eq!(sim.trigger_count(TRIG), MUX_CHANNELS);
        assert_eq!(mux.channel(), Some(MUX_CHANNELS - 1));
    }

    #[test]
    fn test_partial_scan_leaves_zeros() {
        let sim = Arc::new(SimGpio::new());
        channel_echo(&sim);
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();

        let readings = mux.scan(4).unwrap();
        assert!(readings[..4].iter().all(|d| *d > 0.0));
        assert!(readings[4..].iter().all(|d| *d == 0.0));
        assert_eq!(sim.trigger_count(TRIG), 4);
    }

    #[test]
    fn test_oversized_scan_is_capped() {
        let sim = Arc::new(SimGpio::new());
        channel_echo(&sim);
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();
        assert!(mux.scan(12).is_some());
        assert_eq!(sim.trigger_count(TRIG), MUX_CHANNELS);
    }

    #[test]
    fn test_channel_three_clears_s3() {
        let sim = Arc::new(SimGpio::new());
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();
        mux.select(8).unwrap();
        assert_eq!(sim.level(SELECT[3]), Level::High);
        mux.select(3).unwrap();
        assert_eq!(
            SELECT.map(|pin| sim.level(pin)),
            [Level::High, Level::High, Level::Low, Level::Low]
        );
    }

    #[test]
    fn test_unknown_channel_reads_sentinel() {
        let sim = Arc::new(SimGpio::new());
        channel_echo(&sim);
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();
        mux.select(2).unwrap();
        sim.clear_writes();

        assert!(matches!(mux.select(MUX_CHANNELS), Err(RangingError::InvalidConfig(_))));
        let sentinel = round_trip_to_meters(TIMEOUT_SENTINEL_US, SPEED_OF_SOUND_CM_S);
        let distance = mux.read_channel(12).unwrap();
        assert!((distance - sentinel).abs() < EPSILON);
        assert!(sim.writes().is_empty());
        assert_eq!(sim.trigger_count(TRIG), 0);
        assert_eq!(mux.channel(), Some(2));
    }

    #[test]
    fn test_timeout_propagates_as_sentinel_distance() {
        let sim = Arc::new(SimGpio::new());
        sim.script_echoes(TRIG, ECHO, vec![Some(5800), None]);
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();

        let readings = mux.scan(2).unwrap();
        assert!((readings[0] - 0.99557).abs() < 1e-6);
        let sentinel = round_trip_to_meters(TIMEOUT_SENTINEL_US, SPEED_OF_SOUND_CM_S);
        assert!((readings[1] - sentinel).abs() < EPSILON);
    }

    #[test]
    fn test_cancelled_scan_returns_none_and_restores() {
        let sim = Arc::new(SimGpio::new());
        let mut mux = MuxRanger::new(sim.clone(), TRIG, ECHO, SELECT, quick()).unwrap();
        assert_eq!(sim.mode(SELECT[0]).unwrap(), PinMode::Output);

        mux.cancel();
        assert!(mux.scan(9).is_none());
        assert!(mux.read_channel(0).is_none());
        for pin in SELECT {
            assert_eq!(sim.mode(pin).unwrap(), PinMode::Input);
        }
        assert_eq!(sim.watcher_count(ECHO), 0);
    }
}
