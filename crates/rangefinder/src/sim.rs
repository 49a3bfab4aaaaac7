//! In-process simulated hardware.
//!
//! `SimGpio` keeps pin modes and levels in memory, records recent writes, and
//! answers trigger pulses through per-trigger-pin responders. Edge callbacks
//! run synchronously on the thread that caused the edge, while the backend
//! lock is held, so callbacks must not call back into the backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RangingError, Result};
use crate::gpio::{EdgeCallback, EdgeEvent, Gpio, Level, PinMode, Pwm, WatchId};
use crate::tof::{AccuracyMode, TofSensor};

/// Highest BCM pin number the simulator accepts.
pub const MAX_PIN: u8 = 53;

/// Gap the simulated clock advances after each trigger cycle.
const CYCLE_GAP_US: u32 = 1_000;

/// Writes and duty values kept per recorder; older entries are dropped.
pub const HISTORY_LIMIT: usize = 4_096;

fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == HISTORY_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

/// Read-only view of the simulated line levels handed to responders.
pub struct PinLevels<'a>(&'a HashMap<u8, Level>);

impl PinLevels<'_> {
    /// Level of `pin` (lines never driven read low).
    pub fn level(&self, pin: u8) -> Level {
        self.0.get(&pin).copied().unwrap_or(Level::Low)
    }

    /// `true` if `pin` is high.
    pub fn is_high(&self, pin: u8) -> bool {
        self.level(pin) == Level::High
    }
}

type RespondFn = Box<dyn FnMut(&PinLevels<'_>) -> Option<u32> + Send + 'static>;

struct Responder {
    echo_pin: u8,
    latency_us: u32,
    respond: RespondFn,
}

#[derive(Default)]
struct SimState {
    modes: HashMap<u8, PinMode>,
    levels: HashMap<u8, Level>,
    writes: VecDeque<(u8, Level)>,
    watchers: Vec<(WatchId, u8, EdgeCallback)>,
    responders: HashMap<u8, Responder>,
    faulty: HashSet<u8>,
    tick: u32,
    triggers: HashMap<u8, usize>,
}

impl SimState {
    fn check(&self, pin: u8) -> Result<()> {
        if pin > MAX_PIN {
            return Err(RangingError::InvalidPin(pin));
        }
        if self.faulty.contains(&pin) {
            return Err(RangingError::Gpio(format!("simulated fault on GPIO {}", pin)));
        }
        Ok(())
    }

    fn emit(&mut self, pin: u8, level: Level) {
        self.levels.insert(pin, level);
        let event = EdgeEvent::new(pin, level, self.tick);
        for (_, watched, callback) in self.watchers.iter_mut() {
            if *watched == pin {
                callback(event);
            }
        }
    }
}

/// Simulated GPIO backend.
#[derive(Default)]
pub struct SimGpio {
    state: Mutex<SimState>,
    next_id: AtomicU64,
}

impl SimGpio {
    /// Empty simulator: every pin is an input reading low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer pulses on `trigger_pin` with an echo pulse on `echo_pin`.
    ///
    /// `respond` returns the echo width in microseconds, or `None` for
    /// silence. The echo rises `latency_us` after the trigger pulse ends.
    pub fn set_responder<F>(&self, trigger_pin: u8, echo_pin: u8, latency_us: u32, respond: F)
    where
        F: FnMut(&PinLevels<'_>) -> Option<u32> + Send + 'static,
    {
        self.state.lock().responders.insert(
            trigger_pin,
            Responder { echo_pin, latency_us, respond: Box::new(respond) },
        );
    }

    /// Answer pulses on `trigger_pin` with the given widths in order, then
    /// silence.
    pub fn script_echoes(&self, trigger_pin: u8, echo_pin: u8, widths: Vec<Option<u32>>) {
        let mut widths = widths.into_iter();
        self.set_responder(trigger_pin, echo_pin, 200, move |_| widths.next().flatten());
    }

    /// Make every operation on `pin` fail.
    pub fn set_faulty(&self, pin: u8, faulty: bool) {
        let mut state = self.state.lock();
        if faulty {
            state.faulty.insert(pin);
        } else {
            state.faulty.remove(&pin);
        }
    }

    /// Deliver an edge on `pin` at the current tick, as if driven externally.
    pub fn inject(&self, pin: u8, level: Level) {
        self.state.lock().emit(pin, level);
    }

    /// Deliver an edge on `pin` at `tick`.
    pub fn inject_at(&self, pin: u8, level: Level, tick: u32) {
        let mut state = self.state.lock();
        state.tick = tick;
        state.emit(pin, level);
    }

    /// Move the simulated clock.
    pub fn set_tick(&self, tick: u32) {
        self.state.lock().tick = tick;
    }

    /// The last [`HISTORY_LIMIT`] writes, oldest first.
    pub fn writes(&self) -> Vec<(u8, Level)> {
        self.state.lock().writes.iter().copied().collect()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Current level of `pin`.
    pub fn level(&self, pin: u8) -> Level {
        PinLevels(&self.state.lock().levels).level(pin)
    }

    /// Number of pulses emitted on `pin`.
    pub fn trigger_count(&self, pin: u8) -> usize {
        self.state.lock().triggers.get(&pin).copied().unwrap_or(0)
    }

    /// Number of callbacks registered on `pin`.
    pub fn watcher_count(&self, pin: u8) -> usize {
        self.state.lock().watchers.iter().filter(|(_, p, _)| *p == pin).count()
    }
}

impl Gpio for SimGpio {
    fn mode(&self, pin: u8) -> Result<PinMode> {
        let state = self.state.lock();
        state.check(pin)?;
        Ok(state.modes.get(&pin).copied().unwrap_or(PinMode::Input))
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let mut state = self.state.lock();
        state.check(pin)?;
        state.modes.insert(pin, mode);
        Ok(())
    }

    fn write(&self, pin: u8, level: Level) -> Result<()> {
        let mut state = self.state.lock();
        state.check(pin)?;
        if state.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(RangingError::WrongMode(pin, "write needs an output"));
        }
        record(&mut state.writes, (pin, level));
        if state.levels.get(&pin).copied().unwrap_or(Level::Low) != level {
            state.emit(pin, level);
        }
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level> {
        let state = self.state.lock();
        state.check(pin)?;
        Ok(PinLevels(&state.levels).level(pin))
    }

    fn trigger(&self, pin: u8, width: Duration, level: Level) -> Result<()> {
        let mut guard = self.state.lock();
        guard.check(pin)?;
        if guard.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(RangingError::WrongMode(pin, "trigger needs an output"));
        }
        *guard.triggers.entry(pin).or_default() += 1;

        let state = &mut *guard;
        state.emit(pin, level);
        state.tick = state.tick.wrapping_add(width.as_micros() as u32);
        state.emit(pin, !level);

        let SimState { levels, responders, .. } = &mut *state;
        let echo = responders
            .get_mut(&pin)
            .map(|r| (r.echo_pin, r.latency_us, (r.respond)(&PinLevels(&*levels))));
        if let Some((echo_pin, latency_us, Some(width_us))) = echo {
            state.tick = state.tick.wrapping_add(latency_us);
            state.emit(echo_pin, Level::High);
            state.tick = state.tick.wrapping_add(width_us);
            state.emit(echo_pin, Level::Low);
        }
        state.tick = state.tick.wrapping_add(CYCLE_GAP_US);
        Ok(())
    }

    fn watch(&self, pin: u8, callback: EdgeCallback) -> Result<WatchId> {
        let mut state = self.state.lock();
        state.check(pin)?;
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.watchers.push((id, pin, callback));
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) {
        self.state.lock().watchers.retain(|(w, _, _)| *w != id);
    }

    fn tick(&self) -> u32 {
        self.state.lock().tick
    }
}

#[derive(Debug, Default, Clone)]
struct PwmChannel {
    frequency: Option<u32>,
    range: Option<u32>,
    duties: VecDeque<u32>,
}

/// Simulated PWM backend recording the settings of each pin.
#[derive(Default)]
pub struct SimPwm {
    channels: Mutex<HashMap<u8, PwmChannel>>,
}

impl SimPwm {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last frequency set on `pin`.
    pub fn frequency(&self, pin: u8) -> Option<u32> {
        self.channels.lock().get(&pin).and_then(|c| c.frequency)
    }

    /// Last range set on `pin`.
    pub fn range(&self, pin: u8) -> Option<u32> {
        self.channels.lock().get(&pin).and_then(|c| c.range)
    }

    /// Last duty value set on `pin`.
    pub fn duty(&self, pin: u8) -> Option<u32> {
        self.channels.lock().get(&pin).and_then(|c| c.duties.back().copied())
    }

    /// The last [`HISTORY_LIMIT`] duty values set on `pin`, oldest first.
    pub fn duty_history(&self, pin: u8) -> Vec<u32> {
        self.channels
            .lock()
            .get(&pin)
            .map(|c| c.duties.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Pwm for SimPwm {
    fn set_frequency(&self, pin: u8, hz: u32) -> Result<()> {
        if pin > MAX_PIN {
            return Err(RangingError::InvalidPin(pin));
        }
        self.channels.lock().entry(pin).or_default().frequency = Some(hz);
        Ok(())
    }

    fn set_range(&self, pin: u8, range: u32) -> Result<()> {
        if pin > MAX_PIN {
            return Err(RangingError::InvalidPin(pin));
        }
        self.channels.lock().entry(pin).or_default().range = Some(range);
        Ok(())
    }

    fn set_duty_cycle(&self, pin: u8, duty: u32) -> Result<()> {
        let mut channels = self.channels.lock();
        let channel = channels.entry(pin).or_default();
        if let Some(range) = channel.range {
            if duty > range {
                return Err(RangingError::Pwm(format!(
                    "duty {} exceeds range {} on GPIO {}",
                    duty, range, pin
                )));
            }
        }
        record(&mut channel.duties, duty);
        Ok(())
    }
}

/// Simulated time-of-flight sensor.
///
/// The device only answers while its shutdown line is high, like a real
/// part held in reset.
pub struct SimTof {
    gpio: Arc<SimGpio>,
    shutdown_pin: u8,
    address: u8,
    mode: Option<AccuracyMode>,
    distance_mm: u16,
    timing_budget_us: u32,
}

impl SimTof {
    /// New device answering at its power-on default address.
    pub fn new(gpio: Arc<SimGpio>, shutdown_pin: u8, distance_mm: u16) -> Self {
        SimTof {
            gpio,
            shutdown_pin,
            address: crate::tof::DEFAULT_ADDRESS,
            mode: None,
            distance_mm,
            timing_budget_us: 33_000,
        }
    }

    /// Override the reported timing budget.
    pub fn with_timing_budget(mut self, timing_budget_us: u32) -> Self {
        self.timing_budget_us = timing_budget_us;
        self
    }

    /// Currently assigned I2C address.
    pub fn address(&self) -> u8 {
        self.address
    }

    fn powered(&self) -> Result<()> {
        match self.gpio.level(self.shutdown_pin) {
            Level::High => Ok(()),
            Level::Low => Err(RangingError::Device(format!(
                "device behind GPIO {} is held in reset",
                self.shutdown_pin
            ))),
        }
    }
}

impl TofSensor for SimTof {
    fn set_address(&mut self, address: u8) -> Result<()> {
        self.powered()?;
        self.address = address;
        Ok(())
    }

    fn start_ranging(&mut self, mode: AccuracyMode) -> Result<()> {
        self.powered()?;
        self.mode = Some(mode);
        Ok(())
    }

    fn stop_ranging(&mut self) -> Result<()> {
        self.mode = None;
        Ok(())
    }

    fn distance_mm(&mut self) -> Result<u16> {
        self.powered()?;
        match self.mode {
            Some(_) => Ok(self.distance_mm),
            None => Err(RangingError::Device("ranging not started".into())),
        }
    }

    fn timing_budget_us(&self) -> u32 {
        self.timing_budget_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_and_level() {
        let sim = SimGpio::new();
        assert_eq!(sim.mode(4).unwrap(), PinMode::Input);
        assert_eq!(sim.read(4).unwrap(), Level::Low);
        assert_eq!(sim.mode(60), Err(RangingError::InvalidPin(60)));
    }

    #[test]
    fn test_write_requires_output() {
        let sim = SimGpio::new();
        assert!(matches!(sim.write(5, Level::High), Err(RangingError::WrongMode(5, _))));
        sim.set_mode(5, PinMode::Output).unwrap();
        sim.write(5, Level::High).unwrap();
        assert_eq!(sim.read(5).unwrap(), Level::High);
        assert_eq!(sim.writes(), vec![(5, Level::High)]);
    }

    #[test]
    fn test_trigger_runs_responder() {
        let sim = SimGpio::new();
        sim.set_mode(18, PinMode::Output).unwrap();
        sim.script_echoes(18, 24, vec![Some(700)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for pin in [18, 24] {
            let seen = Arc::clone(&seen);
            sim.watch(pin, Box::new(move |ev: EdgeEvent| seen.lock().push(ev))).unwrap();
        }

        sim.trigger(18, Duration::from_micros(10), Level::High).unwrap();
        let seen = seen.lock();
        let levels: Vec<_> = seen.iter().map(|e| (e.pin, e.level)).collect();
        assert_eq!(
            levels,
            vec![(18, Level::High), (18, Level::Low), (24, Level::High), (24, Level::Low)]
        );
        assert_eq!(seen[3].tick.wrapping_sub(seen[2].tick), 700);
        assert_eq!(sim.trigger_count(18), 1);
    }

    #[test]
    fn test_faulty_pin() {
        let sim = SimGpio::new();
        sim.set_faulty(9, true);
        assert!(matches!(sim.read(9), Err(RangingError::Gpio(_))));
        sim.set_faulty(9, false);
        assert!(sim.read(9).is_ok());
    }

    #[test]
    fn test_pwm_rejects_duty_above_range() {
        let pwm = SimPwm::new();
        pwm.set_range(12, 40000).unwrap();
        pwm.set_frequency(12, 50).unwrap();
        assert!(pwm.set_duty_cycle(12, 40001).is_err());
        pwm.set_duty_cycle(12, 1500).unwrap();
        assert_eq!(pwm.duty(12), Some(1500));
        assert_eq!(pwm.frequency(12), Some(50));
        assert_eq!(pwm.range(12), Some(40000));
    }

    #[test]
    fn test_histories_stay_bounded() {
        let sim = SimGpio::new();
        sim.set_mode(5, PinMode::Output).unwrap();
        for i in 0..HISTORY_LIMIT + 10 {
            sim.write(5, Level::from(i % 2 == 1)).unwrap();
        }
        let writes = sim.writes();
        assert_eq!(writes.len(), HISTORY_LIMIT);
        assert_eq!(writes[0], (5, Level::Low));
        assert_eq!(writes.last(), Some(&(5, Level::High)));

        let pwm = SimPwm::new();
        for duty in 0..(HISTORY_LIMIT + 10) as u32 {
            pwm.set_duty_cycle(12, duty).unwrap();
        }
        let history = pwm.duty_history(12);
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0], 10);
        assert_eq!(pwm.duty(12), Some(HISTORY_LIMIT as u32 + 9));
    }

    #[test]
    fn test_tof_answers_only_out_of_reset() {
        let sim = Arc::new(SimGpio::new());
        let mut tof = SimTof::new(sim.clone(), 6, 420);
        assert!(tof.set_address(0x2B).is_err());

        sim.set_mode(6, PinMode::Output).unwrap();
        sim.write(6, Level::High).unwrap();
        tof.set_address(0x2B).unwrap();
        tof.start_ranging(AccuracyMode::Better).unwrap();
        assert_eq!(tof.address(), 0x2B);
        assert_eq!(tof.distance_mm().unwrap(), 420);
    }
}
