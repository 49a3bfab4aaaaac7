//! Raspberry Pi backend over `rppal`.
//!
//! Edges on input pins come from the kernel's GPIO character device through
//! `rppal` async interrupts and carry the kernel event timestamp. Output pins
//! cannot be watched that way, so edges caused by [`Gpio::write`] and
//! [`Gpio::trigger`] are delivered to watchers directly, stamped from the
//! same clock as [`Gpio::tick`]. Echo widths are always the difference of two
//! interrupt timestamps.
//!
//! PWM is rppal's software PWM on any pin, which is good enough for hobby
//! servos at 50 Hz.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rppal::gpio::{self as hw, Event, InputPin, IoPin, Mode, Trigger};
use tracing::{debug, info, warn};

use crate::error::{RangingError, Result};
use crate::gpio::{EdgeCallback, EdgeEvent, Gpio, Level, PinMode, Pwm, WatchId};

fn gpio_err(e: hw::Error) -> RangingError {
    RangingError::Gpio(e.to_string())
}

fn to_hw_level(level: Level) -> hw::Level {
    match level {
        Level::Low => hw::Level::Low,
        Level::High => hw::Level::High,
    }
}

fn from_hw_level(level: hw::Level) -> Level {
    Level::from(level == hw::Level::High)
}

fn to_hw_mode(mode: PinMode) -> Result<Mode> {
    Ok(match mode {
        PinMode::Input => Mode::Input,
        PinMode::Output => Mode::Output,
        PinMode::Alt(0) => Mode::Alt0,
        PinMode::Alt(1) => Mode::Alt1,
        PinMode::Alt(2) => Mode::Alt2,
        PinMode::Alt(3) => Mode::Alt3,
        PinMode::Alt(4) => Mode::Alt4,
        PinMode::Alt(5) => Mode::Alt5,
        PinMode::Alt(_) => return Err(RangingError::InvalidConfig("alternate function out of range")),
    })
}

#[allow(unreachable_patterns)]
fn from_hw_mode(mode: Mode) -> PinMode {
    match mode {
        Mode::Input => PinMode::Input,
        Mode::Output => PinMode::Output,
        Mode::Alt0 => PinMode::Alt(0),
        Mode::Alt1 => PinMode::Alt(1),
        Mode::Alt2 => PinMode::Alt(2),
        Mode::Alt3 => PinMode::Alt(3),
        Mode::Alt4 => PinMode::Alt(4),
        Mode::Alt5 => PinMode::Alt(5),
        // Pi 5 "no function" and anything newer.
        _ => PinMode::Input,
    }
}

type Watchers = Arc<Mutex<Vec<(WatchId, u8, EdgeCallback)>>>;

fn dispatch(watchers: &Watchers, event: EdgeEvent) {
    for (_, pin, callback) in watchers.lock().iter_mut() {
        if *pin == event.pin {
            callback(event);
        }
    }
}

/// A line owned by the backend. Watched inputs are held as `InputPin`, the
/// only handle `rppal` delivers interrupts on.
enum Line {
    Io(IoPin),
    Watched(InputPin),
}

impl Line {
    fn mode(&self) -> Mode {
        match self {
            Line::Io(io) => io.mode(),
            Line::Watched(_) => Mode::Input,
        }
    }

    fn read(&self) -> hw::Level {
        match self {
            Line::Io(io) => io.read(),
            Line::Watched(input) => input.read(),
        }
    }

    fn io(&mut self, pin: u8) -> Result<&mut IoPin> {
        match self {
            Line::Io(io) => Ok(io),
            Line::Watched(_) => Err(RangingError::WrongMode(pin, "pin is watched as an input")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PwmSetting {
    frequency: u32,
    range: u32,
}

/// GPIO and software PWM on a Raspberry Pi.
pub struct RpiGpio {
    gpio: hw::Gpio,
    lines: Mutex<HashMap<u8, Line>>,
    watchers: Watchers,
    pwm: Mutex<HashMap<u8, PwmSetting>>,
    epoch: Instant,
    next_id: AtomicU64,
}

impl RpiGpio {
    /// Open the GPIO peripheral.
    pub fn new() -> Result<Self> {
        let gpio = hw::Gpio::new().map_err(gpio_err)?;
        info!("Raspberry Pi GPIO opened");
        Ok(RpiGpio {
            gpio,
            lines: Mutex::new(HashMap::new()),
            watchers: Arc::default(),
            pwm: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Run `f` on the line for `pin`, acquiring it on first use.
    fn with_line<T>(&self, pin: u8, f: impl FnOnce(&mut Line) -> Result<T>) -> Result<T> {
        let mut lines = self.lines.lock();
        if !lines.contains_key(&pin) {
            let raw = self.gpio.get(pin).map_err(|_| RangingError::InvalidPin(pin))?;
            let current = raw.mode();
            let mut io = raw.into_io(current);
            // Claims restore modes explicitly.
            io.set_reset_on_drop(false);
            lines.insert(pin, Line::Io(io));
        }
        match lines.get_mut(&pin) {
            Some(line) => f(line),
            None => Err(RangingError::InvalidPin(pin)),
        }
    }

    fn emit_local(&self, pin: u8, level: Level) {
        dispatch(&self.watchers, EdgeEvent::new(pin, level, self.tick()));
    }

    fn arm_interrupt(&self, pin: u8) -> Result<()> {
        let mut lines = self.lines.lock();
        if matches!(lines.get(&pin), Some(Line::Watched(_))) {
            return Ok(());
        }
        // The pin can only be held once; give up the I/O handle first.
        lines.remove(&pin);
        let mut input = self.gpio.get(pin).map_err(|_| RangingError::InvalidPin(pin))?.into_input();
        input.set_reset_on_drop(false);
        let watchers = Arc::clone(&self.watchers);
        input
            .set_async_interrupt(Trigger::Both, None, move |event: Event| {
                let level = Level::from(event.trigger == Trigger::RisingEdge);
                let tick = event.timestamp.as_micros() as u32;
                dispatch(&watchers, EdgeEvent::new(pin, level, tick));
            })
            .map_err(gpio_err)?;
        lines.insert(pin, Line::Watched(input));
        debug!(pin, "Edge interrupt armed");
        Ok(())
    }

    fn disarm_interrupt(&self, pin: u8) {
        let mut lines = self.lines.lock();
        if let Some(Line::Watched(mut input)) = lines.remove(&pin) {
            if let Err(e) = input.clear_async_interrupt() {
                warn!(pin, error = %e, "Failed to clear edge interrupt");
            }
            debug!(pin, "Edge interrupt cleared");
        }
    }
}

impl Gpio for RpiGpio {
    fn mode(&self, pin: u8) -> Result<PinMode> {
        self.with_line(pin, |line| Ok(from_hw_mode(line.mode())))
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let hw_mode = to_hw_mode(mode)?;
        self.with_line(pin, |line| {
            if line.mode() == hw_mode {
                return Ok(());
            }
            line.io(pin)?.set_mode(hw_mode);
            Ok(())
        })
    }

    fn write(&self, pin: u8, level: Level) -> Result<()> {
        let changed = self.with_line(pin, |line| {
            let io = line.io(pin)?;
            if io.mode() != Mode::Output {
                return Err(RangingError::WrongMode(pin, "write needs an output"));
            }
            let changed = from_hw_level(io.read()) != level;
            io.write(to_hw_level(level));
            Ok(changed)
        })?;
        if changed {
            self.emit_local(pin, level);
        }
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level> {
        self.with_line(pin, |line| Ok(from_hw_level(line.read())))
    }

    fn trigger(&self, pin: u8, width: Duration, level: Level) -> Result<()> {
        self.with_line(pin, |line| {
            let io = line.io(pin)?;
            if io.mode() != Mode::Output {
                return Err(RangingError::WrongMode(pin, "trigger needs an output"));
            }
            io.write(to_hw_level(level));
            spin_sleep::sleep(width);
            io.write(to_hw_level(!level));
            Ok(())
        })?;
        // The echo cannot rise before the trigger has fallen, so late
        // delivery of these edges is harmless.
        self.emit_local(pin, level);
        self.emit_local(pin, !level);
        Ok(())
    }

    fn watch(&self, pin: u8, callback: EdgeCallback) -> Result<WatchId> {
        let mode = self.mode(pin)?;
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.watchers.lock().push((id, pin, callback));
        if mode != PinMode::Output {
            if let Err(e) = self.arm_interrupt(pin) {
                self.watchers.lock().retain(|(w, _, _)| *w != id);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) {
        let pin = {
            let mut watchers = self.watchers.lock();
            let Some(pos) = watchers.iter().position(|(w, _, _)| *w == id) else {
                return;
            };
            let (_, pin, _) = watchers.remove(pos);
            if watchers.iter().any(|(_, p, _)| *p == pin) {
                return;
            }
            pin
        };
        // Clearing joins the interrupt thread, which takes the watcher lock.
        self.disarm_interrupt(pin);
    }

    fn tick(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

impl Pwm for RpiGpio {
    fn set_frequency(&self, pin: u8, hz: u32) -> Result<()> {
        if hz == 0 {
            return Err(RangingError::Pwm(format!("zero frequency on GPIO {}", pin)));
        }
        self.pwm.lock().entry(pin).or_default().frequency = hz;
        Ok(())
    }

    fn set_range(&self, pin: u8, range: u32) -> Result<()> {
        if range == 0 {
            return Err(RangingError::Pwm(format!("zero range on GPIO {}", pin)));
        }
        self.pwm.lock().entry(pin).or_default().range = range;
        Ok(())
    }

    fn set_duty_cycle(&self, pin: u8, duty: u32) -> Result<()> {
        let setting = self.pwm.lock().get(&pin).copied().unwrap_or_default();
        if setting.frequency == 0 || setting.range == 0 {
            return Err(RangingError::Pwm(format!("GPIO {} needs a frequency and range first", pin)));
        }
        if duty > setting.range {
            return Err(RangingError::Pwm(format!(
                "duty {} exceeds range {} on GPIO {}",
                duty, setting.range, pin
            )));
        }
        let period = Duration::from_secs(1) / setting.frequency;
        let pulse_width = period.mul_f64(duty as f64 / setting.range as f64);
        self.with_line(pin, |line| {
            let io = line.io(pin)?;
            if io.mode() != Mode::Output {
                io.set_mode(Mode::Output);
            }
            io.set_pwm(period, pulse_width).map_err(|e| RangingError::Pwm(e.to_string()))
        })?;
        debug!(pin, duty, ?pulse_width, "PWM updated");
        Ok(())
    }
}
