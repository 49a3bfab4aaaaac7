//! Echo pulse-width capture.
//!
//! [`EdgeCapture`] is a small state machine fed with level changes of one
//! trigger pin and one echo pin. It yields one round-trip duration per
//! trigger pulse:
//!
//! ```text
//! Idle --trigger falls--> Armed --echo rises--> EchoHigh --echo falls--> Ready
//!   ^                       ^                                              |
//!   |                       +---------------- trigger falls ---------------+
//! ```
//!
//! [`SharedCapture`] wraps the state machine for use from a backend dispatch
//! thread (writer) and a blocking reader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::gpio::{EdgeEvent, Level};

/// Where the capture is in its measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No trigger seen yet.
    Idle,
    /// Trigger pulse finished, waiting for the echo line to rise.
    Armed,
    /// Echo line high, pulse start recorded.
    EchoHigh,
    /// A measurement was published for the current trigger.
    Ready,
}

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Round-trip time in microseconds, saturated at the ceiling if one is set.
    pub duration_us: u32,
    /// Trigger generation the pulse belongs to.
    pub generation: u64,
    /// Backend tick of the echo falling edge.
    pub tick: u32,
    /// The raw pulse reached the ceiling and was saturated.
    pub out_of_range: bool,
}

/// Edge-timestamp state machine for one trigger/echo pair.
#[derive(Debug, Clone)]
pub struct EdgeCapture {
    trigger_pin: u8,
    echo_pin: u8,
    ceiling_us: Option<u32>,
    phase: Phase,
    pulse_start: Option<u32>,
    generation: u64,
    latest: Option<Measurement>,
}

impl EdgeCapture {
    /// New capture for the given pins, with no ceiling.
    pub fn new(trigger_pin: u8, echo_pin: u8) -> Self {
        EdgeCapture {
            trigger_pin,
            echo_pin,
            ceiling_us: None,
            phase: Phase::Idle,
            pulse_start: None,
            generation: 0,
            latest: None,
        }
    }

    /// Saturate pulses at `ceiling_us` and flag them out of range.
    pub fn with_ceiling(mut self, ceiling_us: u32) -> Self {
        self.ceiling_us = Some(ceiling_us);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of trigger pulses seen so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Most recent measurement, if any.
    pub fn latest(&self) -> Option<Measurement> {
        self.latest
    }

    /// Configured ceiling.
    pub fn ceiling_us(&self) -> Option<u32> {
        self.ceiling_us
    }

    /// Feed one edge. Returns the measurement if this edge completed one.
    pub fn on_edge(&mut self, event: EdgeEvent) -> Option<Measurement> {
        if event.pin == self.trigger_pin {
            if event.level == Level::Low {
                self.generation += 1;
                self.pulse_start = None;
                self.phase = Phase::Armed;
            }
            return None;
        }
        if event.pin != self.echo_pin {
            return None;
        }

        match (self.phase, event.level) {
            (Phase::Armed | Phase::EchoHigh, Level::High) => {
                self.pulse_start = Some(event.tick);
                self.phase = Phase::EchoHigh;
                None
            }
            (Phase::EchoHigh, Level::Low) => {
                // Phase::EchoHigh always carries a start tick.
                let start = self.pulse_start.take()?;
                let raw = event.tick.wrapping_sub(start);
                let (duration_us, out_of_range) = match self.ceiling_us {
                    Some(ceiling) if raw >= ceiling => (ceiling, true),
                    _ => (raw, false),
                };
                let measurement = Measurement {
                    duration_us,
                    generation: self.generation,
                    tick: event.tick,
                    out_of_range,
                };
                self.latest = Some(measurement);
                self.phase = Phase::Ready;
                Some(measurement)
            }
            (phase, level) => {
                trace!(pin = event.pin, ?level, ?phase, "Ignoring echo edge");
                None
            }
        }
    }
}

struct Inner {
    state: Mutex<EdgeCapture>,
    ready: Condvar,
}

/// [`EdgeCapture`] shared between an edge dispatch thread and a reader.
#[derive(Clone)]
pub struct SharedCapture {
    inner: Arc<Inner>,
}

impl SharedCapture {
    /// Share `capture`.
    pub fn new(capture: EdgeCapture) -> Self {
        SharedCapture {
            inner: Arc::new(Inner {
                state: Mutex::new(capture),
                ready: Condvar::new(),
            }),
        }
    }

    /// Feed one edge and wake waiting readers if it completed a measurement.
    pub fn handle_edge(&self, event: EdgeEvent) {
        let completed = self.inner.state.lock().on_edge(event);
        if let Some(m) = completed {
            trace!(duration_us = m.duration_us, generation = m.generation, "Echo captured");
            self.inner.ready.notify_all();
        }
    }

    /// Current trigger generation.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }

    /// Most recent measurement, if any.
    pub fn latest(&self) -> Option<Measurement> {
        self.inner.state.lock().latest()
    }

    /// Block until a measurement from a generation newer than `after` is
    /// available, or `timeout` elapses.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<Measurement> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(m) = state.latest().filter(|m| m.generation > after) {
                return Some(m);
            }
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                return state.latest().filter(|m| m.generation > after);
            }
        }
    }
}
