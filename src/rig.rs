//! Builds the configured sensors on the chosen backend and runs each of them
//! on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rangefinder::sim::{SimGpio, SimPwm, SimTof};
use rangefinder::{Gpio, MUX_CHANNELS, MuxRanger, Pwm, ScanningRanger, TofArray, TofSlot};
use spin_sleep::SpinSleeper;
use tracing::{error, info, warn};

use crate::blackboard::{Blackboard, record, register};
use crate::bus::{Reading, Topic};
use crate::settings::{Backend, MuxSettings, ScannerSettings, Settings, TofSettings};

/// Echo latency of the simulated sensors.
const SIM_ECHO_LATENCY_US: u32 = 150;

pub struct Hardware {
    pub gpio: Arc<dyn Gpio>,
    pub pwm: Arc<dyn Pwm>,
    /// Present when running on the simulator.
    sim: Option<Arc<SimGpio>>,
}

pub fn open_backend(settings: &Settings) -> anyhow::Result<Hardware> {
    match settings.backend {
        Backend::Sim => {
            let sim = Arc::new(SimGpio::new());
            install_scene(&sim, settings);
            info!(seed = settings.sim.seed, "Simulated backend ready");
            Ok(Hardware { gpio: sim.clone(), pwm: Arc::new(SimPwm::new()), sim: Some(sim) })
        }
        Backend::Rpi => open_rpi(),
    }
}

#[cfg(feature = "rpi")]
fn open_rpi() -> anyhow::Result<Hardware> {
    let rpi = Arc::new(rangefinder::rpi::RpiGpio::new().context("opening Raspberry Pi GPIO")?);
    Ok(Hardware { gpio: rpi.clone(), pwm: rpi, sim: None })
}

#[cfg(not(feature = "rpi"))]
fn open_rpi() -> anyhow::Result<Hardware> {
    bail!("backend \"rpi\" needs a build with the `rpi` feature")
}

fn jittered(rng: &mut StdRng, base: u32, jitter: u32) -> u32 {
    if jitter == 0 {
        return base;
    }
    let jitter = jitter.min(i32::MAX as u32) as i32;
    base.saturating_add_signed(rng.random_range(-jitter..=jitter))
}

/// Attach echo responders for every configured ultrasonic sensor.
fn install_scene(sim: &SimGpio, settings: &Settings) {
    let scene = &settings.sim;
    if let Some(mux) = &settings.mux {
        let select = mux.select_pins;
        let widths = scene.mux_echo_us.clone();
        let jitter = scene.jitter_us;
        let mut rng = StdRng::seed_from_u64(scene.seed);
        sim.set_responder(mux.trigger_pin, mux.echo_pin, SIM_ECHO_LATENCY_US, move |levels| {
            let channel = select
                .iter()
                .enumerate()
                .filter(|(_, pin)| levels.is_high(**pin))
                .map(|(bit, _)| 1usize << bit)
                .sum::<usize>();
            // Channels past the table hear nothing.
            let base = widths.get(channel).copied()?;
            Some(jittered(&mut rng, base, jitter))
        });
    }
    for (i, scanner) in settings.scanners.iter().enumerate() {
        let base = scene.scanner_echo_us;
        let jitter = scene.jitter_us;
        let mut rng = StdRng::seed_from_u64(scene.seed.wrapping_add(i as u64 + 1));
        sim.set_responder(scanner.trigger_pin, scanner.echo_pin, SIM_ECHO_LATENCY_US, move |_| {
            Some(jittered(&mut rng, base, jitter))
        });
    }
}

/// Handles of the running sensor threads.
pub struct SensorThreads {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SensorThreads {
    pub fn count(&self) -> usize {
        self.handles.len()
    }

    /// Ask every thread to finish its current reading and wait for it.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("sensor").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Sensor thread panicked");
            }
        }
        info!("Sensor threads stopped.");
    }
}

struct Spawner<'a> {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    topic: &'a Topic<Reading>,
    bb: &'a Blackboard,
}

impl Spawner<'_> {
    fn spawn<F>(&mut self, name: String, source: &str, body: F) -> anyhow::Result<()>
    where
        F: FnOnce(&AtomicBool, &dyn Fn(Reading)) + Send + 'static,
    {
        register(self.bb, source);
        let stop = Arc::clone(&self.stop);
        let topic = self.topic.clone();
        let bb = Arc::clone(self.bb);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!("{} thread started.", name);
                let publish = |reading: Reading| {
                    record(&bb, &reading);
                    topic.publish(reading);
                };
                body(&stop, &publish);
                info!("{} thread finished.", name);
            })
            .with_context(|| format!("spawning {} thread", source))?;
        self.handles.push(handle);
        Ok(())
    }
}

/// Bring up every configured device and start its reading loop.
pub fn spawn_sensors(
    hw: &Hardware,
    settings: &Settings,
    topic: &Topic<Reading>,
    bb: &Blackboard,
) -> anyhow::Result<SensorThreads> {
    let mut spawner = Spawner { stop: Arc::default(), handles: Vec::new(), topic, bb };

    if let Some(mux) = &settings.mux {
        spawn_mux(&mut spawner, hw, mux, settings.speed_of_sound_cm_s)?;
    }
    for scanner in &settings.scanners {
        spawn_scanner(&mut spawner, hw, scanner, settings.speed_of_sound_cm_s)?;
    }
    if let Some(tof) = &settings.tof {
        match &hw.sim {
            Some(sim) => spawn_tof(&mut spawner, hw, sim, tof, &settings.sim.tof_distance_mm)?,
            None => warn!("No I2C time-of-flight driver on this backend; skipping [tof]"),
        }
    }

    Ok(SensorThreads { stop: spawner.stop, handles: spawner.handles })
}

fn spawn_mux(spawner: &mut Spawner<'_>, hw: &Hardware, mux: &MuxSettings, speed: f64) -> anyhow::Result<()> {
    let mut ranger = MuxRanger::new(
        Arc::clone(&hw.gpio),
        mux.trigger_pin,
        mux.echo_pin,
        mux.select_pins,
        mux.mux_config(speed),
    )
    .context("setting up multiplexed rangers")?;
    let sensors = mux.sensors.min(MUX_CHANNELS);
    let period = Duration::from_millis(mux.period_ms);

    spawner.spawn("mux".into(), "mux", move |stop, publish| {
        let sleeper = SpinSleeper::default();
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            let Some(readings) = ranger.scan(sensors) else { break };
            publish(Reading::Mux { readings, sensors });
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                sleeper.sleep(rest);
            }
        }
        ranger.cancel();
    })
}

fn spawn_scanner(
    spawner: &mut Spawner<'_>,
    hw: &Hardware,
    settings: &ScannerSettings,
    speed: f64,
) -> anyhow::Result<()> {
    let config = settings.scanner_config(speed);
    let mut scanner = ScanningRanger::new(
        Arc::clone(&hw.gpio),
        Arc::clone(&hw.pwm),
        settings.servo_pin,
        settings.trigger_pin,
        settings.echo_pin,
        config,
    )
    .with_context(|| format!("setting up scanner {}", settings.name))?;
    let name = settings.name.clone();
    let samples = settings.samples;
    let source = format!("scanner {}", name);

    spawner.spawn(format!("scan-{}", name), &source, move |stop, publish| {
        // Sweep back and forth between the servo limits.
        let mut angle = config.min_angle;
        let mut direction = 1.0;
        while !stop.load(Ordering::Relaxed) {
            let Some(reading) = scanner.read_angle(angle, samples) else { break };
            publish(Reading::Scan { scanner: name.clone(), reading });
            let next = angle + direction * config.step;
            if next > config.max_angle || next < config.min_angle {
                direction = -direction;
            }
            angle = (angle + direction * config.step).clamp(config.min_angle, config.max_angle);
        }
        scanner.cancel();
    })
}

fn spawn_tof(
    spawner: &mut Spawner<'_>,
    hw: &Hardware,
    sim: &Arc<SimGpio>,
    tof: &TofSettings,
    distances_mm: &[u16],
) -> anyhow::Result<()> {
    if tof.shutdown_pins.is_empty() {
        bail!("[tof] lists no sensors");
    }
    let slots = tof
        .shutdown_pins
        .iter()
        .zip(&tof.addresses)
        .enumerate()
        .map(|(i, (&pin, &address))| {
            let distance = distances_mm.get(i).or(distances_mm.last()).copied().unwrap_or(0);
            TofSlot::new(pin, address, Box::new(SimTof::new(Arc::clone(sim), pin, distance)))
        })
        .collect();
    let mut array = TofArray::bring_up(Arc::clone(&hw.gpio), slots, tof.tof_config())
        .context("bringing up time-of-flight sensors")?;
    let interval = array.poll_interval();

    spawner.spawn("tof".into(), "tof", move |stop, publish| {
        let sleeper = SpinSleeper::default();
        while !stop.load(Ordering::Relaxed) {
            publish(Reading::Tof { distances_mm: array.read_all() });
            sleeper.sleep(interval);
        }
        array.shutdown();
    })
}
