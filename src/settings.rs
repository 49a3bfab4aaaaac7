use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, bail};
use config::{Config, Environment, File, FileFormat};
use rangefinder::{AccuracyMode, MUX_CHANNELS, MuxConfig, RangerConfig, ScannerConfig, TofConfig};
use serde::Deserialize;
use tracing::{error, info};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sim,
    Rpi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub backend: Backend,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub run_secs: u64,
    #[serde(default = "default_speed")]
    pub speed_of_sound_cm_s: f64,
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,
    pub mux: Option<MuxSettings>,
    #[serde(default)]
    pub scanners: Vec<ScannerSettings>,
    pub tof: Option<TofSettings>,
    #[serde(default)]
    pub sim: SimSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuxSettings {
    pub trigger_pin: u8,
    pub echo_pin: u8,
    pub select_pins: [u8; 4],
    pub sensors: usize,
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    #[serde(default = "default_mux_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_mux_period")]
    pub period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSettings {
    pub name: String,
    pub servo_pin: u8,
    pub trigger_pin: u8,
    pub echo_pin: u8,
    pub offset: f64,
    #[serde(default = "default_min_angle")]
    pub min_angle: f64,
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_samples")]
    pub samples: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TofSettings {
    pub shutdown_pins: Vec<u8>,
    pub addresses: Vec<u8>,
    #[serde(default)]
    pub mode: AccuracyMode,
    #[serde(default = "default_tof_delay")]
    pub reset_hold_ms: u64,
    #[serde(default = "default_tof_delay")]
    pub boot_delay_ms: u64,
}

/// Scene played back by the simulated backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SimSettings {
    pub seed: u64,
    pub jitter_us: u32,
    pub mux_echo_us: Vec<u32>,
    pub scanner_echo_us: u32,
    pub tof_distance_mm: Vec<u16>,
}

impl Default for SimSettings {
    fn default() -> Self {
        SimSettings {
            seed: 0,
            jitter_us: 0,
            mux_echo_us: vec![5800],
            scanner_echo_us: 4000,
            tof_distance_mm: vec![500],
        }
    }
}

fn default_log_level() -> String { "info".into() }
fn default_speed() -> f64 { rangefinder::ranger::SPEED_OF_SOUND_CM_S }
fn default_stale_after() -> u64 { 2_000 }
fn default_settle() -> u64 { 10 }
fn default_mux_timeout() -> u64 { 100 }
fn default_mux_period() -> u64 { 250 }
fn default_min_angle() -> f64 { 10.0 }
fn default_max_angle() -> f64 { 160.0 }
fn default_step() -> f64 { 10.0 }
fn default_samples() -> usize { 1 }
fn default_tof_delay() -> u64 { 500 }

/// Load `path`, apply `SONAR__*` environment overrides and check the result.
pub fn load_settings(path: &str) -> anyhow::Result<Settings> {
    info!("Attempting to load configuration from {}", path);

    let built = Config::builder()
        .add_source(File::new(path, FileFormat::Toml).required(true))
        .add_source(Environment::with_prefix("SONAR").separator("__").try_parsing(true))
        .build();

    let config = match built {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).with_context(|| format!("reading {}", path));
        }
    };
    let settings: Settings = config.try_deserialize().context("decoding settings")?;
    settings.validate()?;
    info!(backend = ?settings.backend, scanners = settings.scanners.len(), "Configuration loaded");
    Ok(settings)
}

impl Settings {
    /// Parse settings from TOML text without touching the environment.
    #[cfg(test)]
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut owners: HashMap<u8, String> = HashMap::new();
        let mut claim = |pin: u8, owner: String| -> anyhow::Result<()> {
            if let Some(previous) = owners.insert(pin, owner.clone()) {
                bail!("GPIO {} used by both {} and {}", pin, previous, owner);
            }
            Ok(())
        };

        if let Some(mux) = &self.mux {
            claim(mux.trigger_pin, "mux trigger".into())?;
            claim(mux.echo_pin, "mux echo".into())?;
            for (bit, pin) in mux.select_pins.iter().enumerate() {
                claim(*pin, format!("mux s{}", bit))?;
            }
            if mux.sensors == 0 || mux.sensors > MUX_CHANNELS {
                bail!("mux.sensors must be between 1 and {}, got {}", MUX_CHANNELS, mux.sensors);
            }
        }
        for scanner in &self.scanners {
            claim(scanner.servo_pin, format!("scanner {} servo", scanner.name))?;
            claim(scanner.trigger_pin, format!("scanner {} trigger", scanner.name))?;
            claim(scanner.echo_pin, format!("scanner {} echo", scanner.name))?;
            scanner
                .scanner_config(self.speed_of_sound_cm_s)
                .validate()
                .with_context(|| format!("scanner {}", scanner.name))?;
        }
        if let Some(tof) = &self.tof {
            if tof.shutdown_pins.len() != tof.addresses.len() {
                bail!(
                    "tof lists {} shutdown pins but {} addresses",
                    tof.shutdown_pins.len(),
                    tof.addresses.len()
                );
            }
            for pin in &tof.shutdown_pins {
                claim(*pin, "tof shutdown".into())?;
            }
            for address in &tof.addresses {
                if *address > 0x7F {
                    bail!("I2C address {:#04x} is not 7-bit", address);
                }
            }
        }
        Ok(())
    }
}

impl MuxSettings {
    pub fn mux_config(&self, speed_of_sound_cm_s: f64) -> MuxConfig {
        MuxConfig {
            settle: Duration::from_millis(self.settle_ms),
            ranger: RangerConfig {
                timeout: Duration::from_millis(self.timeout_ms),
                speed_of_sound_cm_s,
                ..RangerConfig::default()
            },
        }
    }
}

impl ScannerSettings {
    pub fn scanner_config(&self, speed_of_sound_cm_s: f64) -> ScannerConfig {
        ScannerConfig {
            offset: self.offset,
            min_angle: self.min_angle,
            max_angle: self.max_angle,
            step: self.step,
            speed_of_sound_cm_s,
            ..ScannerConfig::default()
        }
    }
}

impl TofSettings {
    pub fn tof_config(&self) -> TofConfig {
        TofConfig {
            reset_hold: Duration::from_millis(self.reset_hold_ms),
            boot_delay: Duration::from_millis(self.boot_delay_ms),
            mode: self.mode,
        }
    }
}
