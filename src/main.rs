mod blackboard; // latest readings, source liveness and faults
mod bus; // broadcast topic carrying readings
mod rig; // backend and sensor threads
mod settings; // typed configuration

use blackboard::{Blackboard, raise_fault, snapshot, stale_sources};
use bus::{Reading, Topic, format_mux};
use settings::{DEFAULT_CONFIG_PATH, Settings, load_settings};

use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    // The global subscriber takes its level from the settings, so loading
    // them logs through a scoped one first.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let settings = tracing::subscriber::with_default(bootstrap, || load_settings(&path))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %path, backend = ?settings.backend, "Sonar rig started.");

    match run(settings).await {
        Ok(()) => {
            info!("Sonar rig finished.");
            Ok(())
        }
        Err(e) => {
            error!("Sonar rig failed: {:?}", e);
            Err(e)
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let bb: Blackboard = Arc::default();
    let topic: Topic<Reading> = Topic::new(64);
    let reading_rx = topic.subscribe();

    let hw = rig::open_backend(&settings)?;
    let threads = rig::spawn_sensors(&hw, &settings, &topic, &bb)?;
    info!(threads = threads.count(), "Sensor threads running.");

    let stale_after = Duration::from_millis(settings.stale_after_ms);
    tokio::select! {
        res = async { tokio::try_join!(reporter(reading_rx), watchdog(bb.clone(), stale_after)) } => {
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Ctrl-C received, stopping.");
        }
        _ = run_limit(settings.run_secs) => {
            info!(run_secs = settings.run_secs, "Run time elapsed, stopping.");
        }
    }

    tokio::task::spawn_blocking(move || threads.shutdown()).await?;

    let state = snapshot(&bb);
    info!(
        mux_m = ?state.mux,
        scanned_bearings = state.scans.values().map(|bearings| bearings.len()).sum::<usize>(),
        tof_mm = ?state.tof_mm,
        "Final readings"
    );
    if !state.faults.is_empty() {
        warn!(faults = ?state.faults, "Faults raised during the run");
    }
    Ok(())
}

async fn run_limit(run_secs: u64) {
    if run_secs == 0 {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(Duration::from_secs(run_secs)).await;
}

async fn reporter(mut rx: broadcast::Receiver<Arc<Reading>>) -> anyhow::Result<()> {
    info!("Reporter task started.");
    loop {
        match rx.recv().await {
            Ok(reading) => match &*reading {
                Reading::Mux { readings, sensors } => {
                    info!(distances_m = %format_mux(readings, *sensors), "mux");
                }
                Reading::Scan { scanner, reading } => {
                    debug!(scanner = %scanner, %reading, "scan");
                }
                Reading::Tof { distances_mm } => {
                    info!(?distances_mm, "tof");
                }
            },
            Err(RecvError::Lagged(missed)) => warn!(missed, "Reporter fell behind"),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn watchdog(bb: Blackboard, stale_after: Duration) -> anyhow::Result<()> {
    info!("Watchdog task started.");
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tick.tick().await;
        for (source, age) in stale_sources(&bb, stale_after) {
            warn!(%source, ?age, "Sensor source stale");
            raise_fault(&bb, &format!("{} stale", source));
        }
    }
}
