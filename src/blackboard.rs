use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use rangefinder::{MuxReadings, ScanReading};

use crate::bus::Reading;

#[derive(Clone, Default)]
pub struct State {
    pub mux: Option<MuxReadings>,
    /// Latest reading per scanner, keyed by bearing in tenths of a degree.
    pub scans: HashMap<String, HashMap<u32, ScanReading>>,
    pub tof_mm: Vec<Option<u16>>,
    pub last_seen: HashMap<String, Instant>,
    pub faults: Vec<String>,
}

pub type Blackboard = Arc<RwLock<State>>;

pub fn snapshot(bb: &Blackboard) -> State {
    (*bb.read()).clone()
}

/// Fold a reading into the board and mark its source alive.
pub fn record(bb: &Blackboard, reading: &Reading) {
    let mut g = bb.write();
    g.last_seen.insert(reading.source(), Instant::now());
    match reading {
        Reading::Mux { readings, .. } => g.mux = Some(*readings),
        Reading::Scan { scanner, reading } => {
            let key = (reading.bearing * 10.0).round() as u32;
            g.scans.entry(scanner.clone()).or_default().insert(key, *reading);
        }
        Reading::Tof { distances_mm } => g.tof_mm = distances_mm.clone(),
    }
}

/// Expect `source` to report from now on.
pub fn register(bb: &Blackboard, source: &str) {
    bb.write().last_seen.insert(source.to_string(), Instant::now());
}

/// Sources that have not reported within `limit`, with their silence.
pub fn stale_sources(bb: &Blackboard, limit: Duration) -> Vec<(String, Duration)> {
    let now = Instant::now();
    let mut stale: Vec<_> = bb
        .read()
        .last_seen
        .iter()
        .map(|(source, seen)| (source.clone(), now.saturating_duration_since(*seen)))
        .filter(|(_, age)| *age > limit)
        .collect();
    stale.sort();
    stale
}

pub fn raise_fault(bb: &Blackboard, msg: &str) {
    let mut g = bb.write();
    if !g.faults.iter().any(|s| s == msg) {
        g.faults.push(msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_fault_deduplicates() {
        let bb: Blackboard = Arc::default();
        raise_fault(&bb, "mux stale");
        raise_fault(&bb, "mux stale");
        raise_fault(&bb, "tof stale");
        assert_eq!(snapshot(&bb).faults, vec!["mux stale".to_string(), "tof stale".to_string()]);
    }

    #[test]
    fn test_record_keeps_latest_per_bearing() {
        let bb: Blackboard = Arc::default();
        let at = |distance_m| Reading::Scan {
            scanner: "front".into(),
            reading: ScanReading { angle: 90.0, bearing: 270.0, distance_m },
        };
        record(&bb, &at(1.0));
        record(&bb, &at(2.0));
        let state = snapshot(&bb);
        let front = &state.scans["front"];
        assert_eq!(front.len(), 1);
        assert_eq!(front[&2700].distance_m, 2.0);
        assert!(state.last_seen.contains_key("scanner front"));
    }

    #[test]
    fn test_stale_sources() {
        let bb: Blackboard = Arc::default();
        register(&bb, "mux");
        assert!(stale_sources(&bb, Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let stale = stale_sources(&bb, Duration::from_millis(1));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "mux");

        record(&bb, &Reading::Mux { readings: [0.5; 9], sensors: 9 });
        assert!(stale_sources(&bb, Duration::from_secs(60)).is_empty());
        assert_eq!(snapshot(&bb).mux, Some([0.5; 9]));
    }
}
