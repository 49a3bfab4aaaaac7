use std::sync::Arc;
use tokio::sync::broadcast;

use rangefinder::{MuxReadings, ScanReading};

/// Something a sensor thread measured.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// One pass over the multiplexed sensors, metres per channel.
    Mux { readings: MuxReadings, sensors: usize },
    /// One position of a scanner sweep.
    Scan { scanner: String, reading: ScanReading },
    /// One poll of the time-of-flight bank, millimetres per device.
    Tof { distances_mm: Vec<Option<u16>> },
}

impl Reading {
    /// Name used for staleness tracking and logs.
    pub fn source(&self) -> String {
        match self {
            Reading::Mux { .. } => "mux".into(),
            Reading::Scan { scanner, .. } => format!("scanner {}", scanner),
            Reading::Tof { .. } => "tof".into(),
        }
    }
}

/// Scanned mux distances as text, three decimals each. Only the first
/// `sensors` channels are shown, and never more than the array holds.
pub fn format_mux(readings: &MuxReadings, sensors: usize) -> String {
    readings
        .iter()
        .take(sensors)
        .map(|d| format!("{:.3}", d))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Broadcast topic with bounded capacity.
/// `T` must be `Send + Sync` because we hop across threads.
#[derive(Debug, Clone)]
pub struct Topic<T> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn publish(&self, msg: T) -> usize {
        self.tx.send(Arc::new(msg)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}
