use robosim_common::Vector3;

use crate::signal::{SignalStats, StatsError};

/// Per-axis and magnitude statistics of a vector signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vector3Stats {
    pub x: SignalStats,
    pub y: SignalStats,
    pub z: SignalStats,
    pub mag: SignalStats,
}

impl Vector3Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_statistic(&mut self, name: &str) -> Result<(), StatsError> {
        self.insert_statistics(name)
    }

    /// Insert a comma-separated list of aggregates on every component.
    pub fn insert_statistics(&mut self, names: &str) -> Result<(), StatsError> {
        let mut result = Ok(());
        for signal in [&mut self.x, &mut self.y, &mut self.z, &mut self.mag] {
            if let Err(err) = signal.insert_statistics(names) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn insert_data(&mut self, v: Vector3) {
        self.x.insert_data(v.x);
        self.y.insert_data(v.y);
        self.z.insert_data(v.z);
        self.mag.insert_data(v.length());
    }

    pub fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
        self.z.reset();
        self.mag.reset();
    }
}
