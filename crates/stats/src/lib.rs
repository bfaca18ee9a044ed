//! Streaming statistics over scalar and vector signals.
//!
//! Test harnesses feed time series (joint angles, link orientations) one
//! sample at a time and read named aggregates back:
//!
//! ```
//! use robosim_stats::SignalStats;
//!
//! let mut stats = SignalStats::new();
//! stats.insert_statistics("MaxAbs,Rms").unwrap();
//! for x in [0.1, -0.3, 0.2] {
//!     stats.insert_data(x);
//! }
//! assert_eq!(stats.map()["MaxAbs"], 0.3);
//! ```
//!
//! # Invariants
//! - Memory use is constant in the number of samples.
//! - An aggregate over zero samples reads as `0.0`.

pub mod signal;
pub mod vector;

pub use signal::{Aggregate, SignalStatistic, SignalStats, StatsError};
pub use vector::Vector3Stats;

pub fn crate_info() -> &'static str {
    "robosim-stats v0.1.0"
}
