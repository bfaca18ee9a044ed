use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("unknown statistic `{0}`")]
    Unknown(String),
    #[error("statistic `{0}` is already collected")]
    Duplicate(String),
}

/// Aggregate kinds, addressed by their short names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Aggregate {
    Mean,
    MaxAbs,
    Rms,
    /// Population variance.
    Var,
}

impl Aggregate {
    pub const ALL: [Aggregate; 4] = [
        Aggregate::Mean,
        Aggregate::MaxAbs,
        Aggregate::Rms,
        Aggregate::Var,
    ];

    pub fn short_name(self) -> &'static str {
        match self {
            Aggregate::Mean => "Mean",
            Aggregate::MaxAbs => "MaxAbs",
            Aggregate::Rms => "Rms",
            Aggregate::Var => "Var",
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for Aggregate {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregate::ALL
            .into_iter()
            .find(|a| a.short_name() == s)
            .ok_or_else(|| StatsError::Unknown(s.to_string()))
    }
}

/// One running aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalStatistic {
    kind: Aggregate,
    count: u64,
    /// Running mean for `Mean`/`Var`, running mean square for `Rms`,
    /// running maximum for `MaxAbs`.
    acc: f64,
    /// Welford sum of squared deviations, `Var` only.
    m2: f64,
}

impl SignalStatistic {
    pub fn new(kind: Aggregate) -> Self {
        Self {
            kind,
            count: 0,
            acc: 0.0,
            m2: 0.0,
        }
    }

    pub fn kind(&self) -> Aggregate {
        self.kind
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn insert(&mut self, x: f64) {
        self.count += 1;
        let n = self.count as f64;
        match self.kind {
            Aggregate::Mean => self.acc += (x - self.acc) / n,
            Aggregate::MaxAbs => self.acc = self.acc.max(x.abs()),
            Aggregate::Rms => self.acc += (x * x - self.acc) / n,
            Aggregate::Var => {
                let delta = x - self.acc;
                self.acc += delta / n;
                self.m2 += delta * (x - self.acc);
            }
        }
    }

    pub fn value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        match self.kind {
            Aggregate::Mean | Aggregate::MaxAbs => self.acc,
            Aggregate::Rms => self.acc.sqrt(),
            Aggregate::Var => self.m2 / self.count as f64,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.kind);
    }
}

/// A set of aggregates fed from the same scalar signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalStats {
    stats: Vec<SignalStatistic>,
}

impl SignalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting the aggregate named `name`.
    pub fn insert_statistic(&mut self, name: &str) -> Result<(), StatsError> {
        let kind: Aggregate = name.trim().parse()?;
        if self.stats.iter().any(|s| s.kind == kind) {
            return Err(StatsError::Duplicate(kind.short_name().to_string()));
        }
        self.stats.push(SignalStatistic::new(kind));
        Ok(())
    }

    /// Insert every name of a comma-separated list (`"MaxAbs,Rms"`).
    ///
    /// Valid names are inserted even when others fail; the first failure is
    /// returned.
    pub fn insert_statistics(&mut self, names: &str) -> Result<(), StatsError> {
        let mut first_error = None;
        for name in names.split(',').filter(|n| !n.trim().is_empty()) {
            if let Err(err) = self.insert_statistic(name) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn insert_data(&mut self, x: f64) {
        for stat in &mut self.stats {
            stat.insert(x);
        }
    }

    /// Samples seen since the last reset.
    pub fn count(&self) -> u64 {
        self.stats.first().map_or(0, SignalStatistic::count)
    }

    pub fn get(&self, kind: Aggregate) -> Option<f64> {
        self.stats
            .iter()
            .find(|s| s.kind == kind)
            .map(SignalStatistic::value)
    }

    /// Current values keyed by short name.
    pub fn map(&self) -> BTreeMap<String, f64> {
        self.stats
            .iter()
            .map(|s| (s.kind.short_name().to_string(), s.value()))
            .collect()
    }

    pub fn reset(&mut self) {
        for stat in &mut self.stats {
            stat.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn aggregates_over_known_series() {
        let mut s = SignalStats::new();
        s.insert_statistics("Mean,MaxAbs,Rms,Var").unwrap();
        for x in [1.0, -2.0, 3.0, -4.0] {
            s.insert_data(x);
        }
        let m = s.map();
        assert_abs_diff_eq!(m["Mean"], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(m["MaxAbs"], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m["Rms"], (30.0_f64 / 4.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(m["Var"], 7.25, epsilon = 1e-12);
        assert_eq!(s.count(), 4);
    }

    #[test]
    fn empty_statistics_read_zero() {
        let mut s = SignalStats::new();
        s.insert_statistic("Rms").unwrap();
        assert_eq!(s.get(Aggregate::Rms), Some(0.0));
        assert_eq!(s.get(Aggregate::Mean), None);
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn unknown_and_duplicate_names_are_rejected() {
        let mut s = SignalStats::new();
        assert_eq!(
            s.insert_statistics("MaxAbs,Median,Rms"),
            Err(StatsError::Unknown("Median".into()))
        );
        // The valid names were still inserted.
        assert_eq!(s.map().len(), 2);
        assert_eq!(
            s.insert_statistic("Rms"),
            Err(StatsError::Duplicate("Rms".into()))
        );
    }

    #[test]
    fn reset_clears_samples_but_keeps_aggregates() {
        let mut s = SignalStats::new();
        s.insert_statistics("MaxAbs").unwrap();
        s.insert_data(-9.0);
        s.reset();
        assert_eq!(s.get(Aggregate::MaxAbs), Some(0.0));
        s.insert_data(0.5);
        assert_eq!(s.get(Aggregate::MaxAbs), Some(0.5));
    }

    #[test]
    fn names_parse_and_display() {
        for kind in Aggregate::ALL {
            assert_eq!(kind.to_string().parse::<Aggregate>().unwrap(), kind);
        }
    }
}
