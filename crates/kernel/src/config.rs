use glam::DVec3;
use robosim_physics::{EngineParams, SolverConfig};
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// World-level settings, usually read from the `world:` section of a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub name: String,
    pub gravity: DVec3,
    /// Fixed sub-step size in seconds.
    pub step_size: f64,
    /// Registry name of the physics back-end.
    pub engine: String,
    pub solver: SolverConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            gravity: DVec3::new(0.0, 0.0, -9.81),
            step_size: 0.001,
            engine: "xpbd".to_string(),
            solver: SolverConfig::default(),
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        validate_step_size(self.step_size)?;
        if !self.gravity.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "gravity must be finite, got {}",
                self.gravity
            )));
        }
        if self.solver.substeps == 0 || self.solver.iterations == 0 {
            return Err(SimError::InvalidArgument(
                "solver substeps and iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            gravity: self.gravity,
            solver: self.solver.clone(),
        }
    }
}

pub(crate) fn validate_step_size(step_size: f64) -> Result<(), SimError> {
    if step_size.is_finite() && step_size > 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidArgument(format!(
            "step size must be positive, got {step_size}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = WorldConfig::default();
        assert_eq!(c.gravity, DVec3::new(0.0, 0.0, -9.81));
        assert_eq!(c.step_size, 0.001);
        assert_eq!(c.engine, "xpbd");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let c: WorldConfig =
            serde_yaml::from_str("gravity: [0.1, 0.0, -9.81]\nengine: articulated\n").unwrap();
        assert_eq!(c.gravity.x, 0.1);
        assert_eq!(c.engine, "articulated");
        assert_eq!(c.step_size, 0.001);
        assert_eq!(c.solver.substeps, SolverConfig::default().substeps);
    }

    #[test]
    fn rejects_bad_step_size() {
        for dt in [0.0, -0.001, f64::NAN] {
            let c = WorldConfig {
                step_size: dt,
                ..WorldConfig::default()
            };
            assert!(matches!(c.validate(), Err(SimError::InvalidArgument(_))));
        }
    }
}
