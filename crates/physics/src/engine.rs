use glam::{DMat3, DVec3};
use robosim_common::{Pose, Twist};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::collision::{Contact, ShapeDesc};

/// Opaque handle to a rigid body owned by an engine.
///
/// Handles are allocated from a monotonically increasing counter and never
/// reused, so a stale handle is always rejected rather than aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(u32);

/// Opaque handle to a joint constraint owned by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintHandle(u32);

impl BodyHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl ConstraintHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body@{}", self.0)
    }
}

impl fmt::Display for ConstraintHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "constraint@{}", self.0)
    }
}

/// Errors reported by physics back-ends.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown body handle {0}")]
    InvalidBodyHandle(BodyHandle),
    #[error("unknown constraint handle {0}")]
    InvalidConstraintHandle(ConstraintHandle),
    #[error("invalid constraint `{name}`: {reason}")]
    InvalidConstraint { name: String, reason: String },
    #[error("solver diverged at body `{body}`: {detail}")]
    Diverged { body: String, detail: String },
    #[error("physics backend `{0}` is not available")]
    UnsupportedBackend(String),
}

/// Whether a body is integrated or held in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    #[default]
    Dynamic,
    Static,
}

/// Everything an engine needs to create a native body.
#[derive(Debug, Clone)]
pub struct BodyDesc {
    pub name: String,
    /// Pose of the center-of-mass frame in world coordinates.
    pub pose: Pose,
    pub twist: Twist,
    pub mass: f64,
    /// Rotational inertia about the center of mass, in the body frame.
    pub inertia: DMat3,
    pub kind: BodyKind,
    pub gravity: bool,
    pub linear_damping: f64,
    pub angular_damping: f64,
    pub shapes: Vec<ShapeDesc>,
    /// Bodies sharing a group do not collide with each other unless both
    /// allow self-collision.
    pub collision_group: Option<u32>,
    pub self_collide: bool,
}

impl BodyDesc {
    pub fn new(name: impl Into<String>, pose: Pose, mass: f64, inertia: DMat3) -> Self {
        Self {
            name: name.into(),
            pose,
            twist: Twist::ZERO,
            mass,
            inertia,
            kind: BodyKind::Dynamic,
            gravity: true,
            linear_damping: 0.0,
            angular_damping: 0.0,
            shapes: Vec::new(),
            collision_group: None,
            self_collide: false,
        }
    }

    pub fn fixed(name: impl Into<String>, pose: Pose) -> Self {
        Self {
            kind: BodyKind::Static,
            gravity: false,
            ..Self::new(name, pose, 0.0, DMat3::ZERO)
        }
    }

    pub fn with_shape(mut self, shape: ShapeDesc) -> Self {
        self.shapes.push(shape);
        self
    }
}

/// Joint families supported by every back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    /// One rotational degree of freedom about `axis`.
    Revolute,
    /// One translational degree of freedom along `axis`.
    Prismatic,
    /// Three rotational degrees of freedom about the anchor.
    Ball,
    /// No relative motion.
    Fixed,
}

impl fmt::Display for JointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JointKind::Revolute => "revolute",
            JointKind::Prismatic => "prismatic",
            JointKind::Ball => "ball",
            JointKind::Fixed => "fixed",
        };
        f.write_str(s)
    }
}

/// Everything an engine needs to create a native joint constraint.
///
/// Anchor and axis are world-space values sampled at creation time; the
/// configuration at creation is the joint's zero position.
#[derive(Debug, Clone)]
pub struct ConstraintDesc {
    pub name: String,
    pub kind: JointKind,
    /// `None` anchors the joint to the fixed world frame.
    pub parent: Option<BodyHandle>,
    pub child: BodyHandle,
    pub anchor: DVec3,
    pub axis: DVec3,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    /// Viscous damping coefficient on the joint's generalized velocity.
    pub damping: f64,
}

impl ConstraintDesc {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidConstraint {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.parent == Some(self.child) {
            return Err(invalid("parent and child are the same body"));
        }
        if matches!(self.kind, JointKind::Revolute | JointKind::Prismatic)
            && !(self.axis.is_finite() && self.axis.length_squared() > 1e-12)
        {
            return Err(invalid("axis must be a non-zero finite vector"));
        }
        if let (Some(lo), Some(hi)) = (self.lower, self.upper) {
            if lo > hi {
                return Err(invalid("lower limit exceeds upper limit"));
            }
        }
        Ok(())
    }
}

/// Generalized position and velocity of a joint.
///
/// Ball joints report the magnitude of the relative rotation and of the
/// relative angular velocity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JointState {
    pub position: f64,
    pub velocity: f64,
}

/// Solver tuning shared by all back-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Integration sub-steps per engine step.
    pub substeps: u32,
    /// Constraint projection iterations per sub-step (iterative back-ends).
    pub iterations: u32,
    /// Normal stiffness of penalty contacts (N/m).
    pub contact_stiffness: f64,
    /// Normal damping of penalty contacts (N·s/m).
    pub contact_damping: f64,
    /// Stiffness of spring-damper loop closures (N/m, N·m/rad).
    pub loop_stiffness: f64,
    pub loop_damping: f64,
    /// Any body faster than this (m/s or rad/s) is treated as divergence.
    pub max_speed: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            substeps: 8,
            iterations: 4,
            contact_stiffness: 1.0e5,
            contact_damping: 300.0,
            loop_stiffness: 1.0e4,
            loop_damping: 100.0,
            max_speed: 1.0e4,
        }
    }
}

/// Global parameters an engine is initialized with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    pub gravity: DVec3,
    pub solver: SolverConfig,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            gravity: DVec3::new(0.0, 0.0, -9.81),
            solver: SolverConfig::default(),
        }
    }
}

/// Capability interface implemented once per dynamics back-end.
///
/// The stepping kernel is written against this trait only. Implementations
/// own their native state exclusively; no state is shared between engine
/// instances. `step` must be deterministic: identical bodies, constraints,
/// gravity, solver parameters and step sizes reproduce identical poses.
pub trait PhysicsEngine: Send + Sync {
    /// Registry name of the back-end (`"xpbd"`, `"articulated"`, ...).
    fn kind(&self) -> &'static str;

    /// Apply global parameters and drop every native body and constraint.
    fn init(&mut self, params: &EngineParams);

    /// Advance the native state by `dt` seconds.
    fn step(&mut self, dt: f64) -> Result<(), EngineError>;

    fn add_body(&mut self, desc: &BodyDesc) -> BodyHandle;

    /// Remove a body and every constraint still attached to it.
    fn remove_body(&mut self, body: BodyHandle) -> Result<(), EngineError>;

    fn set_gravity(&mut self, gravity: DVec3);

    fn gravity(&self) -> DVec3;

    /// Accumulate a force at the center of mass and a torque, both in world
    /// coordinates, for the next step only.
    fn apply_force(
        &mut self,
        body: BodyHandle,
        force: DVec3,
        torque: DVec3,
    ) -> Result<(), EngineError>;

    fn set_pose(&mut self, body: BodyHandle, pose: Pose) -> Result<(), EngineError>;

    fn set_velocity(&mut self, body: BodyHandle, twist: Twist) -> Result<(), EngineError>;

    fn pose(&self, body: BodyHandle) -> Result<Pose, EngineError>;

    fn velocity(&self, body: BodyHandle) -> Result<Twist, EngineError>;

    fn add_constraint(&mut self, desc: &ConstraintDesc) -> Result<ConstraintHandle, EngineError>;

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> Result<(), EngineError>;

    /// Accumulate a generalized effort (torque or force) for the next step.
    fn apply_joint_effort(
        &mut self,
        constraint: ConstraintHandle,
        effort: f64,
    ) -> Result<(), EngineError>;

    fn joint_state(&self, constraint: ConstraintHandle) -> Result<JointState, EngineError>;

    /// Contacts produced by the most recent step.
    fn contacts(&self) -> &[Contact];

    fn body_count(&self) -> usize;

    fn constraint_count(&self) -> usize;

    /// Drop every body, constraint and contact. Parameters are kept and
    /// handles issued before the call stay invalid.
    fn clear(&mut self);
}
