//! Physics back-ends for the robot simulator.
//!
//! The kernel talks to dynamics exclusively through [`PhysicsEngine`]:
//! bodies, joint constraints, gravity, forces and stepping. Two back-ends
//! are provided and selected by name through [`EngineRegistry`]:
//!
//! - `xpbd`: maximal coordinates, substepped position-based constraint
//!   projection with hard contacts.
//! - `articulated`: reduced coordinates over a kinematic tree with
//!   penalty contacts.
//!
//! # Invariants
//!
//! - Handles come from monotonically increasing counters and are never reused.
//! - Bodies, constraints and contacts are iterated in handle order, so a
//!   step is a pure function of the engine state and `dt`.
//! - A step that reports [`EngineError::Diverged`] does not commit new state.

pub mod articulated;
pub mod collision;
pub mod engine;
pub mod registry;
pub mod spatial;
pub mod xpbd;

pub use articulated::ArticulatedEngine;
pub use collision::{Contact, ContactPoint, Shape, ShapeDesc};
pub use engine::{
    BodyDesc, BodyHandle, BodyKind, ConstraintDesc, ConstraintHandle, EngineError, EngineParams,
    JointKind, JointState, PhysicsEngine, SolverConfig,
};
pub use registry::{EngineFactory, EngineRegistry};
pub use xpbd::XpbdEngine;

pub fn crate_info() -> &'static str {
    "robosim-physics v0.1.0"
}
