//! World kernel: entity hierarchy, deterministic stepping over a pluggable
//! physics engine, and per-step contact reporting.
//!
//! # Invariants
//! - Simulation time advances only through `World::step`, by exactly
//!   `n * step_size` per call.
//! - Every link and joint in the hierarchy owns exactly one engine handle;
//!   removal, reset and failed insertions release them.
//! - Hierarchy mutations are atomic and fail with `Busy` while a step runs.
//! - Contacts describe the most recent sub-step only.
//! - The event log holds at most `EVENT_LOG_CAPACITY` records.

pub mod config;
pub mod contact;
pub mod description;
pub mod error;
pub mod hierarchy;
pub mod world;

pub use config::WorldConfig;
pub use contact::ContactEvent;
pub use description::{
    CollisionDescription, EntityDescription, Extensions, Inertial, InertiaTensor,
    JointDescription, LinkDescription, ModelDescription, SceneDescription, VisualDescription,
    WORLD_ANCHOR,
};
pub use error::{EntityKind, SimError};
pub use hierarchy::{Joint, Link, Model, PendingSlot};
pub use world::{EVENT_LOG_CAPACITY, EntityRef, LinkSample, StepHook, World, WorldEvent};

pub fn crate_info() -> &'static str {
    "robosim-kernel v0.1.0"
}
