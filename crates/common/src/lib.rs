//! Shared value types for the robosim engine.
//!
//! # Invariants
//! - `Pose` orientation is a unit quaternion after every constructor and mutator.
//! - Entity ids are never reused within a world.

mod pose;
mod types;

pub use pose::Pose;
pub use types::{JointId, LinkId, ModelId, Twist, Vector3, Wrench};

/// Scoped-name separator used for nested entities (`outer::inner::link`).
pub const SCOPE_DELIMITER: &str = "::";

pub fn crate_info() -> &'static str {
    "robosim-common v0.1.0"
}

/// Join name segments into a scoped name.
pub fn scoped_name<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().collect::<Vec<_>>().join(SCOPE_DELIMITER)
}
