use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Three-component vector used for positions, velocities, forces and gravity.
pub type Vector3 = DVec3;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a model in a world's entity arena.
    ModelId,
    "model"
);
entity_id!(
    /// Identifier of a link in a world's entity arena.
    LinkId,
    "link"
);
entity_id!(
    /// Identifier of a joint in a world's entity arena.
    JointId,
    "joint"
);

/// Linear and angular velocity of a rigid body, both in world coordinates.
///
/// The linear part is the velocity of the body's center of mass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub linear: Vector3,
    pub angular: Vector3,
}

impl Twist {
    pub const ZERO: Self = Self {
        linear: DVec3::ZERO,
        angular: DVec3::ZERO,
    };

    pub fn new(linear: Vector3, angular: Vector3) -> Self {
        Self { linear, angular }
    }

    pub fn is_finite(&self) -> bool {
        self.linear.is_finite() && self.angular.is_finite()
    }
}

/// Force and torque applied to a rigid body, both in world coordinates.
///
/// The force acts at the body's center of mass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Wrench {
    pub force: Vector3,
    pub torque: Vector3,
}

impl Wrench {
    pub const ZERO: Self = Self {
        force: DVec3::ZERO,
        torque: DVec3::ZERO,
    };

    pub fn new(force: Vector3, torque: Vector3) -> Self {
        Self { force, torque }
    }

    pub fn is_zero(&self) -> bool {
        self.force == DVec3::ZERO && self.torque == DVec3::ZERO
    }
}

impl Add for Wrench {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            force: self.force + rhs.force,
            torque: self.torque + rhs.torque,
        }
    }
}

impl AddAssign for Wrench {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
