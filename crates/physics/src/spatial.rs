//! 6D spatial vectors in world-origin Plücker coordinates.
//!
//! Motion vectors are `(angular, linear)` where the linear part is the
//! velocity of the body point currently at the world origin. Force vectors
//! are `(torque about the origin, force)`.

use glam::{DMat3, DVec3};
use robosim_common::Pose;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpatialMotion {
    pub angular: DVec3,
    pub linear: DVec3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpatialForce {
    pub torque: DVec3,
    pub force: DVec3,
}

impl SpatialMotion {
    pub const ZERO: Self = Self {
        angular: DVec3::ZERO,
        linear: DVec3::ZERO,
    };

    pub fn new(angular: DVec3, linear: DVec3) -> Self {
        Self { angular, linear }
    }

    /// Rotation about a world axis through `point`.
    pub fn revolute(axis: DVec3, point: DVec3) -> Self {
        Self::new(axis, point.cross(axis))
    }

    /// Pure translation along a world axis.
    pub fn prismatic(axis: DVec3) -> Self {
        Self::new(DVec3::ZERO, axis)
    }

    /// Linear velocity of the body point located at `point`.
    pub fn point_velocity(&self, point: DVec3) -> DVec3 {
        self.linear + self.angular.cross(point)
    }

    /// Spatial motion cross product `self ×m other`.
    pub fn cross_motion(&self, other: &SpatialMotion) -> SpatialMotion {
        SpatialMotion {
            angular: self.angular.cross(other.angular),
            linear: self.angular.cross(other.linear) + self.linear.cross(other.angular),
        }
    }

    /// Spatial force cross product `self ×* f`.
    pub fn cross_force(&self, f: &SpatialForce) -> SpatialForce {
        SpatialForce {
            torque: self.angular.cross(f.torque) + self.linear.cross(f.force),
            force: self.angular.cross(f.force),
        }
    }

    /// Power pairing with a force vector.
    pub fn dot(&self, f: &SpatialForce) -> f64 {
        self.angular.dot(f.torque) + self.linear.dot(f.force)
    }

    pub fn is_finite(&self) -> bool {
        self.angular.is_finite() && self.linear.is_finite()
    }
}

impl SpatialForce {
    pub const ZERO: Self = Self {
        torque: DVec3::ZERO,
        force: DVec3::ZERO,
    };

    pub fn new(torque: DVec3, force: DVec3) -> Self {
        Self { torque, force }
    }

    /// A force acting at a world point.
    pub fn at_point(force: DVec3, point: DVec3) -> Self {
        Self::new(point.cross(force), force)
    }

    pub fn pure_torque(torque: DVec3) -> Self {
        Self::new(torque, DVec3::ZERO)
    }
}

macro_rules! spatial_ops {
    ($ty:ident, $a:ident, $b:ident) => {
        impl Add for $ty {
            type Output = $ty;
            fn add(self, rhs: $ty) -> $ty {
                $ty {
                    $a: self.$a + rhs.$a,
                    $b: self.$b + rhs.$b,
                }
            }
        }

        impl AddAssign for $ty {
            fn add_assign(&mut self, rhs: $ty) {
                self.$a += rhs.$a;
                self.$b += rhs.$b;
            }
        }

        impl Sub for $ty {
            type Output = $ty;
            fn sub(self, rhs: $ty) -> $ty {
                $ty {
                    $a: self.$a - rhs.$a,
                    $b: self.$b - rhs.$b,
                }
            }
        }

        impl Neg for $ty {
            type Output = $ty;
            fn neg(self) -> $ty {
                $ty {
                    $a: -self.$a,
                    $b: -self.$b,
                }
            }
        }

        impl Mul<f64> for $ty {
            type Output = $ty;
            fn mul(self, s: f64) -> $ty {
                $ty {
                    $a: self.$a * s,
                    $b: self.$b * s,
                }
            }
        }
    };
}

spatial_ops!(SpatialMotion, angular, linear);
spatial_ops!(SpatialForce, torque, force);

/// Rigid-body inertia expressed about the world origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialInertia {
    pub mass: f64,
    /// First moment of mass, `m * c`.
    pub first_moment: DVec3,
    /// Rotational inertia about the world origin.
    pub rotational: DMat3,
}

impl SpatialInertia {
    pub const ZERO: Self = Self {
        mass: 0.0,
        first_moment: DVec3::ZERO,
        rotational: DMat3::ZERO,
    };

    /// Inertia of a body whose center of mass sits at `pose` with
    /// body-frame inertia `inertia_com`.
    pub fn from_body(mass: f64, inertia_com: DMat3, pose: &Pose) -> Self {
        let r = DMat3::from_quat(pose.rotation());
        let c = pose.position;
        let parallel = DMat3::from_diagonal(DVec3::splat(c.dot(c))) - outer(c, c);
        Self {
            mass,
            first_moment: c * mass,
            rotational: r * inertia_com * r.transpose() + parallel * mass,
        }
    }

    /// `I * v`, the momentum of a body moving with `v`.
    pub fn mul_motion(&self, v: &SpatialMotion) -> SpatialForce {
        SpatialForce {
            torque: self.rotational * v.angular + self.first_moment.cross(v.linear),
            force: v.linear * self.mass - self.first_moment.cross(v.angular),
        }
    }
}

impl Add for SpatialInertia {
    type Output = SpatialInertia;

    fn add(self, rhs: SpatialInertia) -> SpatialInertia {
        SpatialInertia {
            mass: self.mass + rhs.mass,
            first_moment: self.first_moment + rhs.first_moment,
            rotational: self.rotational + rhs.rotational,
        }
    }
}

impl AddAssign for SpatialInertia {
    fn add_assign(&mut self, rhs: SpatialInertia) {
        *self = *self + rhs;
    }
}

fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn point_mass_momentum_matches_particle() {
        let pose = Pose::from_position(DVec3::new(1.0, 0.0, 0.0));
        let inertia = SpatialInertia::from_body(2.0, DMat3::ZERO, &pose);
        // Spin about z through the origin: the particle moves at +y.
        let v = SpatialMotion::revolute(DVec3::Z, DVec3::ZERO);
        let h = inertia.mul_motion(&v);
        assert_abs_diff_eq!(h.force.y, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(h.torque.z, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn revolute_motion_is_zero_on_axis() {
        let point = DVec3::new(0.0, 1.0, 2.0);
        let s = SpatialMotion::revolute(DVec3::X, point);
        assert_abs_diff_eq!(s.point_velocity(point).length(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            s.point_velocity(point + DVec3::Y).z,
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn force_at_point_has_moment() {
        let f = SpatialForce::at_point(DVec3::Z, DVec3::X);
        assert_eq!(f.torque, -DVec3::Y);
        let v = SpatialMotion::revolute(DVec3::Y, DVec3::ZERO);
        // Rotating about +y moves the point at +x toward -z.
        assert_abs_diff_eq!(v.dot(&f), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn cross_products_are_dual() {
        let v = SpatialMotion::new(DVec3::new(0.1, 0.2, 0.3), DVec3::new(-1.0, 0.5, 2.0));
        let m = SpatialMotion::new(DVec3::new(1.0, -0.4, 0.0), DVec3::new(0.3, 0.3, -0.7));
        let f = SpatialForce::new(DVec3::new(0.2, 0.0, 1.0), DVec3::new(4.0, -1.0, 0.5));
        // (v ×m m) · f == -m · (v ×* f)
        let lhs = v.cross_motion(&m).dot(&f);
        let rhs = -m.dot(&v.cross_force(&f));
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }
}
