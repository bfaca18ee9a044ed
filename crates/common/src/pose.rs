use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Mul;

/// Rigid transform: position plus orientation.
///
/// The orientation is private so that it can only be changed through methods
/// that re-normalize it. A zero or non-finite quaternion collapses to identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PoseRepr", into = "PoseRepr")]
pub struct Pose {
    pub position: DVec3,
    rotation: DQuat,
}

/// Serialized form. Deserialization goes through `From` so the stored
/// quaternion is always normalized. Hand-written files may give `rpy`
/// instead of a quaternion; it wins when both are present.
#[derive(Serialize, Deserialize)]
struct PoseRepr {
    #[serde(default)]
    position: DVec3,
    #[serde(default = "identity")]
    rotation: DQuat,
    #[serde(default, skip_serializing)]
    rpy: Option<DVec3>,
}

fn identity() -> DQuat {
    DQuat::IDENTITY
}

impl From<PoseRepr> for Pose {
    fn from(repr: PoseRepr) -> Self {
        match repr.rpy {
            Some(rpy) => Pose::from_xyz_rpy(repr.position, rpy),
            None => Pose::new(repr.position, repr.rotation),
        }
    }
}

impl From<Pose> for PoseRepr {
    fn from(pose: Pose) -> Self {
        PoseRepr {
            position: pose.position,
            rotation: pose.rotation,
            rpy: None,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn normalized(q: DQuat) -> DQuat {
    let len = q.length();
    if len.is_finite() && len > f64::EPSILON {
        q / len
    } else {
        DQuat::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    pub fn new(position: DVec3, rotation: DQuat) -> Self {
        Self {
            position,
            rotation: normalized(rotation),
        }
    }

    pub fn from_position(position: DVec3) -> Self {
        Self {
            position,
            rotation: DQuat::IDENTITY,
        }
    }

    /// Build from position and roll/pitch/yaw (`R = Rz(yaw) * Ry(pitch) * Rx(roll)`).
    pub fn from_xyz_rpy(position: DVec3, rpy: DVec3) -> Self {
        Self::new(position, quat_from_rpy(rpy))
    }

    pub fn rotation(&self) -> DQuat {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: DQuat) {
        self.rotation = normalized(rotation);
    }

    /// Roll, pitch, yaw of the orientation.
    pub fn rpy(&self) -> DVec3 {
        quat_to_rpy(self.rotation)
    }

    pub fn inverse(&self) -> Self {
        let inv = self.rotation.conjugate();
        Self {
            position: -(inv * self.position),
            rotation: inv,
        }
    }

    /// Map a point expressed in this frame into the parent frame.
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.position + self.rotation * point
    }

    /// Rotate a direction expressed in this frame into the parent frame.
    pub fn rotate_vector(&self, v: DVec3) -> DVec3 {
        self.rotation * v
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }
}

impl Mul for Pose {
    type Output = Pose;

    /// `a * b` is `b` expressed in `a`'s parent frame.
    fn mul(self, rhs: Pose) -> Pose {
        Pose::new(
            self.position + self.rotation * rhs.position,
            self.rotation * rhs.rotation,
        )
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.position;
        let r = self.rpy();
        write!(
            f,
            "[{:.4} {:.4} {:.4} | {:.4} {:.4} {:.4}]",
            p.x, p.y, p.z, r.x, r.y, r.z
        )
    }
}

fn quat_from_rpy(rpy: DVec3) -> DQuat {
    DQuat::from_rotation_z(rpy.z) * DQuat::from_rotation_y(rpy.y) * DQuat::from_rotation_x(rpy.x)
}

fn quat_to_rpy(q: DQuat) -> DVec3 {
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    DVec3::new(roll, pitch, yaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_is_identity() {
        let p = Pose::default();
        assert_eq!(p.position, DVec3::ZERO);
        assert_eq!(p.rotation(), DQuat::IDENTITY);
    }

    #[test]
    fn constructor_normalizes() {
        let p = Pose::new(DVec3::ZERO, DQuat::from_xyzw(0.0, 0.0, 2.0, 2.0));
        assert_abs_diff_eq!(p.rotation().length(), 1.0, epsilon = 1e-12);

        let mut q = Pose::default();
        q.set_rotation(DQuat::from_xyzw(0.0, 0.0, 0.0, 0.0));
        assert_eq!(q.rotation(), DQuat::IDENTITY);
    }

    #[test]
    fn rpy_roundtrip() {
        let rpy = DVec3::new(0.3, -0.4, 1.2);
        let p = Pose::from_xyz_rpy(DVec3::ZERO, rpy);
        let back = p.rpy();
        assert_abs_diff_eq!(back.x, rpy.x, epsilon = 1e-12);
        assert_abs_diff_eq!(back.y, rpy.y, epsilon = 1e-12);
        assert_abs_diff_eq!(back.z, rpy.z, epsilon = 1e-12);
    }

    #[test]
    fn pure_roll_has_no_pitch_or_yaw() {
        let p = Pose::new(DVec3::ZERO, DQuat::from_rotation_x(2.5));
        let rpy = p.rpy();
        assert_abs_diff_eq!(rpy.x, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(rpy.y, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rpy.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let a = Pose::from_xyz_rpy(DVec3::new(1.0, 2.0, 3.0), DVec3::new(0.1, 0.2, 0.3));
        let c = a * a.inverse();
        assert_abs_diff_eq!(c.position.length(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.rotation().w.abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn transform_point_applies_rotation_then_translation() {
        let p = Pose::new(
            DVec3::new(1.0, 0.0, 0.0),
            DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2),
        );
        let out = p.transform_point(DVec3::X);
        assert_abs_diff_eq!(out.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn deserialization_normalizes() {
        let json = r#"{"position":[1.0,2.0,3.0],"rotation":[0.0,0.0,0.0,4.0]}"#;
        let p: Pose = serde_json::from_str(json).unwrap();
        assert_eq!(p.position, DVec3::new(1.0, 2.0, 3.0));
        assert_abs_diff_eq!(p.rotation().w, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_fields_default_to_identity() {
        let p: Pose = serde_json::from_str("{}").unwrap();
        assert_eq!(p, Pose::IDENTITY);
    }

    #[test]
    fn rpy_field_overrides_quaternion() {
        let json = r#"{"position":[0.0,0.0,1.0],"rpy":[0.5,0.0,0.0]}"#;
        let p: Pose = serde_json::from_str(json).unwrap();
        assert_abs_diff_eq!(p.rpy().x, 0.5, epsilon = 1e-12);
        let out = serde_json::to_string(&p).unwrap();
        assert!(!out.contains("rpy"));
    }
}
