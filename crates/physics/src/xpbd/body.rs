use glam::{DMat3, DQuat, DVec3};
use robosim_common::{Pose, Twist, Wrench};

use crate::engine::{BodyDesc, BodyKind};
use crate::collision::ShapeDesc;

/// Persistent per-body record owned by the engine.
#[derive(Debug, Clone)]
pub(crate) struct XpbdBody {
    pub name: String,
    pub state: BodyState,
    pub shapes: Vec<ShapeDesc>,
    pub collision_group: Option<u32>,
    pub self_collide: bool,
    /// External wrench accumulated for the next step.
    pub wrench: Wrench,
}

impl XpbdBody {
    pub fn from_desc(desc: &BodyDesc) -> Self {
        Self {
            name: desc.name.clone(),
            state: BodyState::from_desc(desc),
            shapes: desc.shapes.clone(),
            collision_group: desc.collision_group,
            self_collide: desc.self_collide,
            wrench: Wrench::ZERO,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.state.x, self.state.q)
    }

    pub fn twist(&self) -> Twist {
        Twist::new(self.state.v, self.state.w)
    }
}

/// How a body answers corrections from constraints other than its mount.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum Mobility {
    #[default]
    Free,
    /// Mounted on static geometry by the revolute joint in row `mount`: it
    /// can only turn about `axis` through `pivot`.
    Hinged { mount: usize, pivot: DVec3, axis: DVec3 },
}

/// Dense, copyable solver state of one body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BodyState {
    pub x: DVec3,
    pub q: DQuat,
    pub v: DVec3,
    pub w: DVec3,
    pub prev_x: DVec3,
    pub prev_q: DQuat,
    pub inv_mass: f64,
    pub inertia: DMat3,
    pub inv_inertia: DMat3,
    pub dynamic: bool,
    pub gravity: bool,
    pub linear_damping: f64,
    pub angular_damping: f64,
    pub mobility: Mobility,
}

impl BodyState {
    fn from_desc(desc: &BodyDesc) -> Self {
        let dynamic = desc.kind == BodyKind::Dynamic && desc.mass > 0.0;
        let inv_inertia = if dynamic {
            desc.inertia.inverse()
        } else {
            DMat3::ZERO
        };
        let x = desc.pose.position;
        let q = desc.pose.rotation();
        Self {
            x,
            q,
            v: if dynamic { desc.twist.linear } else { DVec3::ZERO },
            w: if dynamic { desc.twist.angular } else { DVec3::ZERO },
            prev_x: x,
            prev_q: q,
            inv_mass: if dynamic { 1.0 / desc.mass } else { 0.0 },
            inertia: desc.inertia,
            inv_inertia: if inv_inertia.is_finite() { inv_inertia } else { DMat3::ZERO },
            dynamic,
            gravity: desc.gravity,
            linear_damping: desc.linear_damping.max(0.0),
            angular_damping: desc.angular_damping.max(0.0),
            mobility: Mobility::Free,
        }
    }

    fn rotation_matrix(&self) -> DMat3 {
        DMat3::from_quat(self.q)
    }

    pub fn inv_inertia_world(&self) -> DMat3 {
        let r = self.rotation_matrix();
        r * self.inv_inertia * r.transpose()
    }

    pub fn inertia_world(&self) -> DMat3 {
        let r = self.rotation_matrix();
        r * self.inertia * r.transpose()
    }

    /// World-space offset of a body-local point from the center of mass.
    pub fn arm(&self, local: DVec3) -> DVec3 {
        self.q * local
    }

    pub fn point(&self, local: DVec3) -> DVec3 {
        self.x + self.q * local
    }

    pub fn prev_point(&self, local: DVec3) -> DVec3 {
        self.prev_x + self.prev_q * local
    }

    pub fn point_velocity(&self, arm: DVec3) -> DVec3 {
        self.v + self.w.cross(arm)
    }

    /// Inverse mass seen by a correction along `n` applied at `arm`.
    pub fn generalized_inverse_mass(&self, arm: DVec3, n: DVec3) -> f64 {
        if !self.dynamic {
            return 0.0;
        }
        let rn = arm.cross(n);
        self.inv_mass + rn.dot(self.inv_inertia_world() * rn)
    }

    /// Inverse inertia seen by a rotation about `n`.
    pub fn angular_inverse_mass(&self, n: DVec3) -> f64 {
        if !self.dynamic {
            return 0.0;
        }
        n.dot(self.inv_inertia_world() * n)
    }

    /// Rotate by the rotation vector `dtheta`.
    pub fn rotate(&mut self, dtheta: DVec3) {
        self.q = (DQuat::from_scaled_axis(dtheta) * self.q).normalize();
    }

    /// Rotate by `dtheta` about a world point, carrying the center of mass.
    fn turn_about(&mut self, pivot: DVec3, dtheta: DVec3) {
        let r = DQuat::from_scaled_axis(dtheta);
        self.x = pivot + r * (self.x - pivot);
        self.q = (r * self.q).normalize();
    }

    /// Pivot and axis of the mount, unless `row` is the mount itself.
    fn hinge(&self, row: Option<usize>) -> Option<(DVec3, DVec3)> {
        match self.mobility {
            Mobility::Hinged { mount, pivot, axis } if row != Some(mount) => Some((pivot, axis)),
            _ => None,
        }
    }

    /// Moment of inertia about the hinge line.
    fn hinge_inertia(&self, pivot: DVec3, axis: DVec3) -> f64 {
        let r = self.x - pivot;
        let off_axis = r - axis * r.dot(axis);
        axis.dot(self.inertia_world() * axis) + off_axis.length_squared() / self.inv_mass
    }

    /// Inverse mass seen by the constraint in `row` correcting along `n` at
    /// `arm`. Hinged bodies answer only with a turn about their hinge.
    pub fn effective_inverse_mass(&self, arm: DVec3, n: DVec3, row: Option<usize>) -> f64 {
        match self.hinge(row) {
            Some((pivot, axis)) => {
                let k = (self.x + arm - pivot).cross(n).dot(axis);
                k * k / self.hinge_inertia(pivot, axis)
            }
            None => self.generalized_inverse_mass(arm, n),
        }
    }

    pub fn effective_angular_inverse_mass(&self, n: DVec3, row: Option<usize>) -> f64 {
        match self.hinge(row) {
            Some((pivot, axis)) => {
                let k = n.dot(axis);
                k * k / self.hinge_inertia(pivot, axis)
            }
            None => self.angular_inverse_mass(n),
        }
    }

    /// Apply a positional impulse `p` at `arm` on behalf of `row`.
    pub fn apply_positional(&mut self, p: DVec3, arm: DVec3, row: Option<usize>) {
        if !self.dynamic {
            return;
        }
        if let Some((pivot, axis)) = self.hinge(row) {
            let turn = (self.x + arm - pivot).cross(p).dot(axis) / self.hinge_inertia(pivot, axis);
            self.turn_about(pivot, axis * turn);
            return;
        }
        self.x += p * self.inv_mass;
        let dtheta = self.inv_inertia_world() * arm.cross(p);
        self.rotate(dtheta);
    }

    pub fn apply_angular(&mut self, p: DVec3, row: Option<usize>) {
        if !self.dynamic {
            return;
        }
        if let Some((pivot, axis)) = self.hinge(row) {
            let turn = p.dot(axis) / self.hinge_inertia(pivot, axis);
            self.turn_about(pivot, axis * turn);
            return;
        }
        let dtheta = self.inv_inertia_world() * p;
        self.rotate(dtheta);
    }

    /// Apply a velocity impulse `p` at `arm`.
    pub fn apply_impulse(&mut self, p: DVec3, arm: DVec3) {
        if !self.dynamic {
            return;
        }
        self.v += p * self.inv_mass;
        self.w += self.inv_inertia_world() * arm.cross(p);
    }

    /// Explicit integration of external loads over one sub-step.
    pub fn integrate(&mut self, h: f64, gravity: DVec3, load: Wrench) {
        self.prev_x = self.x;
        self.prev_q = self.q;
        if !self.dynamic {
            return;
        }

        let mut accel = load.force * self.inv_mass;
        if self.gravity {
            accel += gravity;
        }
        self.v += accel * h;

        let inertia = self.inertia_world();
        let gyro = self.w.cross(inertia * self.w);
        self.w += self.inv_inertia_world() * (load.torque - gyro) * h;

        self.v /= 1.0 + h * self.linear_damping;
        self.w /= 1.0 + h * self.angular_damping;

        self.x += self.v * h;
        self.rotate(self.w * h);
    }

    /// Derive velocities from the positional change of this sub-step.
    pub fn update_velocity(&mut self, h: f64) {
        if !self.dynamic {
            return;
        }
        self.v = (self.x - self.prev_x) / h;
        let mut dq = self.q * self.prev_q.inverse();
        if dq.w < 0.0 {
            dq = -dq;
        }
        self.w = dq.to_scaled_axis() / h;
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.q.is_finite() && self.v.is_finite() && self.w.is_finite()
    }
}

/// Positional correction between two bodies (`None` is the fixed world).
///
/// `dx` is how far the point on `a` must move relative to the point on `b`.
/// `row` is the joint row asking, `None` for contacts.
/// Returns the Lagrange multiplier of the correction.
pub(crate) fn positional_correction(
    bodies: &mut [BodyState],
    a: Option<usize>,
    b: Option<usize>,
    arm_a: DVec3,
    arm_b: DVec3,
    dx: DVec3,
    row: Option<usize>,
) -> f64 {
    let c = dx.length();
    if c < 1e-12 {
        return 0.0;
    }
    let n = dx / c;
    let wa = a.map_or(0.0, |i| bodies[i].effective_inverse_mass(arm_a, n, row));
    let wb = b.map_or(0.0, |i| bodies[i].effective_inverse_mass(arm_b, n, row));
    let w = wa + wb;
    if w <= 1e-12 {
        return 0.0;
    }
    let lambda = c / w;
    let p = n * lambda;
    if let Some(i) = a {
        bodies[i].apply_positional(p, arm_a, row);
    }
    if let Some(i) = b {
        bodies[i].apply_positional(-p, arm_b, row);
    }
    lambda
}

/// Rotational correction: `a` turns by `dtheta` relative to `b`.
pub(crate) fn angular_correction(
    bodies: &mut [BodyState],
    a: Option<usize>,
    b: Option<usize>,
    dtheta: DVec3,
    row: Option<usize>,
) {
    let c = dtheta.length();
    if c < 1e-12 {
        return;
    }
    let n = dtheta / c;
    let wa = a.map_or(0.0, |i| bodies[i].effective_angular_inverse_mass(n, row));
    let wb = b.map_or(0.0, |i| bodies[i].effective_angular_inverse_mass(n, row));
    let w = wa + wb;
    if w <= 1e-12 {
        return;
    }
    let p = n * (c / w);
    if let Some(i) = a {
        bodies[i].apply_angular(p, row);
    }
    if let Some(i) = b {
        bodies[i].apply_angular(-p, row);
    }
}

/// Velocity impulse that changes the relative velocity of `a` w.r.t. `b`
/// at the given arms by `dv`.
pub(crate) fn velocity_correction(
    bodies: &mut [BodyState],
    a: usize,
    b: usize,
    arm_a: DVec3,
    arm_b: DVec3,
    dv: DVec3,
) {
    let c = dv.length();
    if c < 1e-12 {
        return;
    }
    let n = dv / c;
    let w = bodies[a].generalized_inverse_mass(arm_a, n) + bodies[b].generalized_inverse_mass(arm_b, n);
    if w <= 1e-12 {
        return;
    }
    let p = n * (c / w);
    bodies[a].apply_impulse(p, arm_a);
    bodies[b].apply_impulse(-p, arm_b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn unit_body(x: DVec3) -> BodyState {
        BodyState::from_desc(&BodyDesc::new("b", Pose::from_position(x), 1.0, DMat3::IDENTITY))
    }

    #[test]
    fn free_fall_substep() {
        let mut b = unit_body(DVec3::ZERO);
        b.integrate(0.01, DVec3::new(0.0, 0.0, -10.0), Wrench::ZERO);
        assert_abs_diff_eq!(b.v.z, -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(b.x.z, -0.001, epsilon = 1e-12);
        b.update_velocity(0.01);
        assert_abs_diff_eq!(b.v.z, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn static_bodies_do_not_move() {
        let mut b = BodyState::from_desc(&BodyDesc::fixed("ground", Pose::IDENTITY));
        b.integrate(0.01, DVec3::new(0.0, 0.0, -10.0), Wrench::ZERO);
        b.apply_positional(DVec3::ONE, DVec3::X, None);
        assert_eq!(b.x, DVec3::ZERO);
        assert_eq!(b.generalized_inverse_mass(DVec3::X, DVec3::Z), 0.0);
    }

    #[test]
    fn correction_against_world_moves_only_the_body() {
        let mut bodies = [unit_body(DVec3::ZERO)];
        let lambda = positional_correction(
            &mut bodies,
            Some(0),
            None,
            DVec3::ZERO,
            DVec3::ZERO,
            DVec3::new(0.0, 0.0, 0.5),
            None,
        );
        assert_abs_diff_eq!(lambda, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(bodies[0].x.z, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn equal_bodies_split_a_correction() {
        let mut bodies = [unit_body(DVec3::ZERO), unit_body(DVec3::X)];
        positional_correction(
            &mut bodies,
            Some(0),
            Some(1),
            DVec3::ZERO,
            DVec3::ZERO,
            DVec3::new(0.2, 0.0, 0.0),
            None,
        );
        assert_abs_diff_eq!(bodies[0].x.x, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(bodies[1].x.x, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn angular_velocity_from_rotation_delta() {
        let mut b = unit_body(DVec3::ZERO);
        b.prev_q = DQuat::IDENTITY;
        b.q = DQuat::from_rotation_z(0.001);
        b.prev_x = b.x;
        b.update_velocity(0.001);
        assert_abs_diff_eq!(b.w.z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn large_corrections_rotate_exactly() {
        let mut b = unit_body(DVec3::ZERO);
        b.rotate(DVec3::Z * std::f64::consts::FRAC_PI_2);
        let turned = b.q * DVec3::X;
        assert_abs_diff_eq!(turned.y, 1.0, epsilon = 1e-12);
        b.prev_q = DQuat::IDENTITY;
        b.update_velocity(0.5);
        assert_abs_diff_eq!(b.w.z, std::f64::consts::PI, epsilon = 1e-9);
    }

    fn hinged_rod() -> BodyState {
        // Unit rod along +y, hinged to the world about x at the origin.
        let mut rod = unit_body(DVec3::new(0.0, 0.5, 0.0));
        rod.mobility = Mobility::Hinged {
            mount: 0,
            pivot: DVec3::ZERO,
            axis: DVec3::X,
        };
        rod
    }

    #[test]
    fn hinged_body_turns_about_its_pivot() {
        let mut bodies = [hinged_rod()];
        let tip = DVec3::new(0.0, 1.0, 0.0);
        let arm = tip - bodies[0].x;
        positional_correction(&mut bodies, Some(0), None, arm, DVec3::ZERO, DVec3::Z * 0.01, Some(1));

        let rod = &bodies[0];
        assert_abs_diff_eq!(rod.point(DVec3::new(0.0, -0.5, 0.0)).length(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rod.point(DVec3::new(0.0, 0.5, 0.0)).z, 0.01, epsilon = 1e-4);
        assert_abs_diff_eq!((rod.q * DVec3::X).x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn hinged_body_ignores_off_axis_twists() {
        let mut bodies = [hinged_rod(), unit_body(DVec3::new(0.0, 1.0, 0.0))];
        angular_correction(&mut bodies, Some(1), Some(0), DVec3::Y * 0.1, Some(1));
        assert_eq!(bodies[0].q, DQuat::IDENTITY);
        assert_abs_diff_eq!((bodies[1].q * DVec3::Z).x, 0.1f64.sin(), epsilon = 1e-12);

        // The mount itself still sees the rod as a free body.
        assert!(bodies[0].effective_angular_inverse_mass(DVec3::Y, Some(0)) > 0.0);
    }
}
