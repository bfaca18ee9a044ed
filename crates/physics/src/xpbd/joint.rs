use glam::{DQuat, DVec3};
use robosim_common::Wrench;

use super::body::{BodyState, angular_correction, positional_correction};
use crate::engine::{BodyHandle, ConstraintDesc, JointKind, JointState};

/// Joint constraint with its attachment frames captured at creation.
///
/// All `*_parent` vectors are expressed in the parent's body frame, or in
/// world coordinates when the joint is anchored to the world.
#[derive(Debug, Clone)]
pub(crate) struct XpbdJoint {
    pub name: String,
    pub kind: JointKind,
    pub parent: Option<BodyHandle>,
    pub child: BodyHandle,
    pub anchor_parent: DVec3,
    pub anchor_child: DVec3,
    pub axis_parent: DVec3,
    pub axis_child: DVec3,
    /// Vector perpendicular to the axis used to measure hinge angles.
    pub ref_parent: DVec3,
    pub ref_child: DVec3,
    /// Child orientation relative to the parent at joint zero.
    pub rest: DQuat,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub damping: f64,
    pub effort: f64,
    pub state: JointState,
}

fn perpendicular(axis: DVec3) -> DVec3 {
    axis.any_orthonormal_vector()
}

impl XpbdJoint {
    pub fn new(desc: &ConstraintDesc, parent: Option<&BodyState>, child: &BodyState) -> Self {
        let axis = desc.axis.normalize_or(DVec3::Z);
        let reference = perpendicular(axis);
        let (to_parent, parent_q) = match parent {
            Some(p) => (p.q.inverse(), p.q),
            None => (DQuat::IDENTITY, DQuat::IDENTITY),
        };
        let parent_x = parent.map_or(DVec3::ZERO, |p| p.x);
        let to_child = child.q.inverse();
        Self {
            name: desc.name.clone(),
            kind: desc.kind,
            parent: desc.parent,
            child: desc.child,
            anchor_parent: to_parent * (desc.anchor - parent_x),
            anchor_child: to_child * (desc.anchor - child.x),
            axis_parent: to_parent * axis,
            axis_child: to_child * axis,
            ref_parent: to_parent * reference,
            ref_child: to_child * reference,
            rest: parent_q.inverse() * child.q,
            lower: desc.lower,
            upper: desc.upper,
            damping: desc.damping.max(0.0),
            effort: 0.0,
            state: JointState::default(),
        }
    }

    pub fn involves(&self, body: BodyHandle) -> bool {
        self.child == body || self.parent == Some(body)
    }
}

/// A joint resolved against the dense body array for one step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JointRow {
    /// Position of this row in the step's row list.
    pub slot: usize,
    pub parent: Option<usize>,
    pub child: usize,
}

fn frame(bodies: &[BodyState], idx: Option<usize>) -> (DVec3, DQuat) {
    match idx {
        Some(i) => (bodies[i].x, bodies[i].q),
        None => (DVec3::ZERO, DQuat::IDENTITY),
    }
}

fn angular_velocity(bodies: &[BodyState], idx: Option<usize>) -> DVec3 {
    idx.map_or(DVec3::ZERO, |i| bodies[i].w)
}

fn wrap_angle(a: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let mut r = a.rem_euclid(two_pi);
    if r > std::f64::consts::PI {
        r -= two_pi;
    }
    r
}

/// Hinge angle in (-pi, pi] of the child about the parent axis.
fn hinge_angle(joint: &XpbdJoint, bodies: &[BodyState], row: JointRow) -> f64 {
    let (_, qp) = frame(bodies, row.parent);
    let qc = bodies[row.child].q;
    let a1 = qp * joint.axis_parent;
    let b1 = qp * joint.ref_parent;
    let b2 = qc * joint.ref_child;
    b1.cross(b2).dot(a1).atan2(b1.dot(b2))
}

/// Rotation the child still needs to match the parent's rest orientation,
/// as a rotation vector.
fn orientation_error(joint: &XpbdJoint, bodies: &[BodyState], row: JointRow) -> DVec3 {
    let (_, qp) = frame(bodies, row.parent);
    let qc = bodies[row.child].q;
    let mut e = (qp * joint.rest) * qc.inverse();
    if e.w < 0.0 {
        e = -e;
    }
    DVec3::new(e.x, e.y, e.z) * 2.0
}

fn limit_excess(value: f64, lower: Option<f64>, upper: Option<f64>) -> f64 {
    if let Some(lo) = lower {
        if value < lo {
            return value - lo;
        }
    }
    if let Some(hi) = upper {
        if value > hi {
            return value - hi;
        }
    }
    0.0
}

/// One projection pass over a joint's position-level constraints.
pub(crate) fn solve_joint(joint: &XpbdJoint, bodies: &mut [BodyState], row: JointRow) {
    let (p, c, via) = (row.parent, Some(row.child), Some(row.slot));

    match joint.kind {
        JointKind::Revolute => {
            let (_, qp) = frame(bodies, p);
            let a1 = qp * joint.axis_parent;
            let a2 = bodies[row.child].q * joint.axis_child;
            angular_correction(bodies, p, c, a1.cross(a2), via);

            if joint.lower.is_some() || joint.upper.is_some() {
                let theta = hinge_angle(joint, bodies, row);
                let excess = limit_excess(theta, joint.lower, joint.upper);
                if excess != 0.0 {
                    let (_, qp) = frame(bodies, p);
                    angular_correction(bodies, p, c, qp * joint.axis_parent * excess, via);
                }
            }
        }
        JointKind::Prismatic | JointKind::Fixed => {
            let e = orientation_error(joint, bodies, row);
            angular_correction(bodies, p, c, -e, via);
        }
        JointKind::Ball => {}
    }

    // The turn made by the first pass leaves a second-order anchor error.
    solve_anchor(joint, bodies, row);
    solve_anchor(joint, bodies, row);
}

fn solve_anchor(joint: &XpbdJoint, bodies: &mut [BodyState], row: JointRow) {
    let p = row.parent;
    let (xp, qp) = frame(bodies, p);
    let anchor_p = xp + qp * joint.anchor_parent;
    let anchor_c = bodies[row.child].point(joint.anchor_child);
    let d = anchor_c - anchor_p;
    let dx = match joint.kind {
        JointKind::Prismatic => {
            let axis = qp * joint.axis_parent;
            let along = d.dot(axis);
            let excess = limit_excess(along, joint.lower, joint.upper);
            d - axis * (along - excess)
        }
        _ => d,
    };
    let arm_p = anchor_p - xp;
    let arm_c = anchor_c - bodies[row.child].x;
    positional_correction(bodies, p, Some(row.child), arm_p, arm_c, dx, Some(row.slot));
}

/// Loads produced by joint damping and applied effort, as
/// `(parent wrench, child wrench)`.
pub(crate) fn joint_loads(joint: &XpbdJoint, bodies: &[BodyState], row: JointRow) -> (Wrench, Wrench) {
    let (_, qp) = frame(bodies, row.parent);
    let child = &bodies[row.child];
    let rel_w = child.w - angular_velocity(bodies, row.parent);
    match joint.kind {
        JointKind::Revolute => {
            let axis = qp * joint.axis_parent;
            let torque = axis * (joint.effort - joint.damping * rel_w.dot(axis));
            (Wrench::new(DVec3::ZERO, -torque), Wrench::new(DVec3::ZERO, torque))
        }
        JointKind::Prismatic => {
            let axis = qp * joint.axis_parent;
            let vp = row.parent.map_or(DVec3::ZERO, |i| bodies[i].v);
            let rel_v = child.v - vp;
            let force = axis * (joint.effort - joint.damping * rel_v.dot(axis));
            (Wrench::new(-force, DVec3::ZERO), Wrench::new(force, DVec3::ZERO))
        }
        JointKind::Ball => {
            let torque = -rel_w * joint.damping;
            (Wrench::new(DVec3::ZERO, -torque), Wrench::new(DVec3::ZERO, torque))
        }
        JointKind::Fixed => (Wrench::ZERO, Wrench::ZERO),
    }
}

/// Measure the generalized state of a joint from body states.
///
/// Hinge angles are unwrapped against `previous` so positions stay
/// continuous past +-pi.
pub(crate) fn measure(joint: &XpbdJoint, bodies: &[BodyState], row: JointRow, previous: f64) -> JointState {
    let (xp, qp) = frame(bodies, row.parent);
    let child = &bodies[row.child];
    let rel_w = child.w - angular_velocity(bodies, row.parent);
    match joint.kind {
        JointKind::Revolute => {
            let theta = hinge_angle(joint, bodies, row);
            let position = previous + wrap_angle(theta - previous);
            JointState {
                position,
                velocity: rel_w.dot(qp * joint.axis_parent),
            }
        }
        JointKind::Prismatic => {
            let axis = qp * joint.axis_parent;
            let anchor_p = xp + qp * joint.anchor_parent;
            let d = child.point(joint.anchor_child) - anchor_p;
            let vp = row.parent.map_or(DVec3::ZERO, |i| bodies[i].v);
            JointState {
                position: d.dot(axis),
                velocity: (child.v - vp).dot(axis),
            }
        }
        JointKind::Ball => {
            let rel = (qp * joint.rest).inverse() * child.q;
            JointState {
                position: 2.0 * rel.w.abs().min(1.0).acos(),
                velocity: rel_w.length(),
            }
        }
        JointKind::Fixed => JointState::default(),
    }
}
