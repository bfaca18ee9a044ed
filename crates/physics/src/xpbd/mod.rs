//! Substepped extended position-based dynamics (XPBD) back-end.
//!
//! Each engine step is split into `substeps` sub-steps. A sub-step
//! integrates velocities and positions explicitly, projects joint and
//! contact constraints on positions for `iterations` passes, derives
//! velocities from the positional change and finally applies restitution
//! and dynamic friction at the velocity level.

mod body;
mod joint;

use glam::{DQuat, DVec3};
use robosim_common::{Pose, Twist, Wrench};
use std::collections::BTreeMap;

use crate::collision::{self, Collider, Contact, mix_friction, mix_restitution};
use crate::engine::{
    BodyDesc, BodyHandle, ConstraintDesc, ConstraintHandle, EngineError, EngineParams,
    JointKind, JointState, PhysicsEngine,
};
use body::{BodyState, Mobility, XpbdBody, positional_correction, velocity_correction};
use joint::{JointRow, XpbdJoint};

/// Registry name of this back-end.
pub const XPBD: &str = "xpbd";

/// A contact point prepared for projection during one sub-step.
#[derive(Debug, Clone, Copy)]
struct ContactRow {
    a: usize,
    b: usize,
    local_a: DVec3,
    local_b: DVec3,
    normal: DVec3,
    friction: f64,
    restitution: f64,
    /// Approach speed along the normal when the contact was detected.
    approach: f64,
    lambda_n: f64,
}

#[derive(Debug, Default)]
pub struct XpbdEngine {
    params: EngineParams,
    bodies: BTreeMap<BodyHandle, XpbdBody>,
    joints: BTreeMap<ConstraintHandle, XpbdJoint>,
    next_body: u32,
    next_joint: u32,
    contacts: Vec<Contact>,
}

impl XpbdEngine {
    pub fn new(params: &EngineParams) -> Self {
        Self {
            params: params.clone(),
            ..Self::default()
        }
    }

    fn body(&self, h: BodyHandle) -> Result<&XpbdBody, EngineError> {
        self.bodies.get(&h).ok_or(EngineError::InvalidBodyHandle(h))
    }

    fn body_mut(&mut self, h: BodyHandle) -> Result<&mut XpbdBody, EngineError> {
        self.bodies.get_mut(&h).ok_or(EngineError::InvalidBodyHandle(h))
    }

    fn joint_mut(&mut self, h: ConstraintHandle) -> Result<&mut XpbdJoint, EngineError> {
        self.joints
            .get_mut(&h)
            .ok_or(EngineError::InvalidConstraintHandle(h))
    }

    fn substep(
        &self,
        states: &mut [BodyState],
        rows: &[(ConstraintHandle, JointRow)],
        index: &BTreeMap<BodyHandle, usize>,
        h: f64,
    ) -> Vec<Contact> {
        let gravity = self.params.gravity;

        // External and joint loads are constant over the sub-step.
        let mut loads: Vec<Wrench> = self.bodies.values().map(|b| b.wrench).collect();
        for (handle, row) in rows {
            let joint = &self.joints[handle];
            let (on_parent, on_child) = joint::joint_loads(joint, states, *row);
            if let Some(p) = row.parent {
                loads[p] += on_parent;
            }
            loads[row.child] += on_child;
        }
        for (state, load) in states.iter_mut().zip(&loads) {
            state.integrate(h, gravity, *load);
        }

        let contacts = self.detect(states);
        let mut contact_rows = self.contact_rows(&contacts, states, index);

        for _ in 0..self.params.solver.iterations.max(1) {
            for (handle, row) in rows {
                joint::solve_joint(&self.joints[handle], states, *row);
            }
            for c in contact_rows.iter_mut() {
                solve_contact(c, states);
            }
        }

        for state in states.iter_mut() {
            state.update_velocity(h);
        }
        for c in &contact_rows {
            solve_contact_velocity(c, states, gravity, h);
        }
        contacts
    }

    /// A dynamic body held to static geometry by exactly one revolute joint
    /// answers every other constraint by turning about that hinge.
    fn assign_mobility(&self, states: &mut [BodyState], rows: &[(ConstraintHandle, JointRow)]) {
        let mut mounts: Vec<Vec<usize>> = vec![Vec::new(); states.len()];
        for (_, row) in rows {
            let parent_dynamic = row.parent.is_some_and(|p| states[p].dynamic);
            let child_dynamic = states[row.child].dynamic;
            match (row.parent, parent_dynamic, child_dynamic) {
                (_, false, true) => mounts[row.child].push(row.slot),
                (Some(p), true, false) => mounts[p].push(row.slot),
                _ => {}
            }
        }
        for (i, slots) in mounts.iter().enumerate() {
            states[i].mobility = match slots.as_slice() {
                [slot] => {
                    let (handle, row) = &rows[*slot];
                    let joint = &self.joints[handle];
                    if joint.kind == JointKind::Revolute && row.child == i {
                        let (xp, qp) = row
                            .parent
                            .map_or((DVec3::ZERO, DQuat::IDENTITY), |p| (states[p].x, states[p].q));
                        Mobility::Hinged {
                            mount: *slot,
                            pivot: xp + qp * joint.anchor_parent,
                            axis: qp * joint.axis_parent,
                        }
                    } else {
                        Mobility::Free
                    }
                }
                _ => Mobility::Free,
            };
        }
    }

    fn detect(&self, states: &[BodyState]) -> Vec<Contact> {
        let colliders: Vec<Collider<'_>> = self
            .bodies
            .iter()
            .zip(states)
            .filter(|((_, b), _)| !b.shapes.is_empty())
            .map(|((h, b), s)| Collider {
                body: *h,
                pose: Pose::new(s.x, s.q),
                shapes: &b.shapes,
                group: b.collision_group,
                self_collide: b.self_collide,
                fixed: !s.dynamic,
            })
            .collect();
        collision::detect(&colliders)
    }

    fn contact_rows(
        &self,
        contacts: &[Contact],
        states: &[BodyState],
        index: &BTreeMap<BodyHandle, usize>,
    ) -> Vec<ContactRow> {
        let mut rows = Vec::new();
        for c in contacts {
            let (Some(&a), Some(&b)) = (index.get(&c.body_a), index.get(&c.body_b)) else {
                continue;
            };
            let sa = &self.bodies[&c.body_a].shapes[c.shape_a];
            let sb = &self.bodies[&c.body_b].shapes[c.shape_b];
            for p in &c.points {
                // Surface points of each body, half a depth from the midpoint.
                let on_a = p.position + p.normal * (0.5 * p.depth);
                let on_b = p.position - p.normal * (0.5 * p.depth);
                let (ba, bb) = (&states[a], &states[b]);
                let va = ba.point_velocity(on_a - ba.x);
                let vb = bb.point_velocity(on_b - bb.x);
                rows.push(ContactRow {
                    a,
                    b,
                    local_a: ba.q.inverse() * (on_a - ba.x),
                    local_b: bb.q.inverse() * (on_b - bb.x),
                    normal: p.normal,
                    friction: mix_friction(sa.friction, sb.friction),
                    restitution: mix_restitution(sa.restitution, sb.restitution),
                    approach: (va - vb).dot(p.normal),
                    lambda_n: 0.0,
                });
            }
        }
        rows
    }
}

/// Normal and static-friction projection of one contact point.
fn solve_contact(c: &mut ContactRow, states: &mut [BodyState]) {
    let pa = states[c.a].point(c.local_a);
    let pb = states[c.b].point(c.local_b);
    let depth = (pa - pb).dot(c.normal);
    if depth <= 0.0 {
        return;
    }
    let arm_a = pa - states[c.a].x;
    let arm_b = pb - states[c.b].x;
    let lambda = positional_correction(
        states,
        Some(c.a),
        Some(c.b),
        arm_a,
        arm_b,
        -c.normal * depth,
        None,
    );
    c.lambda_n += lambda;

    // Static friction: undo tangential slip while the multiplier fits the cone.
    let (sa, sb) = (&states[c.a], &states[c.b]);
    let pa = sa.point(c.local_a);
    let pb = sb.point(c.local_b);
    let slip = (pa - sa.prev_point(c.local_a)) - (pb - sb.prev_point(c.local_b));
    let tangential = slip - c.normal * slip.dot(c.normal);
    let len = tangential.length();
    if len < 1e-12 {
        return;
    }
    let t = tangential / len;
    let arm_a = pa - sa.x;
    let arm_b = pb - sb.x;
    let w = sa.effective_inverse_mass(arm_a, t, None) + sb.effective_inverse_mass(arm_b, t, None);
    if w <= 1e-12 {
        return;
    }
    if len / w < c.friction * c.lambda_n {
        positional_correction(states, Some(c.a), Some(c.b), arm_a, arm_b, -tangential, None);
    }
}

/// Restitution and dynamic friction of one contact point.
fn solve_contact_velocity(c: &ContactRow, states: &mut [BodyState], gravity: DVec3, h: f64) {
    if c.lambda_n <= 0.0 {
        return;
    }
    let (sa, sb) = (&states[c.a], &states[c.b]);
    let arm_a = sa.arm(c.local_a);
    let arm_b = sb.arm(c.local_b);
    let rel = sa.point_velocity(arm_a) - sb.point_velocity(arm_b);
    let approach = rel.dot(c.normal);
    let tangential = rel - c.normal * approach;

    let mut dv = DVec3::ZERO;
    let vt = tangential.length();
    if vt > 1e-12 {
        let normal_force = c.lambda_n / (h * h);
        dv -= tangential / vt * (h * c.friction * normal_force).min(vt);
    }

    let restitution = if c.approach.abs() <= 2.0 * gravity.length() * h {
        0.0
    } else {
        c.restitution
    };
    let target = -(restitution * c.approach).max(0.0);
    dv += c.normal * (target - approach).min(0.0);

    velocity_correction(states, c.a, c.b, arm_a, arm_b, dv);
}

impl PhysicsEngine for XpbdEngine {
    fn kind(&self) -> &'static str {
        XPBD
    }

    fn init(&mut self, params: &EngineParams) {
        *self = Self::new(params);
    }

    fn step(&mut self, dt: f64) -> Result<(), EngineError> {
        let substeps = self.params.solver.substeps.max(1);
        let h = dt / f64::from(substeps);

        let index: BTreeMap<BodyHandle, usize> = self
            .bodies
            .keys()
            .enumerate()
            .map(|(i, h)| (*h, i))
            .collect();
        let mut states: Vec<BodyState> = self.bodies.values().map(|b| b.state).collect();
        let rows: Vec<(ConstraintHandle, JointRow)> = self
            .joints
            .iter()
            .filter_map(|(handle, j)| {
                let child = *index.get(&j.child)?;
                let parent = match j.parent {
                    Some(p) => Some(*index.get(&p)?),
                    None => None,
                };
                Some((*handle, parent, child))
            })
            .enumerate()
            .map(|(slot, (handle, parent, child))| (handle, JointRow { slot, parent, child }))
            .collect();
        self.assign_mobility(&mut states, &rows);

        let mut contacts = Vec::new();
        for _ in 0..substeps {
            contacts = self.substep(&mut states, &rows, &index, h);
        }

        let max_speed = self.params.solver.max_speed;
        for (body, state) in self.bodies.values().zip(&states) {
            if !state.is_finite() {
                return Err(EngineError::Diverged {
                    body: body.name.clone(),
                    detail: "non-finite state".into(),
                });
            }
            if state.v.length() > max_speed || state.w.length() > max_speed {
                return Err(EngineError::Diverged {
                    body: body.name.clone(),
                    detail: format!("speed exceeds {max_speed}"),
                });
            }
        }

        for (body, state) in self.bodies.values_mut().zip(states.iter()) {
            body.state = *state;
            body.wrench = Wrench::ZERO;
        }
        for (handle, row) in &rows {
            if let Some(joint) = self.joints.get_mut(handle) {
                joint.state = joint::measure(joint, &states, *row, joint.state.position);
                joint.effort = 0.0;
            }
        }
        self.contacts = contacts;
        Ok(())
    }

    fn add_body(&mut self, desc: &BodyDesc) -> BodyHandle {
        let handle = BodyHandle::from_raw(self.next_body);
        self.next_body += 1;
        self.bodies.insert(handle, XpbdBody::from_desc(desc));
        handle
    }

    fn remove_body(&mut self, body: BodyHandle) -> Result<(), EngineError> {
        self.bodies
            .remove(&body)
            .ok_or(EngineError::InvalidBodyHandle(body))?;
        self.joints.retain(|_, j| !j.involves(body));
        self.contacts
            .retain(|c| c.body_a != body && c.body_b != body);
        Ok(())
    }

    fn set_gravity(&mut self, gravity: DVec3) {
        self.params.gravity = gravity;
    }

    fn gravity(&self) -> DVec3 {
        self.params.gravity
    }

    fn apply_force(&mut self, body: BodyHandle, force: DVec3, torque: DVec3) -> Result<(), EngineError> {
        self.body_mut(body)?.wrench += Wrench::new(force, torque);
        Ok(())
    }

    fn set_pose(&mut self, body: BodyHandle, pose: Pose) -> Result<(), EngineError> {
        let b = self.body_mut(body)?;
        b.state.x = pose.position;
        b.state.q = pose.rotation();
        b.state.prev_x = b.state.x;
        b.state.prev_q = b.state.q;
        Ok(())
    }

    fn set_velocity(&mut self, body: BodyHandle, twist: Twist) -> Result<(), EngineError> {
        let b = self.body_mut(body)?;
        if b.state.dynamic {
            b.state.v = twist.linear;
            b.state.w = twist.angular;
        }
        Ok(())
    }

    fn pose(&self, body: BodyHandle) -> Result<Pose, EngineError> {
        Ok(self.body(body)?.pose())
    }

    fn velocity(&self, body: BodyHandle) -> Result<Twist, EngineError> {
        Ok(self.body(body)?.twist())
    }

    fn add_constraint(&mut self, desc: &ConstraintDesc) -> Result<ConstraintHandle, EngineError> {
        desc.validate()?;
        let child = self.body(desc.child)?.state;
        let parent = match desc.parent {
            Some(p) => Some(self.body(p)?.state),
            None => None,
        };
        let joint = XpbdJoint::new(desc, parent.as_ref(), &child);
        let handle = ConstraintHandle::from_raw(self.next_joint);
        self.next_joint += 1;
        self.joints.insert(handle, joint);
        Ok(handle)
    }

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> Result<(), EngineError> {
        self.joints
            .remove(&constraint)
            .map(|_| ())
            .ok_or(EngineError::InvalidConstraintHandle(constraint))
    }

    fn apply_joint_effort(&mut self, constraint: ConstraintHandle, effort: f64) -> Result<(), EngineError> {
        self.joint_mut(constraint)?.effort += effort;
        Ok(())
    }

    fn joint_state(&self, constraint: ConstraintHandle) -> Result<JointState, EngineError> {
        self.joints
            .get(&constraint)
            .map(|j| j.state)
            .ok_or(EngineError::InvalidConstraintHandle(constraint))
    }

    fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    fn body_count(&self) -> usize {
        self.bodies.len()
    }

    fn constraint_count(&self) -> usize {
        self.joints.len()
    }

    fn clear(&mut self) {
        self.bodies.clear();
        self.joints.clear();
        self.contacts.clear();
    }
}
