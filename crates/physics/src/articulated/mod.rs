//! Reduced-coordinate articulated-body back-end.
//!
//! Joints are expressed as generalized coordinates of a kinematic tree, so
//! tree joints never drift. Dynamics use recursive Newton-Euler for bias
//! forces and the composite-rigid-body algorithm for the mass matrix,
//! integrated with semi-implicit Euler. Contacts are penalty spring-dampers
//! and joints that close kinematic loops are enforced by stiff springs.

mod dynamics;
mod tree;

use glam::{DMat3, DVec3};
use robosim_common::{Pose, Twist, Wrench};
use std::collections::BTreeMap;

use crate::collision::{self, Collider, Contact, ShapeDesc, mix_friction};
use crate::engine::{
    BodyDesc, BodyHandle, BodyKind, ConstraintDesc, ConstraintHandle, EngineError, EngineParams,
    JointKind, JointState, PhysicsEngine,
};
use crate::spatial::{SpatialForce, SpatialInertia};
use tree::{JointFrame, Kinematics, Tree};

/// Registry name of this back-end.
pub const ARTICULATED: &str = "articulated";

#[derive(Debug, Clone)]
pub(crate) struct ArtBody {
    pub name: String,
    pub dynamic: bool,
    pub pose: Pose,
    pub twist: Twist,
    pub mass: f64,
    pub inertia: DMat3,
    pub gravity: bool,
    pub linear_damping: f64,
    pub angular_damping: f64,
    pub shapes: Vec<ShapeDesc>,
    pub collision_group: Option<u32>,
    pub self_collide: bool,
    pub wrench: Wrench,
}

#[derive(Debug, Clone)]
pub(crate) struct ArtJoint {
    pub parent: Option<BodyHandle>,
    pub child: BodyHandle,
    pub frame: JointFrame,
    pub damping: f64,
    pub effort: f64,
    pub state: JointState,
}

#[derive(Debug, Default)]
pub struct ArticulatedEngine {
    params: EngineParams,
    bodies: BTreeMap<BodyHandle, ArtBody>,
    joints: BTreeMap<ConstraintHandle, ArtJoint>,
    next_body: u32,
    next_joint: u32,
    /// Rebuilt lazily whenever the body/joint graph or a maximal state
    /// changes from outside the solver.
    tree: Option<Tree>,
    contacts: Vec<Contact>,
}

impl ArticulatedEngine {
    pub fn new(params: &EngineParams) -> Self {
        Self {
            params: params.clone(),
            ..Self::default()
        }
    }

    fn body(&self, h: BodyHandle) -> Result<&ArtBody, EngineError> {
        self.bodies.get(&h).ok_or(EngineError::InvalidBodyHandle(h))
    }

    fn body_mut(&mut self, h: BodyHandle) -> Result<&mut ArtBody, EngineError> {
        self.bodies.get_mut(&h).ok_or(EngineError::InvalidBodyHandle(h))
    }

    fn parent_state(&self, parent: Option<BodyHandle>) -> (Pose, Twist) {
        match parent.and_then(|p| self.bodies.get(&p)) {
            Some(b) => (b.pose, b.twist),
            None => (Pose::IDENTITY, Twist::ZERO),
        }
    }

    /// Copy tree kinematics into the maximal body states.
    fn sync_bodies(&mut self, tree: &Tree, kin: &Kinematics) {
        for (i, node) in tree.nodes.iter().enumerate() {
            if let Some(body) = self.bodies.get_mut(&node.body) {
                body.pose = kin.poses[i];
                body.twist = kin.twist(i);
            }
        }
    }

    fn update_joint_states(&mut self, tree: &Tree) {
        for node in &tree.nodes {
            if let Some(joint) = node.joint.and_then(|h| self.joints.get_mut(&h)) {
                let v = &tree.velocity[node.offset..node.offset + node.dofs()];
                joint.state = node.coord.joint_state(v);
            }
        }
        for handle in &tree.loops {
            let Some(joint) = self.joints.get(handle) else {
                continue;
            };
            let parent = self.parent_state(joint.parent);
            let child = self.parent_state(Some(joint.child));
            let (coord, v) = tree::relative_coords(&joint.frame, parent, child, joint.state.position);
            let state = coord.joint_state(&v[..coord.dofs()]);
            if let Some(joint) = self.joints.get_mut(handle) {
                joint.state = state;
            }
        }
    }

    fn ensure_tree(&mut self) -> Tree {
        match self.tree.take() {
            Some(tree) => tree,
            None => {
                let tree = tree::build(&self.bodies, &self.joints);
                let kin = tree.kinematics();
                self.sync_bodies(&tree, &kin);
                tracing::debug!(
                    nodes = tree.nodes.len(),
                    dofs = tree.velocity.len(),
                    loops = tree.loops.len(),
                    "rebuilt articulation tree"
                );
                tree
            }
        }
    }

    fn colliders(&self) -> Vec<Collider<'_>> {
        self.bodies
            .iter()
            .filter(|(_, b)| !b.shapes.is_empty())
            .map(|(h, b)| Collider {
                body: *h,
                pose: b.pose,
                shapes: &b.shapes,
                group: b.collision_group,
                self_collide: b.self_collide,
                fixed: !b.dynamic,
            })
            .collect()
    }

    /// Spatial forces on every body: gravity, applied wrenches, damping,
    /// penalty contacts and loop closures.
    fn external_forces(
        &self,
        contacts: &[Contact],
        loops: &[ConstraintHandle],
    ) -> BTreeMap<BodyHandle, SpatialForce> {
        let mut out: BTreeMap<BodyHandle, SpatialForce> = BTreeMap::new();
        let solver = &self.params.solver;

        for (h, b) in self.bodies.iter().filter(|(_, b)| b.dynamic) {
            let p = b.pose.position;
            let mut f = SpatialForce::at_point(b.wrench.force, p) + SpatialForce::pure_torque(b.wrench.torque);
            if b.gravity {
                f += SpatialForce::at_point(self.params.gravity * b.mass, p);
            }
            let r = DMat3::from_quat(b.pose.rotation());
            let inertia_w = r * b.inertia * r.transpose();
            f += SpatialForce::at_point(-b.twist.linear * (b.linear_damping * b.mass), p);
            f += SpatialForce::pure_torque(-(inertia_w * b.twist.angular) * b.angular_damping);
            out.insert(*h, f);
        }

        let mut push = |body: BodyHandle, f: SpatialForce| {
            if let Some(slot) = out.get_mut(&body) {
                *slot += f;
            }
        };

        for c in contacts {
            let (Some(a), Some(b)) = (self.bodies.get(&c.body_a), self.bodies.get(&c.body_b)) else {
                continue;
            };
            let mu = mix_friction(a.shapes[c.shape_a].friction, b.shapes[c.shape_b].friction);
            for p in &c.points {
                let va = a.twist.linear + a.twist.angular.cross(p.position - a.pose.position);
                let vb = b.twist.linear + b.twist.angular.cross(p.position - b.pose.position);
                let u = vb - va;
                let un = u.dot(p.normal);
                let fn_ = (solver.contact_stiffness * p.depth - solver.contact_damping * un).max(0.0);
                let mut force = p.normal * fn_;
                let ut = u - p.normal * un;
                let slip = ut.length();
                if slip > 1e-12 {
                    force -= ut / slip * (mu * fn_).min(solver.contact_damping * slip);
                }
                push(c.body_b, SpatialForce::at_point(force, p.position));
                push(c.body_a, SpatialForce::at_point(-force, p.position));
            }
        }

        for joint in loops.iter().filter_map(|h| self.joints.get(h)) {
            for (body, f) in self.loop_forces(joint) {
                push(body, f);
            }
        }
        out
    }

    /// Spring-damper that pulls a loop-closing joint back together.
    fn loop_forces(&self, joint: &ArtJoint) -> Vec<(BodyHandle, SpatialForce)> {
        let solver = &self.params.solver;
        let (pp, pt) = self.parent_state(joint.parent);
        let (cp, ct) = self.parent_state(Some(joint.child));
        let frame = &joint.frame;

        let anchor_p = pp.transform_point(frame.anchor_parent);
        let anchor_c = cp.transform_point(frame.anchor_child);
        let vp = pt.linear + pt.angular.cross(anchor_p - pp.position);
        let vc = ct.linear + ct.angular.cross(anchor_c - cp.position);
        let axis = pp.rotate_vector(frame.axis_parent);
        let rel_w = ct.angular - pt.angular;

        let mut force = (anchor_p - anchor_c) * solver.loop_stiffness + (vp - vc) * solver.loop_damping;
        let mut torque = DVec3::ZERO;
        match frame.kind {
            JointKind::Revolute => {
                let axis_c = cp.rotate_vector(frame.axis_child);
                torque += axis_c.cross(axis) * solver.loop_stiffness;
                let perp = rel_w - axis * rel_w.dot(axis);
                torque -= perp * solver.loop_damping;
                torque += axis * (joint.effort - joint.damping * rel_w.dot(axis));
            }
            JointKind::Prismatic | JointKind::Fixed => {
                let mut e = (pp.rotation() * frame.rest) * cp.rotation().inverse();
                if e.w < 0.0 {
                    e = -e;
                }
                torque += DVec3::new(e.x, e.y, e.z) * (2.0 * solver.loop_stiffness);
                torque -= rel_w * solver.loop_damping;
                if frame.kind == JointKind::Prismatic {
                    force -= axis * force.dot(axis);
                    let slide = (vc - vp).dot(axis);
                    force += axis * (joint.effort - joint.damping * slide);
                }
            }
            JointKind::Ball => {
                torque -= rel_w * joint.damping;
            }
        }

        let mut out = vec![(
            joint.child,
            SpatialForce::at_point(force, anchor_c) + SpatialForce::pure_torque(torque),
        )];
        if let Some(parent) = joint.parent {
            out.push((
                parent,
                SpatialForce::at_point(-force, anchor_p) + SpatialForce::pure_torque(-torque),
            ));
        }
        out
    }

    fn substep(&mut self, tree: &mut Tree, h: f64) -> Result<Vec<Contact>, EngineError> {
        let contacts = collision::detect(&self.colliders());
        let external = self.external_forces(&contacts, &tree.loops);

        let kin = tree.kinematics();
        let inertias: Vec<SpatialInertia> = tree
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let b = &self.bodies[&n.body];
                SpatialInertia::from_body(b.mass, b.inertia, &kin.poses[i])
            })
            .collect();
        let f_ext: Vec<SpatialForce> = tree
            .nodes
            .iter()
            .map(|n| external.get(&n.body).copied().unwrap_or_default())
            .collect();

        let mut rhs = dynamics::bias_forces(tree, &kin, &inertias, &f_ext);
        for c in rhs.iter_mut() {
            *c = -*c;
        }
        for node in &tree.nodes {
            let Some(joint) = node.joint.and_then(|j| self.joints.get(&j)) else {
                continue;
            };
            for k in node.offset..node.offset + node.dofs() {
                let effort = if joint.frame.kind == JointKind::Ball { 0.0 } else { joint.effort };
                rhs[k] += effort - joint.damping * tree.velocity[k];
            }
        }

        let mass = dynamics::mass_matrix(tree, &kin, &inertias);
        let accel = dynamics::cholesky_solve(mass, rhs).ok_or_else(|| EngineError::Diverged {
            body: tree
                .nodes
                .first()
                .and_then(|n| self.bodies.get(&n.body))
                .map(|b| b.name.clone())
                .unwrap_or_default(),
            detail: "joint-space inertia is not positive definite".into(),
        })?;

        for (v, a) in tree.velocity.iter_mut().zip(&accel) {
            *v += a * h;
        }
        tree.integrate_positions(h);
        let kin = tree.kinematics();
        self.sync_bodies(tree, &kin);
        Ok(contacts)
    }

    fn check_finite(&self) -> Result<(), EngineError> {
        let max_speed = self.params.solver.max_speed;
        for b in self.bodies.values().filter(|b| b.dynamic) {
            if !b.pose.is_finite() || !b.twist.is_finite() {
                return Err(EngineError::Diverged {
                    body: b.name.clone(),
                    detail: "non-finite state".into(),
                });
            }
            if b.twist.linear.length() > max_speed || b.twist.angular.length() > max_speed {
                return Err(EngineError::Diverged {
                    body: b.name.clone(),
                    detail: format!("speed exceeds {max_speed}"),
                });
            }
        }
        Ok(())
    }
}

impl PhysicsEngine for ArticulatedEngine {
    fn kind(&self) -> &'static str {
        ARTICULATED
    }

    fn init(&mut self, params: &EngineParams) {
        *self = Self::new(params);
    }

    fn step(&mut self, dt: f64) -> Result<(), EngineError> {
        let substeps = self.params.solver.substeps.max(1);
        let h = dt / f64::from(substeps);

        // A failed step restores the last good state.
        let mut tree = self.ensure_tree();
        let saved_tree = tree.clone();
        let saved_bodies = self.bodies.clone();

        let mut contacts = Vec::new();
        let mut result = Ok(());
        for _ in 0..substeps {
            match self.substep(&mut tree, h) {
                Ok(c) => contacts = c,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = self.check_finite();
        }
        if let Err(e) = result {
            self.bodies = saved_bodies;
            self.tree = Some(saved_tree);
            return Err(e);
        }

        for body in self.bodies.values_mut() {
            body.wrench = Wrench::ZERO;
        }
        self.update_joint_states(&tree);
        for joint in self.joints.values_mut() {
            joint.effort = 0.0;
        }
        self.tree = Some(tree);
        self.contacts = contacts;
        Ok(())
    }

    fn add_body(&mut self, desc: &BodyDesc) -> BodyHandle {
        let handle = BodyHandle::from_raw(self.next_body);
        self.next_body += 1;
        let dynamic = desc.kind == BodyKind::Dynamic && desc.mass > 0.0;
        self.bodies.insert(
            handle,
            ArtBody {
                name: desc.name.clone(),
                dynamic,
                pose: desc.pose,
                twist: if dynamic { desc.twist } else { Twist::ZERO },
                mass: desc.mass,
                inertia: desc.inertia,
                gravity: desc.gravity,
                linear_damping: desc.linear_damping.max(0.0),
                angular_damping: desc.angular_damping.max(0.0),
                shapes: desc.shapes.clone(),
                collision_group: desc.collision_group,
                self_collide: desc.self_collide,
                wrench: Wrench::ZERO,
            },
        );
        self.tree = None;
        handle
    }

    fn remove_body(&mut self, body: BodyHandle) -> Result<(), EngineError> {
        self.bodies
            .remove(&body)
            .ok_or(EngineError::InvalidBodyHandle(body))?;
        self.joints
            .retain(|_, j| j.child != body && j.parent != Some(body));
        self.contacts
            .retain(|c| c.body_a != body && c.body_b != body);
        self.tree = None;
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
        self.body_mut(body)?.pose = pose;
        self.tree = None;
        Ok(())
    }

    fn set_velocity(&mut self, body: BodyHandle, twist: Twist) -> Result<(), EngineError> {
        let b = self.body_mut(body)?;
        if b.dynamic {
            b.twist = twist;
        }
        self.tree = None;
        Ok(())
    }

    fn pose(&self, body: BodyHandle) -> Result<Pose, EngineError> {
        Ok(self.body(body)?.pose)
    }

    fn velocity(&self, body: BodyHandle) -> Result<Twist, EngineError> {
        Ok(self.body(body)?.twist)
    }

    fn add_constraint(&mut self, desc: &ConstraintDesc) -> Result<ConstraintHandle, EngineError> {
        desc.validate()?;
        let child = self.body(desc.child)?.pose;
        let parent = match desc.parent {
            Some(p) => self.body(p)?.pose,
            None => Pose::IDENTITY,
        };
        let to_parent = parent.rotation().inverse();
        let axis = desc.axis.normalize_or(DVec3::Z);
        let frame = JointFrame {
            kind: desc.kind,
            anchor_parent: parent.inverse().transform_point(desc.anchor),
            anchor_child: child.inverse().transform_point(desc.anchor),
            axis_parent: to_parent * axis,
            axis_child: child.rotation().inverse() * axis,
            rest: to_parent * child.rotation(),
            lower: desc.lower,
            upper: desc.upper,
        };
        let handle = ConstraintHandle::from_raw(self.next_joint);
        self.next_joint += 1;
        self.joints.insert(
            handle,
            ArtJoint {
                parent: desc.parent,
                child: desc.child,
                frame,
                damping: desc.damping.max(0.0),
                effort: 0.0,
                state: JointState::default(),
            },
        );
        self.tree = None;
        Ok(handle)
    }

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> Result<(), EngineError> {
        self.joints
            .remove(&constraint)
            .ok_or(EngineError::InvalidConstraintHandle(constraint))?;
        self.tree = None;
        Ok(())
    }

    fn apply_joint_effort(&mut self, constraint: ConstraintHandle, effort: f64) -> Result<(), EngineError> {
        self.joints
            .get_mut(&constraint)
            .ok_or(EngineError::InvalidConstraintHandle(constraint))?
            .effort += effort;
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
        self.tree = None;
        self.contacts.clear();
    }
}
