//! Kinematic tree extracted from the body/joint graph.
//!
//! Joints are visited in handle order; the first joint that reaches a body
//! becomes its tree joint and any joint that would close a cycle (or give a
//! body a second parent) is kept as a loop closure. Dynamic bodies without
//! a tree joint float on a six degree-of-freedom free joint.

use glam::{DQuat, DVec3};
use robosim_common::{Pose, Twist};
use std::collections::{BTreeMap, VecDeque};

use super::{ArtBody, ArtJoint};
use crate::engine::{BodyHandle, ConstraintHandle, JointKind, JointState};
use crate::spatial::SpatialMotion;

/// Attachment frames of a joint, captured when it was created.
///
/// Parent-side values are in the parent body frame, or in world
/// coordinates for a world-anchored joint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JointFrame {
    pub kind: JointKind,
    pub anchor_parent: DVec3,
    pub anchor_child: DVec3,
    pub axis_parent: DVec3,
    pub axis_child: DVec3,
    /// Child orientation relative to the parent at joint zero.
    pub rest: DQuat,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Generalized coordinates of one tree joint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Coord {
    Free { position: DVec3, rotation: DQuat },
    Revolute(f64),
    Prismatic(f64),
    /// Relative rotation expressed in the parent frame.
    Ball(DQuat),
    Weld,
}

impl Coord {
    pub fn dofs(&self) -> usize {
        match self {
            Coord::Free { .. } => 6,
            Coord::Revolute(_) | Coord::Prismatic(_) => 1,
            Coord::Ball(_) => 3,
            Coord::Weld => 0,
        }
    }

    /// Reported joint state given this coordinate's velocities.
    pub fn joint_state(&self, velocity: &[f64]) -> JointState {
        match self {
            Coord::Revolute(q) | Coord::Prismatic(q) => JointState {
                position: *q,
                velocity: velocity.first().copied().unwrap_or(0.0),
            },
            Coord::Ball(q) => JointState {
                position: 2.0 * q.w.abs().min(1.0).acos(),
                velocity: velocity.iter().map(|v| v * v).sum::<f64>().sqrt(),
            },
            Coord::Free { .. } | Coord::Weld => JointState::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub body: BodyHandle,
    /// Parent node, or `None` when attached to the world or a static body.
    pub parent: Option<usize>,
    pub joint: Option<ConstraintHandle>,
    pub frame: Option<JointFrame>,
    /// Pose of the fixed frame a root joint hangs from.
    pub fixed_parent: Pose,
    pub coord: Coord,
    /// Index of the node's first velocity coordinate.
    pub offset: usize,
}

impl Node {
    pub fn dofs(&self) -> usize {
        self.coord.dofs()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Tree {
    pub nodes: Vec<Node>,
    pub velocity: Vec<f64>,
    pub node_of: BTreeMap<BodyHandle, usize>,
    /// Joints enforced by spring-dampers instead of coordinates.
    pub loops: Vec<ConstraintHandle>,
}

/// Forward kinematics output.
#[derive(Debug, Clone, Default)]
pub(crate) struct Kinematics {
    pub poses: Vec<Pose>,
    /// Spatial velocity of each node.
    pub velocities: Vec<SpatialMotion>,
    /// Motion subspace column of each velocity coordinate.
    pub subspace: Vec<SpatialMotion>,
}

impl Kinematics {
    pub fn twist(&self, node: usize) -> Twist {
        let v = self.velocities[node];
        Twist::new(v.point_velocity(self.poses[node].position), v.angular)
    }
}

struct UnionFind(Vec<usize>);

impl UnionFind {
    fn new(n: usize) -> Self {
        Self((0..n).collect())
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.0[i] != i {
            self.0[i] = self.0[self.0[i]];
            i = self.0[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.0[rb] = ra;
        }
    }
}

fn wrap_angle(a: f64) -> f64 {
    let mut r = a.rem_euclid(std::f64::consts::TAU);
    if r > std::f64::consts::PI {
        r -= std::f64::consts::TAU;
    }
    r
}

/// Coordinates of a joint measured from maximal body states.
///
/// `previous` keeps revolute angles continuous across +-pi.
pub(crate) fn relative_coords(
    frame: &JointFrame,
    parent: (Pose, Twist),
    child: (Pose, Twist),
    previous: f64,
) -> (Coord, [f64; 3]) {
    let (pp, pt) = parent;
    let (cp, ct) = child;
    let rp = pp.rotation();
    let axis_w = rp * frame.axis_parent;
    let anchor_w = pp.transform_point(frame.anchor_parent);
    let rel_w = ct.angular - pt.angular;
    let relative = rp.inverse() * cp.rotation() * frame.rest.inverse();

    match frame.kind {
        JointKind::Revolute => {
            let s = DVec3::new(relative.x, relative.y, relative.z).dot(frame.axis_parent);
            let theta = 2.0 * s.atan2(relative.w);
            let position = previous + wrap_angle(theta - previous);
            (Coord::Revolute(position), [rel_w.dot(axis_w), 0.0, 0.0])
        }
        JointKind::Prismatic => {
            let anchor_c = cp.transform_point(frame.anchor_child);
            let vc = ct.linear + ct.angular.cross(anchor_c - cp.position);
            let vp = pt.linear + pt.angular.cross(anchor_c - pp.position);
            (
                Coord::Prismatic((anchor_c - anchor_w).dot(axis_w)),
                [(vc - vp).dot(axis_w), 0.0, 0.0],
            )
        }
        JointKind::Ball => {
            let local = rp.inverse() * rel_w;
            (Coord::Ball(relative.normalize()), local.to_array())
        }
        JointKind::Fixed => (Coord::Weld, [0.0; 3]),
    }
}

/// Build the tree from the current body and joint sets, extracting
/// coordinates from the bodies' maximal state.
pub(crate) fn build(
    bodies: &BTreeMap<BodyHandle, ArtBody>,
    joints: &BTreeMap<ConstraintHandle, ArtJoint>,
) -> Tree {
    let index: BTreeMap<BodyHandle, usize> = bodies
        .keys()
        .enumerate()
        .map(|(i, h)| (*h, i))
        .collect();
    let ground = bodies.len();
    let is_dynamic = |h: &BodyHandle| bodies.get(h).is_some_and(|b| b.dynamic);

    let mut sets = UnionFind::new(ground + 1);
    let mut tree_joint: BTreeMap<BodyHandle, ConstraintHandle> = BTreeMap::new();
    let mut children: BTreeMap<BodyHandle, Vec<BodyHandle>> = BTreeMap::new();
    let mut loops = Vec::new();

    for (handle, joint) in joints {
        if !is_dynamic(&joint.child) {
            loops.push(*handle);
            continue;
        }
        let parent_set = match joint.parent {
            Some(p) if is_dynamic(&p) => index[&p],
            _ => ground,
        };
        let child_set = index[&joint.child];
        if tree_joint.contains_key(&joint.child) || sets.find(parent_set) == sets.find(child_set) {
            loops.push(*handle);
            continue;
        }
        sets.union(parent_set, child_set);
        tree_joint.insert(joint.child, *handle);
        if let Some(p) = joint.parent.filter(|p| is_dynamic(p)) {
            children.entry(p).or_default().push(joint.child);
        }
    }

    let mut order: VecDeque<BodyHandle> = bodies
        .iter()
        .filter(|(h, b)| {
            b.dynamic
                && tree_joint
                    .get(*h)
                    .is_none_or(|j| !joints[j].parent.is_some_and(|p| is_dynamic(&p)))
        })
        .map(|(h, _)| *h)
        .collect();

    let mut tree = Tree {
        loops,
        ..Tree::default()
    };
    let mut offset = 0;
    while let Some(body_handle) = order.pop_front() {
        let body = &bodies[&body_handle];
        let node = match tree_joint.get(&body_handle) {
            None => Node {
                body: body_handle,
                parent: None,
                joint: None,
                frame: None,
                fixed_parent: Pose::IDENTITY,
                coord: Coord::Free {
                    position: body.pose.position,
                    rotation: body.pose.rotation(),
                },
                offset,
            },
            Some(jh) => {
                let joint = &joints[jh];
                let parent_node = joint.parent.and_then(|p| tree.node_of.get(&p).copied());
                let parent_state = match joint.parent.and_then(|p| bodies.get(&p)) {
                    Some(p) => (p.pose, if p.dynamic { p.twist } else { Twist::ZERO }),
                    None => (Pose::IDENTITY, Twist::ZERO),
                };
                let (coord, _) = relative_coords(
                    &joint.frame,
                    parent_state,
                    (body.pose, body.twist),
                    joint.state.position,
                );
                Node {
                    body: body_handle,
                    parent: parent_node,
                    joint: Some(*jh),
                    frame: Some(joint.frame),
                    fixed_parent: if parent_node.is_none() {
                        parent_state.0
                    } else {
                        Pose::IDENTITY
                    },
                    coord,
                    offset,
                }
            }
        };
        offset += node.dofs();
        tree.node_of.insert(body_handle, tree.nodes.len());
        tree.nodes.push(node);
        if let Some(kids) = children.get(&body_handle) {
            order.extend(kids.iter().copied());
        }
    }

    // Velocities are extracted once every node has its final offset.
    tree.velocity = vec![0.0; offset];
    for node in &tree.nodes {
        let body = &bodies[&node.body];
        let out = &mut tree.velocity[node.offset..node.offset + node.dofs()];
        match (&node.coord, node.joint) {
            (Coord::Free { position, .. }, _) => {
                let w = body.twist.angular;
                let v_origin = body.twist.linear - w.cross(*position);
                out[..3].copy_from_slice(&w.to_array());
                out[3..].copy_from_slice(&v_origin.to_array());
            }
            (_, Some(jh)) => {
                let joint = &joints[&jh];
                let parent_state = match joint.parent.and_then(|p| bodies.get(&p)) {
                    Some(p) => (p.pose, if p.dynamic { p.twist } else { Twist::ZERO }),
                    None => (Pose::IDENTITY, Twist::ZERO),
                };
                let (_, v) = relative_coords(
                    &joint.frame,
                    parent_state,
                    (body.pose, body.twist),
                    joint.state.position,
                );
                let n = out.len();
                out.copy_from_slice(&v[..n]);
            }
            _ => {}
        }
    }
    tree
}

impl Tree {
    /// Poses, spatial velocities and motion subspaces of every node.
    pub fn kinematics(&self) -> Kinematics {
        let n = self.nodes.len();
        let mut kin = Kinematics {
            poses: Vec::with_capacity(n),
            velocities: Vec::with_capacity(n),
            subspace: vec![SpatialMotion::ZERO; self.velocity.len()],
        };

        for node in &self.nodes {
            let (parent_pose, parent_velocity) = match node.parent {
                Some(p) => (kin.poses[p], kin.velocities[p]),
                None => (node.fixed_parent, SpatialMotion::ZERO),
            };
            let rp = parent_pose.rotation();
            let cols = &mut kin.subspace[node.offset..node.offset + node.dofs()];

            let pose = match (&node.coord, &node.frame) {
                (Coord::Free { position, rotation }, _) => {
                    for k in 0..3 {
                        let e = DVec3::AXES[k];
                        cols[k] = SpatialMotion::new(e, DVec3::ZERO);
                        cols[k + 3] = SpatialMotion::new(DVec3::ZERO, e);
                    }
                    Pose::new(*position, *rotation)
                }
                (coord, Some(frame)) => {
                    let axis_w = rp * frame.axis_parent;
                    let anchor_w = parent_pose.transform_point(frame.anchor_parent);
                    let (rotation, slide) = match coord {
                        Coord::Revolute(theta) => {
                            cols[0] = SpatialMotion::revolute(axis_w, anchor_w);
                            (DQuat::from_axis_angle(axis_w, *theta) * rp * frame.rest, 0.0)
                        }
                        Coord::Prismatic(d) => {
                            cols[0] = SpatialMotion::prismatic(axis_w);
                            (rp * frame.rest, *d)
                        }
                        Coord::Ball(q) => {
                            for (k, col) in cols.iter_mut().enumerate() {
                                *col = SpatialMotion::revolute(rp * DVec3::AXES[k], anchor_w);
                            }
                            (rp * *q * frame.rest, 0.0)
                        }
                        _ => (rp * frame.rest, 0.0),
                    };
                    let rotation = rotation.normalize();
                    let position = anchor_w + axis_w * slide - rotation * frame.anchor_child;
                    Pose::new(position, rotation)
                }
                (_, None) => parent_pose,
            };

            let mut velocity = parent_velocity;
            for (col, qd) in cols
                .iter()
                .zip(&self.velocity[node.offset..node.offset + node.dofs()])
            {
                velocity += *col * *qd;
            }
            kin.poses.push(pose);
            kin.velocities.push(velocity);
        }
        kin
    }

    /// Advance coordinates by `h` using the current velocities, then
    /// clamp limited joints.
    pub fn integrate_positions(&mut self, h: f64) {
        for node in &mut self.nodes {
            let v = &mut self.velocity[node.offset..node.offset + node.coord.dofs()];
            match &mut node.coord {
                Coord::Free { position, rotation } => {
                    let w = DVec3::new(v[0], v[1], v[2]);
                    let v_origin = DVec3::new(v[3], v[4], v[5]);
                    *position += (v_origin + w.cross(*position)) * h;
                    *rotation = (DQuat::from_scaled_axis(w * h) * *rotation).normalize();
                }
                Coord::Revolute(q) | Coord::Prismatic(q) => {
                    *q += v[0] * h;
                    if let Some(frame) = &node.frame {
                        if let Some(lo) = frame.lower.filter(|lo| *q < *lo) {
                            *q = lo;
                            v[0] = v[0].max(0.0);
                        }
                        if let Some(hi) = frame.upper.filter(|hi| *q > *hi) {
                            *q = hi;
                            v[0] = v[0].min(0.0);
                        }
                    }
                }
                Coord::Ball(q) => {
                    let w = DVec3::new(v[0], v[1], v[2]);
                    *q = (DQuat::from_scaled_axis(w * h) * *q).normalize();
                }
                Coord::Weld => {}
            }
        }
    }
}
