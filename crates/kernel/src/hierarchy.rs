//! Entity arena records: models own links and joints, joints refer to links
//! by id so closed kinematic chains need no ownership cycles.

use glam::{DMat3, DVec3};
use robosim_common::{JointId, LinkId, ModelId, Pose, Twist, Wrench};
use robosim_physics::{BodyHandle, ConstraintHandle, JointKind};

use crate::description::{CollisionDescription, Extensions, VisualDescription};

/// Changes queued by callers between steps. The next sub-step pushes them
/// into the engine and clears the slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PendingSlot {
    pub wrench: Wrench,
    pub pose: Option<Pose>,
    pub twist: Option<Twist>,
}

impl PendingSlot {
    pub fn is_empty(&self) -> bool {
        self.wrench.is_zero() && self.pose.is_none() && self.twist.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) id: ModelId,
    pub(crate) name: String,
    pub(crate) scoped_name: String,
    pub(crate) parent: Option<ModelId>,
    pub(crate) is_static: bool,
    /// World pose. Follows the canonical link after every sub-step.
    pub(crate) pose: Pose,
    /// First link and its pose in the model frame at insertion.
    pub(crate) canonical: Option<(LinkId, Pose)>,
    pub(crate) links: Vec<LinkId>,
    pub(crate) joints: Vec<JointId>,
    pub(crate) children: Vec<ModelId>,
    pub(crate) extensions: Extensions,
}

impl Model {
    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full `::`-joined path from the top-level model.
    pub fn scoped_name(&self) -> &str {
        &self.scoped_name
    }

    pub fn parent(&self) -> Option<ModelId> {
        self.parent
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Links in insertion order.
    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    pub fn joints(&self) -> &[JointId] {
        &self.joints
    }

    /// Nested models in insertion order.
    pub fn models(&self) -> &[ModelId] {
        &self.children
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) model: ModelId,
    pub(crate) name: String,
    pub(crate) mass: f64,
    pub(crate) inertia: DMat3,
    pub(crate) gravity: bool,
    pub(crate) linear_damping: f64,
    pub(crate) angular_damping: f64,
    pub(crate) self_collide: bool,
    pub(crate) collisions: Vec<CollisionDescription>,
    pub(crate) visuals: Vec<VisualDescription>,
    pub(crate) extensions: Extensions,
    pub(crate) pose: Pose,
    pub(crate) twist: Twist,
    pub(crate) pending: PendingSlot,
    pub(crate) handle: BodyHandle,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Body-frame inertia about the center of mass.
    pub fn inertia(&self) -> DMat3 {
        self.inertia
    }

    pub fn gravity(&self) -> bool {
        self.gravity
    }

    pub fn linear_damping(&self) -> f64 {
        self.linear_damping
    }

    pub fn angular_damping(&self) -> f64 {
        self.angular_damping
    }

    pub fn collisions(&self) -> &[CollisionDescription] {
        &self.collisions
    }

    pub fn visuals(&self) -> &[VisualDescription] {
        &self.visuals
    }

    /// World pose as of the last completed sub-step.
    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// World velocity as of the last completed sub-step.
    pub fn twist(&self) -> Twist {
        self.twist
    }

    pub fn pending(&self) -> &PendingSlot {
        &self.pending
    }

    /// Pose the link will start the next sub-step from.
    pub fn effective_pose(&self) -> Pose {
        self.pending.pose.unwrap_or(self.pose)
    }

    pub fn effective_twist(&self) -> Twist {
        self.pending.twist.unwrap_or(self.twist)
    }

    pub fn handle(&self) -> BodyHandle {
        self.handle
    }

    pub(crate) fn collision_name(&self, index: usize) -> String {
        self.collisions
            .get(index)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Joint {
    pub(crate) id: JointId,
    pub(crate) model: ModelId,
    pub(crate) name: String,
    pub(crate) kind: JointKind,
    /// `None` when anchored to the world.
    pub(crate) parent: Option<LinkId>,
    pub(crate) child: LinkId,
    pub(crate) anchor: DVec3,
    pub(crate) axis: DVec3,
    pub(crate) lower: Option<f64>,
    pub(crate) upper: Option<f64>,
    pub(crate) damping: f64,
    pub(crate) extensions: Extensions,
    pub(crate) pending_effort: f64,
    pub(crate) position: f64,
    pub(crate) velocity: f64,
    pub(crate) handle: ConstraintHandle,
}

impl Joint {
    pub fn id(&self) -> JointId {
        self.id
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JointKind {
        self.kind
    }

    pub fn parent(&self) -> Option<LinkId> {
        self.parent
    }

    pub fn child(&self) -> LinkId {
        self.child
    }

    /// Joint origin in the child link frame.
    pub fn anchor(&self) -> DVec3 {
        self.anchor
    }

    /// Joint axis in the child link frame.
    pub fn axis(&self) -> DVec3 {
        self.axis
    }

    pub fn limits(&self) -> (Option<f64>, Option<f64>) {
        (self.lower, self.upper)
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Generalized position (angle or displacement) after the last sub-step.
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn pending_effort(&self) -> f64 {
        self.pending_effort
    }

    pub fn handle(&self) -> ConstraintHandle {
        self.handle
    }

    pub fn involves(&self, link: LinkId) -> bool {
        self.child == link || self.parent == Some(link)
    }
}
