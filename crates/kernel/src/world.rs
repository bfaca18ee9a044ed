use glam::DVec3;
use robosim_common::{JointId, LinkId, ModelId, Pose, SCOPE_DELIMITER, Twist, Wrench, scoped_name};
use robosim_physics::{
    BodyDesc, BodyHandle, BodyKind, ConstraintDesc, ConstraintHandle, EngineError,
    EngineRegistry, JointKind, PhysicsEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, trace, warn};

use crate::config::{WorldConfig, validate_step_size};
use crate::contact::ContactEvent;
use crate::description::{
    EntityDescription, Extensions, Inertial, InertiaTensor, JointDescription, LinkDescription,
    ModelDescription, SceneDescription,
};
use crate::error::{EntityKind, SimError, from_engine};
use crate::hierarchy::{Joint, Link, Model, PendingSlot};

/// An event record produced by every structural mutation and every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    ModelAdded { id: ModelId, name: String },
    ModelRemoved { id: ModelId, name: String },
    LinkAdded { id: LinkId, name: String },
    LinkRemoved { id: LinkId, name: String },
    JointAdded { id: JointId, name: String },
    JointRemoved { id: JointId, name: String },
    /// A `step(n)` call completed.
    Stepped { iterations: u64, sim_time: f64 },
    /// The engine failed while computing sub-step `iteration + 1`.
    Diverged { iteration: u64, detail: String },
    /// Engine handles were rebuilt from the cached entity state.
    Reset { engine: String },
}

/// Time-stamped state of one link, as consumed by statistics collectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSample {
    pub link: LinkId,
    pub time: f64,
    pub iteration: u64,
    pub pose: Pose,
    pub twist: Twist,
}

/// Resolved scoped name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Model(ModelId),
    Link(LinkId),
    Joint(JointId),
}

/// Closure run by the kernel after every sub-step. Hierarchy mutations made
/// from inside a hook fail with [`SimError::Busy`].
pub type StepHook = Box<dyn FnMut(&mut World) + Send + Sync>;

/// Most recent events kept by a world whose log nobody drains.
pub const EVENT_LOG_CAPACITY: usize = 1024;

/// Marks a world as stepping and holds its hooks for one `step` call.
/// Dropping it restores both, also when a hook panics.
struct Stepping<'a> {
    world: &'a mut World,
    hooks: Vec<StepHook>,
}

impl<'a> Stepping<'a> {
    fn enter(world: &'a mut World) -> Self {
        world.stepping = true;
        let hooks = std::mem::take(&mut world.hooks);
        Self { world, hooks }
    }
}

impl Drop for Stepping<'_> {
    fn drop(&mut self) {
        // Hooks registered from inside a hook run from the next call on.
        let mut hooks = std::mem::take(&mut self.hooks);
        hooks.append(&mut self.world.hooks);
        self.world.hooks = hooks;
        self.world.stepping = false;
    }
}

/// Ids created by one insertion, released again if the insertion fails.
#[derive(Debug, Default)]
struct Staged {
    models: Vec<ModelId>,
    links: Vec<LinkId>,
    joints: Vec<JointId>,
}

/// The simulation root.
///
/// All mutations go through explicit operations. The world owns the entity
/// arena and exactly one physics engine; every link and joint in the arena
/// has exactly one engine handle. Cached link and joint state is refreshed
/// from the engine after every sub-step and is never written directly:
/// pose, velocity, force and effort requests queue in pending slots that the
/// next sub-step consumes.
///
/// Arenas are BTreeMaps keyed by monotonically increasing ids, so iteration
/// order is insertion order on every platform.
pub struct World {
    config: WorldConfig,
    engine: Box<dyn PhysicsEngine>,
    models: BTreeMap<ModelId, Model>,
    links: BTreeMap<LinkId, Link>,
    joints: BTreeMap<JointId, Joint>,
    body_links: BTreeMap<BodyHandle, LinkId>,
    next_model: u32,
    next_link: u32,
    next_joint: u32,
    /// `sim_time = base_time + steps_since_base * active_step`
    base_time: f64,
    steps_since_base: u64,
    active_step: f64,
    iterations: u64,
    contacts: Vec<ContactEvent>,
    hooks: Vec<StepHook>,
    stepping: bool,
    diverged: Option<String>,
    extensions: Extensions,
    event_log: VecDeque<WorldEvent>,
}

impl World {
    /// Create an empty world bound to one of the built-in back-ends.
    pub fn new(config: WorldConfig) -> Result<Self, SimError> {
        Self::with_registry(config, &EngineRegistry::builtin())
    }

    /// Create an empty world, picking `config.engine` from `registry`.
    pub fn with_registry(config: WorldConfig, registry: &EngineRegistry) -> Result<Self, SimError> {
        config.validate()?;
        let engine = registry
            .create(&config.engine, &config.engine_params())
            .map_err(from_engine)?;
        Ok(Self::bind(config, engine))
    }

    /// Create an empty world around an engine built by the caller.
    pub fn with_engine(
        mut config: WorldConfig,
        mut engine: Box<dyn PhysicsEngine>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        config.engine = engine.kind().to_string();
        engine.init(&config.engine_params());
        Ok(Self::bind(config, engine))
    }

    /// Build a world and spawn every model of a scene, in order.
    pub fn from_scene(scene: &SceneDescription) -> Result<Self, SimError> {
        let mut world = Self::new(scene.world.clone())?;
        world.extensions = scene.extensions.clone();
        for model in &scene.models {
            world.add_model(model)?;
        }
        Ok(world)
    }

    fn bind(config: WorldConfig, engine: Box<dyn PhysicsEngine>) -> Self {
        debug!(world = %config.name, engine = engine.kind(), "world created");
        Self {
            active_step: config.step_size,
            config,
            engine,
            models: BTreeMap::new(),
            links: BTreeMap::new(),
            joints: BTreeMap::new(),
            body_links: BTreeMap::new(),
            next_model: 0,
            next_link: 0,
            next_joint: 0,
            base_time: 0.0,
            steps_since_base: 0,
            iterations: 0,
            contacts: Vec::new(),
            hooks: Vec::new(),
            stepping: false,
            diverged: None,
            extensions: Extensions::new(),
            event_log: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn gravity(&self) -> DVec3 {
        self.config.gravity
    }

    /// Takes effect at the start of the next `step` call.
    pub fn set_gravity(&mut self, gravity: DVec3) -> Result<(), SimError> {
        if !gravity.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "gravity must be finite, got {gravity}"
            )));
        }
        self.config.gravity = gravity;
        Ok(())
    }

    pub fn step_size(&self) -> f64 {
        self.config.step_size
    }

    /// Takes effect at the start of the next `step` call.
    pub fn set_step_size(&mut self, step_size: f64) -> Result<(), SimError> {
        validate_step_size(step_size)?;
        self.config.step_size = step_size;
        Ok(())
    }

    /// Simulated seconds. Only `step` advances it.
    pub fn sim_time(&self) -> f64 {
        self.base_time + self.steps_since_base as f64 * self.active_step
    }

    /// Sub-steps completed since the world was created.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn engine_kind(&self) -> &'static str {
        self.engine.kind()
    }

    pub fn engine(&self) -> &dyn PhysicsEngine {
        self.engine.as_ref()
    }

    /// True while `step` is running, i.e. inside step hooks.
    pub fn is_stepping(&self) -> bool {
        self.stepping
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged.is_some()
    }

    fn ensure_idle(&self) -> Result<(), SimError> {
        if self.stepping {
            Err(SimError::Busy {
                world: self.config.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    // -- lookup ----------------------------------------------------------

    /// Top-level models in insertion order.
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values().filter(|m| m.parent.is_none())
    }

    /// Number of models, nested ones included.
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn model_by_id(&self, id: ModelId) -> Option<&Model> {
        self.models.get(&id)
    }

    pub fn link_by_id(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn joint_by_id(&self, id: JointId) -> Option<&Joint> {
        self.joints.get(&id)
    }

    /// All links in insertion order.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// All joints in insertion order.
    pub fn joints(&self) -> impl Iterator<Item = &Joint> {
        self.joints.values()
    }

    /// Model by scoped name (`outer::inner`).
    pub fn model(&self, name: &str) -> Result<&Model, SimError> {
        let id = self.resolve_model(name)?;
        self.models
            .get(&id)
            .ok_or_else(|| SimError::not_found(EntityKind::Model, name))
    }

    /// Link `name` of `model`. `name` may address a nested model's link
    /// (`inner::link`).
    pub fn link(&self, model: &str, name: &str) -> Result<&Link, SimError> {
        let model_id = self.resolve_model(model)?;
        self.find_link_in(model_id, name)
            .and_then(|id| self.links.get(&id))
            .ok_or_else(|| SimError::not_found(EntityKind::Link, scoped_name([model, name])))
    }

    pub fn joint(&self, model: &str, name: &str) -> Result<&Joint, SimError> {
        let model_id = self.resolve_model(model)?;
        self.find_joint_in(model_id, name)
            .and_then(|id| self.joints.get(&id))
            .ok_or_else(|| SimError::not_found(EntityKind::Joint, scoped_name([model, name])))
    }

    /// Resolve a scoped name to a model, a link or a joint, in that order.
    pub fn resolve(&self, scoped: &str) -> Result<EntityRef, SimError> {
        if let Ok(id) = self.resolve_model(scoped) {
            return Ok(EntityRef::Model(id));
        }
        let not_found = || SimError::not_found(EntityKind::Entity, scoped);
        let (model, name) = scoped.rsplit_once(SCOPE_DELIMITER).ok_or_else(not_found)?;
        let model = self.resolve_model(model).map_err(|_| not_found())?;
        if let Some(link) = self.find_link_in(model, name) {
            return Ok(EntityRef::Link(link));
        }
        if let Some(joint) = self.find_joint_in(model, name) {
            return Ok(EntityRef::Joint(joint));
        }
        Err(not_found())
    }

    /// Scoped name of a link (`model::link`).
    pub fn link_scoped_name(&self, id: LinkId) -> Option<String> {
        let link = self.links.get(&id)?;
        let model = self.models.get(&link.model)?;
        Some(scoped_name([model.scoped_name.as_str(), link.name.as_str()]))
    }

    fn resolve_model(&self, scoped: &str) -> Result<ModelId, SimError> {
        let mut current = None;
        for segment in scoped.split(SCOPE_DELIMITER) {
            current = Some(
                self.find_child_model(current, segment)
                    .ok_or_else(|| SimError::not_found(EntityKind::Model, scoped))?,
            );
        }
        current.ok_or_else(|| SimError::not_found(EntityKind::Model, scoped))
    }

    fn find_child_model(&self, parent: Option<ModelId>, name: &str) -> Option<ModelId> {
        match parent {
            None => self
                .models
                .values()
                .find(|m| m.parent.is_none() && m.name == name)
                .map(|m| m.id),
            Some(parent) => self.models.get(&parent)?.children.iter().copied().find(|c| {
                self.models.get(c).is_some_and(|m| m.name == name)
            }),
        }
    }

    /// Walk a relative scoped path of nested models below `model`.
    fn find_nested(&self, model: ModelId, path: &str) -> Option<ModelId> {
        path.split(SCOPE_DELIMITER)
            .try_fold(model, |m, segment| self.find_child_model(Some(m), segment))
    }

    fn find_link_in(&self, model: ModelId, name: &str) -> Option<LinkId> {
        let (owner, name) = match name.rsplit_once(SCOPE_DELIMITER) {
            Some((path, name)) => (self.find_nested(model, path)?, name),
            None => (model, name),
        };
        self.models
            .get(&owner)?
            .links
            .iter()
            .copied()
            .find(|l| self.links.get(l).is_some_and(|l| l.name == name))
    }

    fn find_joint_in(&self, model: ModelId, name: &str) -> Option<JointId> {
        let (owner, name) = match name.rsplit_once(SCOPE_DELIMITER) {
            Some((path, name)) => (self.find_nested(model, path)?, name),
            None => (model, name),
        };
        self.models
            .get(&owner)?
            .joints
            .iter()
            .copied()
            .find(|j| self.joints.get(j).is_some_and(|j| j.name == name))
    }

    /// `model` followed by all of its nested models, depth first.
    fn subtree(&self, model: ModelId) -> Vec<ModelId> {
        let mut out = Vec::new();
        let mut stack = vec![model];
        while let Some(id) = stack.pop() {
            if let Some(m) = self.models.get(&id) {
                out.push(id);
                stack.extend(m.children.iter().rev().copied());
            }
        }
        out
    }

    fn root_of(&self, mut model: ModelId) -> ModelId {
        while let Some(parent) = self.models.get(&model).and_then(|m| m.parent) {
            model = parent;
        }
        model
    }

    // -- hierarchy mutation ----------------------------------------------

    /// Add a top-level model with all of its links, joints and nested models.
    ///
    /// Atomic: on failure nothing is added and no engine handle remains.
    pub fn add_model(&mut self, desc: &ModelDescription) -> Result<ModelId, SimError> {
        self.insert_model(None, desc)
    }

    /// Add a model nested inside the model at `parent` (scoped name).
    pub fn add_nested_model(
        &mut self,
        parent: &str,
        desc: &ModelDescription,
    ) -> Result<ModelId, SimError> {
        self.ensure_idle()?;
        let parent = self.resolve_model(parent)?;
        self.insert_model(Some(parent), desc)
    }

    fn insert_model(
        &mut self,
        parent: Option<ModelId>,
        desc: &ModelDescription,
    ) -> Result<ModelId, SimError> {
        self.ensure_idle()?;
        let (parent_pose, parent_scope, parent_static) = match parent {
            Some(p) => {
                let m = self
                    .models
                    .get(&p)
                    .ok_or_else(|| SimError::not_found(EntityKind::Model, p.to_string()))?;
                (m.pose, Some(m.scoped_name.clone()), m.is_static)
            }
            None => (Pose::IDENTITY, None, false),
        };
        let scoped = match &parent_scope {
            Some(scope) => scoped_name([scope.as_str(), desc.name.as_str()]),
            None => desc.name.clone(),
        };
        if self.find_child_model(parent, &desc.name).is_some() {
            return Err(SimError::duplicate(EntityKind::Model, scoped));
        }
        validate_model(desc, &scoped, parent_static)?;

        let mut staged = Staged::default();
        let result = self.build_model(
            parent,
            parent_pose,
            parent_scope.as_deref(),
            parent_static,
            desc,
            &mut staged,
        );
        match result {
            Ok(id) => {
                self.commit(&staged);
                Ok(id)
            }
            Err(err) => {
                self.rollback(staged);
                Err(err)
            }
        }
    }

    fn build_model(
        &mut self,
        parent: Option<ModelId>,
        parent_pose: Pose,
        parent_scope: Option<&str>,
        parent_static: bool,
        desc: &ModelDescription,
        staged: &mut Staged,
    ) -> Result<ModelId, SimError> {
        let id = ModelId(self.next_model);
        self.next_model += 1;
        let scoped = match parent_scope {
            Some(scope) => scoped_name([scope, desc.name.as_str()]),
            None => desc.name.clone(),
        };
        let pose = parent_pose * desc.pose;
        let is_static = parent_static || desc.is_static;
        self.models.insert(
            id,
            Model {
                id,
                name: desc.name.clone(),
                scoped_name: scoped.clone(),
                parent,
                is_static,
                pose,
                canonical: None,
                links: Vec::new(),
                joints: Vec::new(),
                children: Vec::new(),
                extensions: desc.extensions.clone(),
            },
        );
        staged.models.push(id);
        if let Some(parent) = parent.and_then(|p| self.models.get_mut(&p)) {
            parent.children.push(id);
        }

        for link in &desc.links {
            self.build_link(id, link, staged)?;
        }
        for nested in &desc.models {
            self.build_model(Some(id), pose, Some(scoped.as_str()), is_static, nested, staged)?;
        }
        for joint in &desc.joints {
            self.build_joint(id, joint, staged)?;
        }
        Ok(id)
    }

    /// Add a link to an existing model. The link pose is relative to the
    /// model's current pose.
    pub fn add_link(&mut self, model: &str, desc: &LinkDescription) -> Result<LinkId, SimError> {
        self.ensure_idle()?;
        let model = self.resolve_model(model)?;
        let mut staged = Staged::default();
        match self.build_link(model, desc, &mut staged) {
            Ok(id) => {
                self.commit(&staged);
                Ok(id)
            }
            Err(err) => {
                self.rollback(staged);
                Err(err)
            }
        }
    }

    fn build_link(
        &mut self,
        model_id: ModelId,
        desc: &LinkDescription,
        staged: &mut Staged,
    ) -> Result<LinkId, SimError> {
        let model = self
            .models
            .get(&model_id)
            .ok_or_else(|| SimError::not_found(EntityKind::Model, model_id.to_string()))?;
        let scoped = scoped_name([model.scoped_name.as_str(), desc.name.as_str()]);
        validate_link(desc, &scoped, model.is_static)?;
        if self.find_link_in(model_id, &desc.name).is_some() {
            return Err(SimError::duplicate(EntityKind::Link, scoped));
        }

        let id = LinkId(self.next_link);
        self.next_link += 1;
        let mut link = Link {
            id,
            model: model_id,
            name: desc.name.clone(),
            mass: desc.inertial.mass,
            inertia: desc.inertial.inertia.to_matrix(),
            gravity: desc.gravity,
            linear_damping: desc.linear_damping,
            angular_damping: desc.angular_damping,
            self_collide: desc.self_collide,
            collisions: desc.collisions.clone(),
            visuals: desc.visuals.clone(),
            extensions: desc.extensions.clone(),
            pose: model.pose * desc.pose,
            twist: if model.is_static {
                Twist::ZERO
            } else {
                desc.velocity
            },
            pending: PendingSlot::default(),
            // Replaced as soon as the engine issues one.
            handle: BodyHandle::from_raw(u32::MAX),
        };
        let body = self.body_desc(&link, scoped);
        link.handle = self.engine.add_body(&body);
        debug!(link = %body.name, handle = %link.handle, "engine body created");

        self.body_links.insert(link.handle, id);
        self.links.insert(id, link);
        staged.links.push(id);
        if let Some(model) = self.models.get_mut(&model_id) {
            model.links.push(id);
            if model.canonical.is_none() {
                model.canonical = Some((id, desc.pose));
            }
        }
        Ok(id)
    }

    fn body_desc(&self, link: &Link, scoped: String) -> BodyDesc {
        let is_static = self.models.get(&link.model).is_some_and(|m| m.is_static);
        BodyDesc {
            name: scoped,
            pose: link.pose,
            twist: link.twist,
            mass: link.mass,
            inertia: link.inertia,
            kind: if is_static {
                BodyKind::Static
            } else {
                BodyKind::Dynamic
            },
            gravity: link.gravity && !is_static,
            linear_damping: link.linear_damping,
            angular_damping: link.angular_damping,
            shapes: link.collisions.iter().map(|c| c.shape_desc()).collect(),
            collision_group: Some(self.root_of(link.model).0),
            self_collide: link.self_collide,
        }
    }

    /// Add a joint to an existing model.
    pub fn add_joint(&mut self, model: &str, desc: &JointDescription) -> Result<JointId, SimError> {
        self.ensure_idle()?;
        let model = self.resolve_model(model)?;
        let mut staged = Staged::default();
        match self.build_joint(model, desc, &mut staged) {
            Ok(id) => {
                self.commit(&staged);
                Ok(id)
            }
            Err(err) => {
                self.rollback(staged);
                Err(err)
            }
        }
    }

    fn build_joint(
        &mut self,
        model_id: ModelId,
        desc: &JointDescription,
        staged: &mut Staged,
    ) -> Result<JointId, SimError> {
        let model_scope = self
            .models
            .get(&model_id)
            .map(|m| m.scoped_name.clone())
            .ok_or_else(|| SimError::not_found(EntityKind::Model, model_id.to_string()))?;
        let scoped = scoped_name([model_scope.as_str(), desc.name.as_str()]);
        validate_joint(desc, &scoped)?;
        if self.find_joint_in(model_id, &desc.name).is_some() {
            return Err(SimError::duplicate(EntityKind::Joint, scoped));
        }
        let resolve = |name: &str| {
            self.find_link_in(model_id, name).ok_or_else(|| {
                SimError::not_found(EntityKind::Link, scoped_name([model_scope.as_str(), name]))
            })
        };
        let child = resolve(&desc.child)?;
        let parent = desc.parent_link().map(resolve).transpose()?;
        if parent == Some(child) {
            return Err(SimError::InvalidArgument(format!(
                "joint `{scoped}` connects link `{}` to itself",
                desc.child
            )));
        }

        let id = JointId(self.next_joint);
        self.next_joint += 1;
        let mut joint = Joint {
            id,
            model: model_id,
            name: desc.name.clone(),
            kind: desc.kind,
            parent,
            child,
            anchor: desc.anchor,
            axis: desc.axis,
            lower: desc.lower,
            upper: desc.upper,
            damping: desc.damping,
            extensions: desc.extensions.clone(),
            pending_effort: 0.0,
            position: 0.0,
            velocity: 0.0,
            handle: ConstraintHandle::from_raw(u32::MAX),
        };
        let constraint = self.constraint_desc(&joint, scoped)?;
        joint.handle = self
            .engine
            .add_constraint(&constraint)
            .map_err(from_engine)?;
        debug!(joint = %constraint.name, handle = %joint.handle, "engine constraint created");

        self.joints.insert(id, joint);
        staged.joints.push(id);
        if let Some(model) = self.models.get_mut(&model_id) {
            model.joints.push(id);
        }
        Ok(id)
    }

    /// Engine description of a joint, with anchor and axis taken to world
    /// coordinates through the child's cached pose.
    fn constraint_desc(&self, joint: &Joint, scoped: String) -> Result<ConstraintDesc, SimError> {
        let body = |id: LinkId| {
            self.links
                .get(&id)
                .ok_or_else(|| SimError::not_found(EntityKind::Link, id.to_string()))
        };
        let child = body(joint.child)?;
        let parent = joint.parent.map(body).transpose()?;
        Ok(ConstraintDesc {
            name: scoped,
            kind: joint.kind,
            parent: parent.map(|p| p.handle),
            child: child.handle,
            anchor: child.pose.transform_point(joint.anchor),
            axis: child.pose.rotate_vector(joint.axis),
            lower: joint.lower,
            upper: joint.upper,
            damping: joint.damping,
        })
    }

    fn commit(&mut self, staged: &Staged) {
        for id in &staged.models {
            if let Some(name) = self.models.get(id).map(|m| m.scoped_name.clone()) {
                debug!(model = %name, "model added");
                self.log(WorldEvent::ModelAdded { id: *id, name });
            }
        }
        for id in &staged.links {
            if let Some(name) = self.link_scoped_name(*id) {
                self.log(WorldEvent::LinkAdded { id: *id, name });
            }
        }
        for id in &staged.joints {
            if let Some(name) = self.joint_scoped_name(*id) {
                self.log(WorldEvent::JointAdded { id: *id, name });
            }
        }
    }

    /// Undo a partial insertion, releasing engine handles in reverse order.
    fn rollback(&mut self, staged: Staged) {
        for id in staged.joints.iter().rev() {
            if let Some(joint) = self.joints.remove(id) {
                if let Err(err) = self.engine.remove_constraint(joint.handle) {
                    warn!(joint = %joint.name, %err, "rollback could not release constraint");
                }
                if let Some(model) = self.models.get_mut(&joint.model) {
                    model.joints.retain(|j| j != id);
                }
            }
        }
        for id in staged.links.iter().rev() {
            if let Some(link) = self.links.remove(id) {
                if let Err(err) = self.engine.remove_body(link.handle) {
                    warn!(link = %link.name, %err, "rollback could not release body");
                }
                self.body_links.remove(&link.handle);
                if let Some(model) = self.models.get_mut(&link.model) {
                    model.links.retain(|l| l != id);
                    if model.canonical.is_some_and(|(c, _)| c == *id) {
                        model.canonical = None;
                    }
                }
            }
        }
        for id in staged.models.iter().rev() {
            if let Some(model) = self.models.remove(id) {
                if let Some(parent) = model.parent.and_then(|p| self.models.get_mut(&p)) {
                    parent.children.retain(|c| c != id);
                }
            }
        }
        debug!(
            models = staged.models.len(),
            links = staged.links.len(),
            joints = staged.joints.len(),
            "insertion rolled back"
        );
    }

    fn joint_scoped_name(&self, id: JointId) -> Option<String> {
        let joint = self.joints.get(&id)?;
        let model = self.models.get(&joint.model)?;
        Some(scoped_name([model.scoped_name.as_str(), joint.name.as_str()]))
    }

    /// Remove a model, its nested models, links and joints, and release
    /// every engine handle they held.
    pub fn remove_model(&mut self, name: &str) -> Result<(), SimError> {
        self.ensure_idle()?;
        let id = self.resolve_model(name)?;
        self.release_model(id)
    }

    fn release_model(&mut self, id: ModelId) -> Result<(), SimError> {
        let subtree = self.subtree(id);
        for model in subtree.iter().rev() {
            let links = self
                .models
                .get(model)
                .map(|m| m.links.clone())
                .unwrap_or_default();
            for link in links.into_iter().rev() {
                self.release_link(link)?;
            }
        }
        for model_id in subtree.iter().rev() {
            if let Some(model) = self.models.remove(model_id) {
                if let Some(parent) = model.parent.and_then(|p| self.models.get_mut(&p)) {
                    parent.children.retain(|c| c != model_id);
                }
                debug!(model = %model.scoped_name, "model removed");
                self.log(WorldEvent::ModelRemoved {
                    id: *model_id,
                    name: model.scoped_name,
                });
            }
        }
        Ok(())
    }

    /// Remove a link and every joint attached to it.
    pub fn remove_link(&mut self, model: &str, name: &str) -> Result<(), SimError> {
        self.ensure_idle()?;
        let id = self.link(model, name)?.id;
        self.release_link(id)
    }

    fn release_link(&mut self, id: LinkId) -> Result<(), SimError> {
        let attached: Vec<JointId> = self
            .joints
            .values()
            .filter(|j| j.involves(id))
            .map(|j| j.id)
            .collect();
        for joint in attached {
            self.release_joint(joint)?;
        }
        let name = self.link_scoped_name(id).unwrap_or_default();
        let Some(link) = self.links.remove(&id) else {
            return Err(SimError::not_found(EntityKind::Link, id.to_string()));
        };
        self.body_links.remove(&link.handle);
        self.contacts.retain(|c| !c.involves(id));
        self.engine.remove_body(link.handle)?;
        debug!(link = %name, handle = %link.handle, "engine body released");

        let links = &self.links;
        if let Some(model) = self.models.get_mut(&link.model) {
            model.links.retain(|l| *l != id);
            if model.canonical.is_some_and(|(c, _)| c == id) {
                // The next remaining link keeps the model frame where it is.
                model.canonical = model.links.first().and_then(|next| {
                    let next_pose = links.get(next)?.pose;
                    Some((*next, model.pose.inverse() * next_pose))
                });
            }
        }
        self.log(WorldEvent::LinkRemoved { id, name });
        Ok(())
    }

    pub fn remove_joint(&mut self, model: &str, name: &str) -> Result<(), SimError> {
        self.ensure_idle()?;
        let id = self.joint(model, name)?.id;
        self.release_joint(id)
    }

    fn release_joint(&mut self, id: JointId) -> Result<(), SimError> {
        let name = self.joint_scoped_name(id).unwrap_or_default();
        let Some(joint) = self.joints.remove(&id) else {
            return Err(SimError::not_found(EntityKind::Joint, id.to_string()));
        };
        self.engine.remove_constraint(joint.handle)?;
        debug!(joint = %name, handle = %joint.handle, "engine constraint released");
        if let Some(model) = self.models.get_mut(&joint.model) {
            model.joints.retain(|j| *j != id);
        }
        self.log(WorldEvent::JointRemoved { id, name });
        Ok(())
    }

    /// Move a model and everything nested in it rigidly to `pose`.
    ///
    /// The model pose changes immediately; its links receive pose overrides
    /// that the next sub-step applies. Fails with [`SimError::Busy`] from
    /// inside a step hook.
    pub fn set_model_pose(&mut self, name: &str, pose: Pose) -> Result<(), SimError> {
        if !pose.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "model `{name}` pose is not finite"
            )));
        }
        self.ensure_idle()?;
        let id = self.resolve_model(name)?;
        let old = self
            .models
            .get(&id)
            .map(|m| m.pose)
            .ok_or_else(|| SimError::not_found(EntityKind::Model, name))?;
        let delta = pose * old.inverse();
        for model_id in self.subtree(id) {
            let Some(model) = self.models.get_mut(&model_id) else {
                continue;
            };
            model.pose = if model_id == id {
                pose
            } else {
                delta * model.pose
            };
            for link_id in model.links.clone() {
                if let Some(link) = self.links.get_mut(&link_id) {
                    link.pending.pose = Some(delta * link.effective_pose());
                }
            }
        }
        Ok(())
    }

    // -- link and joint state ---------------------------------------------

    fn link_mut(&mut self, id: LinkId) -> Result<&mut Link, SimError> {
        self.links
            .get_mut(&id)
            .ok_or_else(|| SimError::not_found(EntityKind::Link, id.to_string()))
    }

    /// Queue a pose override for the next sub-step.
    pub fn set_link_pose(&mut self, id: LinkId, pose: Pose) -> Result<(), SimError> {
        if !pose.is_finite() {
            return Err(SimError::InvalidArgument(format!("{id} pose is not finite")));
        }
        self.link_mut(id)?.pending.pose = Some(pose);
        Ok(())
    }

    /// Queue a velocity override for the next sub-step.
    pub fn set_link_velocity(&mut self, id: LinkId, twist: Twist) -> Result<(), SimError> {
        if !twist.is_finite() {
            return Err(SimError::InvalidArgument(format!("{id} twist is not finite")));
        }
        self.link_mut(id)?.pending.twist = Some(twist);
        Ok(())
    }

    /// Accumulate a world-frame force at the center of mass and a torque.
    /// The sum acts during the next sub-step only.
    pub fn apply_force(&mut self, id: LinkId, force: DVec3, torque: DVec3) -> Result<(), SimError> {
        if !(force.is_finite() && torque.is_finite()) {
            return Err(SimError::InvalidArgument(format!("{id} wrench is not finite")));
        }
        self.link_mut(id)?.pending.wrench += Wrench::new(force, torque);
        Ok(())
    }

    /// Accumulate a joint torque (revolute) or force (prismatic) for the
    /// next sub-step.
    pub fn apply_joint_effort(&mut self, id: JointId, effort: f64) -> Result<(), SimError> {
        if !effort.is_finite() {
            return Err(SimError::InvalidArgument(format!("{id} effort is not finite")));
        }
        let joint = self
            .joints
            .get_mut(&id)
            .ok_or_else(|| SimError::not_found(EntityKind::Joint, id.to_string()))?;
        joint.pending_effort += effort;
        Ok(())
    }

    pub fn link_sample(&self, id: LinkId) -> Result<LinkSample, SimError> {
        let link = self
            .links
            .get(&id)
            .ok_or_else(|| SimError::not_found(EntityKind::Link, id.to_string()))?;
        Ok(LinkSample {
            link: id,
            time: self.sim_time(),
            iteration: self.iterations,
            pose: link.pose,
            twist: link.twist,
        })
    }

    // -- stepping ----------------------------------------------------------

    /// Contacts produced by the most recent sub-step.
    pub fn contacts(&self) -> &[ContactEvent] {
        &self.contacts
    }

    /// Register a closure to run after every sub-step.
    pub fn add_step_hook(&mut self, hook: impl FnMut(&mut World) + Send + Sync + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn clear_step_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn step_hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Advance the simulation by `n` sub-steps of the fixed step size.
    ///
    /// `step(0)` changes nothing. If the engine fails at sub-step `k`, cached
    /// state stays at sub-step `k - 1`, the world is marked diverged and every
    /// later call fails with [`SimError::SimulationDiverged`] until
    /// [`World::reset`].
    pub fn step(&mut self, n: u64) -> Result<(), SimError> {
        self.ensure_idle()?;
        if let Some(detail) = &self.diverged {
            return Err(SimError::SimulationDiverged(detail.clone()));
        }
        if n == 0 {
            return Ok(());
        }
        let _span = tracing::info_span!("world_step", world = %self.config.name, n).entered();

        self.apply_settings();
        let dt = self.active_step;
        let result = {
            let mut guard = Stepping::enter(self);
            let Stepping { world, hooks } = &mut guard;
            world.run_substeps(n, dt, hooks)
        };
        result?;

        self.log(WorldEvent::Stepped {
            iterations: self.iterations,
            sim_time: self.sim_time(),
        });
        Ok(())
    }

    /// Gravity and step-size changes are picked up here, once per `step`.
    fn apply_settings(&mut self) {
        if self.engine.gravity() != self.config.gravity {
            self.engine.set_gravity(self.config.gravity);
        }
        if self.config.step_size != self.active_step {
            self.base_time = self.sim_time();
            self.steps_since_base = 0;
            self.active_step = self.config.step_size;
        }
    }

    fn run_substeps(&mut self, n: u64, dt: f64, hooks: &mut [StepHook]) -> Result<(), SimError> {
        for _ in 0..n {
            self.push_pending()?;
            if let Err(err) = self.engine.step(dt) {
                return Err(self.diverge(err));
            }
            self.refresh()?;
            self.steps_since_base += 1;
            self.iterations += 1;
            trace!(
                iteration = self.iterations,
                contacts = self.contacts.len(),
                "sub-step"
            );
            for hook in hooks.iter_mut() {
                hook(self);
            }
        }
        Ok(())
    }

    fn push_pending(&mut self) -> Result<(), SimError> {
        let engine = &mut self.engine;
        for link in self.links.values_mut() {
            if link.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut link.pending);
            if let Some(pose) = pending.pose {
                engine.set_pose(link.handle, pose)?;
            }
            if let Some(twist) = pending.twist {
                engine.set_velocity(link.handle, twist)?;
            }
            if !pending.wrench.is_zero() {
                engine.apply_force(link.handle, pending.wrench.force, pending.wrench.torque)?;
            }
        }
        for joint in self.joints.values_mut() {
            let effort = std::mem::take(&mut joint.pending_effort);
            if effort != 0.0 {
                engine.apply_joint_effort(joint.handle, effort)?;
            }
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), SimError> {
        let engine = &self.engine;
        for link in self.links.values_mut() {
            link.pose = engine.pose(link.handle)?;
            link.twist = engine.velocity(link.handle)?;
        }
        for joint in self.joints.values_mut() {
            let state = engine.joint_state(joint.handle)?;
            joint.position = state.position;
            joint.velocity = state.velocity;
        }
        let links = &self.links;
        for model in self.models.values_mut() {
            if let Some((canonical, offset)) = model.canonical {
                if let Some(link) = links.get(&canonical) {
                    model.pose = link.pose * offset.inverse();
                }
            }
        }

        let body_links = &self.body_links;
        self.contacts = engine
            .contacts()
            .iter()
            .filter_map(|c| {
                let a = *body_links.get(&c.body_a)?;
                let b = *body_links.get(&c.body_b)?;
                Some(ContactEvent {
                    link_a: a,
                    collision_a: links.get(&a)?.collision_name(c.shape_a),
                    link_b: b,
                    collision_b: links.get(&b)?.collision_name(c.shape_b),
                    points: c.points.clone(),
                })
            })
            .collect();
        Ok(())
    }

    fn diverge(&mut self, err: EngineError) -> SimError {
        match err {
            EngineError::Diverged { body, detail } => {
                let detail = format!("{body}: {detail}");
                warn!(
                    world = %self.config.name,
                    iteration = self.iterations,
                    %detail,
                    "simulation diverged"
                );
                self.log(WorldEvent::Diverged {
                    iteration: self.iterations,
                    detail: detail.clone(),
                });
                self.diverged = Some(detail.clone());
                SimError::SimulationDiverged(detail)
            }
            other => from_engine(other),
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Rebuild every engine handle from the cached entity state and clear the
    /// diverged flag. Pending requests are dropped. Joint positions are
    /// measured from the configuration at the time of the reset.
    pub fn reset(&mut self) -> Result<(), SimError> {
        self.ensure_idle()?;
        self.engine.clear();
        self.rebuild()?;
        debug!(world = %self.config.name, "world reset");
        Ok(())
    }

    /// Replace the physics back-end with `name` from the built-in registry.
    pub fn rebind_engine(&mut self, name: &str) -> Result<(), SimError> {
        self.rebind_engine_with(&EngineRegistry::builtin(), name)
    }

    /// Replace the physics back-end and rebuild all handles. On an unknown
    /// backend the world is left untouched.
    pub fn rebind_engine_with(
        &mut self,
        registry: &EngineRegistry,
        name: &str,
    ) -> Result<(), SimError> {
        self.ensure_idle()?;
        let engine = registry
            .create(name, &self.config.engine_params())
            .map_err(from_engine)?;
        warn!(
            world = %self.config.name,
            from = self.engine.kind(),
            to = name,
            "rebinding physics engine"
        );
        self.engine = engine;
        self.config.engine = name.to_string();
        self.rebuild()
    }

    fn rebuild(&mut self) -> Result<(), SimError> {
        self.engine.set_gravity(self.config.gravity);
        self.body_links.clear();
        self.contacts.clear();

        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in link_ids {
            let Some(link) = self.links.get(&id) else {
                continue;
            };
            let scoped = self.link_scoped_name(id).unwrap_or_default();
            let body = self.body_desc(link, scoped);
            let handle = self.engine.add_body(&body);
            self.body_links.insert(handle, id);
            if let Some(link) = self.links.get_mut(&id) {
                link.handle = handle;
                link.pending = PendingSlot::default();
            }
        }

        let joint_ids: Vec<JointId> = self.joints.keys().copied().collect();
        for id in joint_ids {
            let Some(joint) = self.joints.get(&id) else {
                continue;
            };
            let scoped = self.joint_scoped_name(id).unwrap_or_default();
            let constraint = self.constraint_desc(joint, scoped)?;
            let handle = self
                .engine
                .add_constraint(&constraint)
                .map_err(from_engine)?;
            if let Some(joint) = self.joints.get_mut(&id) {
                joint.handle = handle;
                joint.pending_effort = 0.0;
                joint.position = 0.0;
                joint.velocity = 0.0;
            }
        }

        self.diverged = None;
        self.log(WorldEvent::Reset {
            engine: self.engine.kind().to_string(),
        });
        Ok(())
    }

    // -- editor interface ----------------------------------------------------

    /// Spawn a model from its description.
    pub fn spawn_entity(&mut self, desc: ModelDescription) -> Result<ModelId, SimError> {
        self.add_model(&desc)
    }

    /// Remove a model, `model::link` or `model::joint`.
    pub fn remove_entity(&mut self, name: &str) -> Result<(), SimError> {
        self.ensure_idle()?;
        match self.resolve(name)? {
            EntityRef::Model(id) => self.release_model(id),
            EntityRef::Link(id) => self.release_link(id),
            EntityRef::Joint(id) => self.release_joint(id),
        }
    }

    /// Describe the current state of a model, link or joint.
    pub fn entity_description(&self, name: &str) -> Result<EntityDescription, SimError> {
        let description = match self.resolve(name)? {
            EntityRef::Model(id) => self.describe_model(id).map(EntityDescription::Model),
            EntityRef::Link(id) => self.describe_link(id).map(EntityDescription::Link),
            EntityRef::Joint(id) => self.describe_joint(id).map(EntityDescription::Joint),
        };
        description.ok_or_else(|| SimError::not_found(EntityKind::Entity, name))
    }

    /// The whole world as a scene description.
    pub fn scene_description(&self) -> SceneDescription {
        SceneDescription {
            world: self.config.clone(),
            models: self
                .models()
                .filter_map(|m| self.describe_model(m.id))
                .collect(),
            extensions: self.extensions.clone(),
        }
    }

    fn describe_model(&self, id: ModelId) -> Option<ModelDescription> {
        let model = self.models.get(&id)?;
        let parent_pose = match model.parent {
            Some(p) => self.models.get(&p)?.pose,
            None => Pose::IDENTITY,
        };
        let parent_static = model
            .parent
            .and_then(|p| self.models.get(&p))
            .is_some_and(|p| p.is_static);
        Some(ModelDescription {
            name: model.name.clone(),
            pose: parent_pose.inverse() * model.pose,
            is_static: model.is_static && !parent_static,
            links: model
                .links
                .iter()
                .filter_map(|l| self.describe_link(*l))
                .collect(),
            joints: model
                .joints
                .iter()
                .filter_map(|j| self.describe_joint(*j))
                .collect(),
            models: model
                .children
                .iter()
                .filter_map(|c| self.describe_model(*c))
                .collect(),
            extensions: model.extensions.clone(),
        })
    }

    fn describe_link(&self, id: LinkId) -> Option<LinkDescription> {
        let link = self.links.get(&id)?;
        let model = self.models.get(&link.model)?;
        Some(LinkDescription {
            name: link.name.clone(),
            pose: model.pose.inverse() * link.effective_pose(),
            velocity: link.effective_twist(),
            inertial: Inertial {
                mass: link.mass,
                inertia: InertiaTensor::from_matrix(link.inertia),
            },
            gravity: link.gravity,
            linear_damping: link.linear_damping,
            angular_damping: link.angular_damping,
            self_collide: link.self_collide,
            collisions: link.collisions.clone(),
            visuals: link.visuals.clone(),
            extensions: link.extensions.clone(),
        })
    }

    fn describe_joint(&self, id: JointId) -> Option<JointDescription> {
        let joint = self.joints.get(&id)?;
        let parent = match joint.parent {
            Some(p) => Some(self.relative_link_name(joint.model, p)?),
            None => None,
        };
        Some(JointDescription {
            name: joint.name.clone(),
            kind: joint.kind,
            parent,
            child: self.relative_link_name(joint.model, joint.child)?,
            anchor: joint.anchor,
            axis: joint.axis,
            lower: joint.lower,
            upper: joint.upper,
            damping: joint.damping,
            extensions: joint.extensions.clone(),
        })
    }

    /// Name of `link` as seen from `model` (`inner::link` for nested links).
    fn relative_link_name(&self, model: ModelId, link: LinkId) -> Option<String> {
        let link = self.links.get(&link)?;
        let mut segments = vec![link.name.as_str()];
        let mut current = link.model;
        while current != model {
            let m = self.models.get(&current)?;
            segments.push(m.name.as_str());
            current = m.parent?;
        }
        segments.reverse();
        Some(scoped_name(segments))
    }

    // -- events --------------------------------------------------------------

    /// Append to the event log, dropping the oldest record once it holds
    /// [`EVENT_LOG_CAPACITY`] events.
    fn log(&mut self, event: WorldEvent) {
        if self.event_log.len() == EVENT_LOG_CAPACITY {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Drain and return the event log, oldest first.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        self.event_log.drain(..).collect()
    }

    pub fn events(&self) -> impl ExactSizeIterator<Item = &WorldEvent> {
        self.event_log.iter()
    }

    /// FNV-1a hash of time and cached link and joint state, for comparing
    /// runs.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mix = |h: &mut u64, bytes: &[u8]| {
            for &b in bytes {
                *h ^= b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        let mix_vec = |h: &mut u64, v: DVec3| {
            for c in v.to_array() {
                mix(h, &c.to_le_bytes());
            }
        };
        mix(&mut h, &self.iterations.to_le_bytes());
        mix(&mut h, &self.sim_time().to_le_bytes());
        for (id, link) in &self.links {
            mix(&mut h, &id.0.to_le_bytes());
            mix_vec(&mut h, link.pose.position);
            for c in link.pose.rotation().to_array() {
                mix(&mut h, &c.to_le_bytes());
            }
            mix_vec(&mut h, link.twist.linear);
            mix_vec(&mut h, link.twist.angular);
        }
        for (id, joint) in &self.joints {
            mix(&mut h, &id.0.to_le_bytes());
            mix(&mut h, &joint.position.to_le_bytes());
            mix(&mut h, &joint.velocity.to_le_bytes());
        }
        h
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("name", &self.config.name)
            .field("engine", &self.engine.kind())
            .field("sim_time", &self.sim_time())
            .field("iterations", &self.iterations)
            .field("models", &self.models.len())
            .field("links", &self.links.len())
            .field("joints", &self.joints.len())
            .field("diverged", &self.diverged)
            .finish()
    }
}

// -- description validation ------------------------------------------------

fn validate_model(desc: &ModelDescription, scoped: &str, parent_static: bool) -> Result<(), SimError> {
    let is_static = parent_static || desc.is_static;
    if desc.name.is_empty() || desc.name.contains(SCOPE_DELIMITER) {
        return Err(SimError::InvalidArgument(format!(
            "model name `{}` must be non-empty and unscoped",
            desc.name
        )));
    }
    if !desc.pose.is_finite() {
        return Err(SimError::InvalidArgument(format!("model `{scoped}` pose is not finite")));
    }
    unique_names(desc.links.iter().map(|l| l.name.as_str()), EntityKind::Link, scoped)?;
    unique_names(desc.joints.iter().map(|j| j.name.as_str()), EntityKind::Joint, scoped)?;
    unique_names(desc.models.iter().map(|m| m.name.as_str()), EntityKind::Model, scoped)?;
    for link in &desc.links {
        validate_link(link, &scoped_name([scoped, link.name.as_str()]), is_static)?;
    }
    for nested in &desc.models {
        validate_model(nested, &scoped_name([scoped, nested.name.as_str()]), is_static)?;
    }
    for joint in &desc.joints {
        let joint_scope = scoped_name([scoped, joint.name.as_str()]);
        validate_joint(joint, &joint_scope)?;
        let mut ends = vec![joint.child.as_str()];
        ends.extend(joint.parent_link());
        for end in ends {
            if !describes_link(desc, end) {
                return Err(SimError::not_found(EntityKind::Link, scoped_name([scoped, end])));
            }
        }
    }
    Ok(())
}

fn unique_names<'a>(
    names: impl Iterator<Item = &'a str>,
    kind: EntityKind,
    scope: &str,
) -> Result<(), SimError> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(SimError::duplicate(kind, scoped_name([scope, name])));
        }
    }
    Ok(())
}

/// Whether a relative link name resolves inside a model description.
fn describes_link(desc: &ModelDescription, name: &str) -> bool {
    match name.split_once(SCOPE_DELIMITER) {
        Some((model, rest)) => desc
            .models
            .iter()
            .any(|m| m.name == model && describes_link(m, rest)),
        None => desc.links.iter().any(|l| l.name == name),
    }
}

fn validate_link(desc: &LinkDescription, scoped: &str, is_static: bool) -> Result<(), SimError> {
    if desc.name.is_empty() || desc.name.contains(SCOPE_DELIMITER) {
        return Err(SimError::InvalidArgument(format!(
            "link name `{}` must be non-empty and unscoped",
            desc.name
        )));
    }
    if !desc.pose.is_finite() || !desc.velocity.is_finite() {
        return Err(SimError::InvalidArgument(format!(
            "link `{scoped}` initial state is not finite"
        )));
    }
    if is_static {
        return Ok(());
    }
    let mass = desc.inertial.mass;
    if !(mass.is_finite() && mass > 0.0) {
        return Err(SimError::InvalidArgument(format!(
            "link `{scoped}` mass must be positive, got {mass}"
        )));
    }
    let i = desc.inertial.inertia;
    let diagonal = [i.ixx, i.iyy, i.izz];
    if diagonal.iter().any(|d| !(d.is_finite() && *d > 0.0))
        || ![i.ixy, i.ixz, i.iyz].iter().all(|d| d.is_finite())
    {
        return Err(SimError::InvalidArgument(format!(
            "link `{scoped}` inertia must have positive principal moments"
        )));
    }
    Ok(())
}

fn validate_joint(desc: &JointDescription, scoped: &str) -> Result<(), SimError> {
    if desc.name.is_empty() || desc.name.contains(SCOPE_DELIMITER) {
        return Err(SimError::InvalidArgument(format!(
            "joint name `{}` must be non-empty and unscoped",
            desc.name
        )));
    }
    if matches!(desc.kind, JointKind::Revolute | JointKind::Prismatic)
        && !(desc.axis.is_finite() && desc.axis.length_squared() > 1e-12)
    {
        return Err(SimError::InvalidArgument(format!(
            "joint `{scoped}` axis must be a non-zero vector"
        )));
    }
    if let (Some(lo), Some(hi)) = (desc.lower, desc.upper) {
        if lo > hi {
            return Err(SimError::InvalidArgument(format!(
                "joint `{scoped}` lower limit {lo} exceeds upper limit {hi}"
            )));
        }
    }
    if !(desc.damping.is_finite() && desc.damping >= 0.0) || !desc.anchor.is_finite() {
        return Err(SimError::InvalidArgument(format!(
            "joint `{scoped}` damping and anchor must be finite"
        )));
    }
    if desc.parent_link() == Some(desc.child.as_str()) {
        return Err(SimError::InvalidArgument(format!(
            "joint `{scoped}` connects link `{}` to itself",
            desc.child
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::CollisionDescription;
    use approx::assert_abs_diff_eq;
    use robosim_physics::Shape;
    use std::sync::{Arc, Mutex};

    fn world() -> World {
        World::new(WorldConfig::default()).unwrap()
    }

    fn ball(name: &str, z: f64) -> ModelDescription {
        let sphere = Shape::Sphere { radius: 0.1 };
        ModelDescription::new(name)
            .with_pose(Pose::from_position(DVec3::new(0.0, 0.0, z)))
            .with_link(
                LinkDescription::new("body")
                    .with_inertial(Inertial::of_shape(1.0, &sphere))
                    .with_collision(CollisionDescription::new("sphere", sphere)),
            )
    }

    fn arm() -> ModelDescription {
        let inertial = Inertial {
            mass: 1.0,
            inertia: InertiaTensor::diagonal(DVec3::splat(0.01)),
        };
        ModelDescription::new("arm")
            .with_link(
                LinkDescription::new("upper")
                    .with_pose(Pose::from_position(DVec3::new(0.0, 0.5, 0.0)))
                    .with_inertial(inertial),
            )
            .with_link(
                LinkDescription::new("lower")
                    .with_pose(Pose::from_position(DVec3::new(0.0, 1.5, 0.0)))
                    .with_inertial(inertial),
            )
            .with_joint(
                JointDescription::new("shoulder", JointKind::Revolute, None, "upper")
                    .with_anchor(DVec3::new(0.0, -0.5, 0.0))
                    .with_axis(DVec3::X),
            )
            .with_joint(
                JointDescription::new("elbow", JointKind::Revolute, Some("upper"), "lower")
                    .with_anchor(DVec3::new(0.0, -0.5, 0.0))
                    .with_axis(DVec3::X),
            )
    }

    #[test]
    fn world_starts_empty() {
        let w = world();
        assert_eq!(w.sim_time(), 0.0);
        assert_eq!(w.iterations(), 0);
        assert_eq!(w.model_count(), 0);
        assert!(w.contacts().is_empty());
        assert_eq!(w.engine_kind(), "xpbd");
    }

    #[test]
    fn unknown_backend_is_unsupported() {
        let config = WorldConfig {
            engine: "bullet".into(),
            ..WorldConfig::default()
        };
        let err = World::new(config).err().unwrap();
        assert_eq!(err, SimError::UnsupportedBackend("bullet".into()));
    }

    #[test]
    fn step_advances_time_exactly() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        w.step(7).unwrap();
        assert_eq!(w.sim_time(), 7.0 * 0.001);
        assert_eq!(w.iterations(), 7);

        let hash = w.state_hash();
        let time = w.sim_time();
        w.step(0).unwrap();
        assert_eq!(w.state_hash(), hash);
        assert_eq!(w.sim_time(), time);
    }

    #[test]
    fn step_size_change_applies_from_next_step() {
        let mut w = world();
        w.step(10).unwrap();
        w.set_step_size(0.01).unwrap();
        assert_eq!(w.sim_time(), 10.0 * 0.001);
        w.step(2).unwrap();
        assert_abs_diff_eq!(w.sim_time(), 0.01 + 0.02, epsilon = 1e-15);
        assert!(w.set_step_size(0.0).is_err());
    }

    #[test]
    fn add_then_remove_releases_handles() {
        let mut w = world();
        w.add_model(&arm()).unwrap();
        assert_eq!(w.engine().body_count(), 2);
        assert_eq!(w.engine().constraint_count(), 2);

        w.remove_model("arm").unwrap();
        assert!(matches!(w.model("arm"), Err(SimError::NotFound { .. })));
        assert_eq!(w.engine().body_count(), 0);
        assert_eq!(w.engine().constraint_count(), 0);
        assert_eq!(w.link_count(), 0);
        assert_eq!(w.joint_count(), 0);

        let again = w.remove_model("arm").unwrap_err();
        assert_eq!(
            again,
            SimError::NotFound {
                kind: EntityKind::Model,
                name: "arm".into()
            }
        );
    }

    #[test]
    fn duplicate_model_leaves_hierarchy_unchanged() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        let hash = w.state_hash();
        let err = w.add_model(&ball("ball", 5.0)).unwrap_err();
        assert!(matches!(err, SimError::DuplicateName { kind: EntityKind::Model, .. }));
        assert_eq!(w.model_count(), 1);
        assert_eq!(w.engine().body_count(), 1);
        assert_eq!(w.state_hash(), hash);
    }

    #[test]
    fn failed_insertion_rolls_back() {
        let mut w = world();
        let broken = arm().with_joint(JointDescription::new(
            "wrist",
            JointKind::Revolute,
            Some("lower"),
            "hand",
        ));
        let err = w.add_model(&broken).unwrap_err();
        assert_eq!(
            err,
            SimError::NotFound {
                kind: EntityKind::Link,
                name: "arm::hand".into()
            }
        );
        assert_eq!(w.model_count(), 0);
        assert_eq!(w.engine().body_count(), 0);
        assert_eq!(w.events().len(), 0);

        // A joint added later that fails leaves the model intact.
        w.add_model(&arm()).unwrap();
        let bad_axis = JointDescription::new("twist", JointKind::Prismatic, Some("upper"), "lower")
            .with_axis(DVec3::ZERO);
        assert!(matches!(
            w.add_joint("arm", &bad_axis),
            Err(SimError::InvalidArgument(_))
        ));
        assert_eq!(w.engine().constraint_count(), 2);
    }

    #[test]
    fn removing_a_link_removes_its_joints() {
        let mut w = world();
        w.add_model(&arm()).unwrap();
        w.remove_link("arm", "upper").unwrap();
        assert_eq!(w.joint_count(), 0);
        assert_eq!(w.engine().constraint_count(), 0);
        assert_eq!(w.engine().body_count(), 1);
        assert!(w.joint("arm", "elbow").is_err());
        assert!(w.remove_link("arm", "upper").is_err());
        // The model follows its remaining link from now on.
        assert_eq!(w.model("arm").unwrap().links().len(), 1);
    }

    #[test]
    fn nested_models_resolve_by_scoped_name() {
        let mut w = world();
        let outer = ModelDescription::new("outer")
            .with_pose(Pose::from_position(DVec3::new(1.0, 0.0, 0.0)))
            .with_model(ball("inner", 2.0));
        w.add_model(&outer).unwrap();

        let inner = w.model("outer::inner").unwrap();
        assert_eq!(inner.scoped_name(), "outer::inner");
        let body = w.link("outer", "inner::body").unwrap();
        assert_eq!(body.pose().position, DVec3::new(1.0, 0.0, 2.0));
        assert_eq!(w.models().count(), 1);

        w.remove_entity("outer::inner").unwrap();
        assert!(w.model("outer").unwrap().models().is_empty());
        assert_eq!(w.engine().body_count(), 0);
    }

    #[test]
    fn busy_guard_rejects_mutation_from_hook() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        w.add_step_hook(move |world| {
            let result = world.remove_model("ball");
            sink.lock().unwrap().push(result);
        });
        w.step(2).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen
            .iter()
            .all(|r| matches!(r, Err(SimError::Busy { world }) if world == "default")));
        assert!(w.model("ball").is_ok());
        assert!(!w.is_stepping());
        w.remove_model("ball").unwrap();
    }

    #[test]
    fn model_pose_is_frozen_inside_hooks() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        w.add_step_hook(move |world| {
            let result = world.set_model_pose("ball", Pose::from_position(DVec3::Z * 9.0));
            sink.lock().unwrap().push(result);
        });
        w.step(1).unwrap();

        assert!(matches!(seen.lock().unwrap()[0], Err(SimError::Busy { .. })));
        assert!(w.model("ball").unwrap().pose().position.z < 2.0);
    }

    #[test]
    fn panicking_hook_leaves_world_idle() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        w.add_step_hook(|_| panic!("hook failed"));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| w.step(1)));
        assert!(outcome.is_err());

        assert!(!w.is_stepping());
        assert_eq!(w.step_hook_count(), 1);
        w.clear_step_hooks();
        w.remove_model("ball").unwrap();
        w.step(1).unwrap();
    }

    #[test]
    fn event_log_stays_bounded() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        for _ in 0..3 * EVENT_LOG_CAPACITY {
            w.step(1).unwrap();
        }
        assert_eq!(w.events().len(), EVENT_LOG_CAPACITY);
        assert!(matches!(
            w.events().next(),
            Some(WorldEvent::Stepped { .. })
        ));
        assert_eq!(
            w.events().last(),
            Some(&WorldEvent::Stepped {
                iterations: w.iterations(),
                sim_time: w.sim_time()
            })
        );
        assert_eq!(w.drain_events().len(), EVENT_LOG_CAPACITY);
        assert_eq!(w.events().len(), 0);
    }

    #[test]
    fn hooks_may_queue_forces() {
        let config = WorldConfig {
            name: "thrust".into(),
            gravity: DVec3::ZERO,
            ..WorldConfig::default()
        };
        let mut w = World::new(config).unwrap();
        let id = w.add_model(&ball("ball", 1.0)).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];
        w.add_step_hook(move |world| {
            world.apply_force(link, DVec3::X, DVec3::ZERO).unwrap();
        });
        w.step(1).unwrap();
        // The hook's force acts during the second sub-step only.
        assert_eq!(w.link_by_id(link).unwrap().twist().linear.x, 0.0);
        w.step(1).unwrap();
        assert!(w.link_by_id(link).unwrap().twist().linear.x > 0.0);
    }

    #[test]
    fn divergence_is_sticky_until_reset() {
        let mut w = world();
        let id = w.add_model(&ball("ball", 1.0)).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];
        w.add_step_hook(move |world| {
            if world.iterations() == 3 {
                let runaway = Twist::new(DVec3::new(1.0e9, 0.0, 0.0), DVec3::ZERO);
                world.set_link_velocity(link, runaway).unwrap();
            }
        });
        w.step(2).unwrap();
        w.step(1).unwrap();
        let pose_at_three = w.link_by_id(link).unwrap().pose();

        let err = w.step(10).unwrap_err();
        assert!(matches!(err, SimError::SimulationDiverged(_)));
        assert_eq!(w.iterations(), 3);
        assert_eq!(w.sim_time(), 3.0 * 0.001);
        assert_eq!(w.link_by_id(link).unwrap().pose(), pose_at_three);
        assert!(w.is_diverged());
        assert!(matches!(w.step(1), Err(SimError::SimulationDiverged(_))));

        w.clear_step_hooks();
        w.reset().unwrap();
        assert!(!w.is_diverged());
        w.step(1).unwrap();
        assert_eq!(w.iterations(), 4);
    }

    #[test]
    fn free_fall_matches_gravity() {
        let mut w = world();
        let id = w.add_model(&ball("ball", 10.0)).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];
        w.step(100).unwrap();
        let v = w.link_by_id(link).unwrap().twist().linear;
        assert_abs_diff_eq!(v.z, -9.81 * 100.0 * 0.001, epsilon = 1e-6);
        // The model frame follows its only link.
        let link_z = w.link_by_id(link).unwrap().pose().position.z;
        assert_eq!(w.model("ball").unwrap().pose().position.z, link_z);
    }

    #[test]
    fn gravity_change_applies_from_next_step() {
        let mut w = world();
        w.set_gravity(DVec3::new(0.0, 0.0, -1.0)).unwrap();
        assert_eq!(w.engine().gravity(), DVec3::new(0.0, 0.0, -9.81));
        w.step(1).unwrap();
        assert_eq!(w.engine().gravity(), DVec3::new(0.0, 0.0, -1.0));
        assert!(w.set_gravity(DVec3::NAN).is_err());
    }

    #[test]
    fn contacts_are_scoped_to_the_last_substep() {
        let mut w = world();
        let ground = ModelDescription::new("ground").into_static().with_link(
            LinkDescription::new("plane").with_collision(CollisionDescription::new(
                "surface",
                Shape::Plane { normal: DVec3::Z },
            )),
        );
        w.add_model(&ground).unwrap();
        // Resting exactly on the plane.
        w.add_model(&ball("ball", 0.1)).unwrap();
        assert!(w.contacts().is_empty());

        w.step(1).unwrap();
        let contacts = w.contacts();
        assert_eq!(contacts.len(), 1);
        let names = [contacts[0].collision_a.as_str(), contacts[0].collision_b.as_str()];
        assert!(names.contains(&"surface") && names.contains(&"sphere"));

        let ball_link = w.link("ball", "body").unwrap().id();
        w.set_link_pose(ball_link, Pose::from_position(DVec3::new(0.0, 0.0, 5.0)))
            .unwrap();
        w.step(1).unwrap();
        assert!(w.contacts().is_empty());
    }

    #[test]
    fn set_model_pose_moves_links_rigidly() {
        let config = WorldConfig {
            gravity: DVec3::ZERO,
            ..WorldConfig::default()
        };
        let mut w = World::new(config).unwrap();
        w.add_model(&arm()).unwrap();
        let target = Pose::from_position(DVec3::new(0.0, 0.0, 3.0));
        w.set_model_pose("arm", target).unwrap();
        assert_eq!(w.model("arm").unwrap().pose(), target);
        let lower = w.link("arm", "lower").unwrap();
        assert_eq!(lower.pose().position.z, 0.0);
        assert_eq!(lower.effective_pose().position.z, 3.0);
        assert!(w.set_model_pose("nope", target).is_err());
    }

    #[test]
    fn entity_description_round_trips_extensions() {
        let mut w = world();
        let mut desc = arm();
        desc.extensions
            .insert("plugin".into(), serde_json::json!({"name": "controller"}));
        w.spawn_entity(desc.clone()).unwrap();

        let EntityDescription::Model(back) = w.entity_description("arm").unwrap() else {
            panic!("expected a model description");
        };
        assert_eq!(back.extensions, desc.extensions);
        assert_eq!(back.links.len(), 2);
        assert_eq!(back.joints[1].parent.as_deref(), Some("upper"));
        assert_abs_diff_eq!(back.links[1].pose.position.y, 1.5, epsilon = 1e-12);

        assert!(matches!(
            w.entity_description("arm::elbow").unwrap(),
            EntityDescription::Joint(_)
        ));
        assert!(matches!(
            w.entity_description("arm::missing"),
            Err(SimError::NotFound { kind: EntityKind::Entity, .. })
        ));
    }

    #[test]
    fn remove_entity_addresses_links_and_joints() {
        let mut w = world();
        w.add_model(&arm()).unwrap();
        w.remove_entity("arm::elbow").unwrap();
        assert_eq!(w.engine().constraint_count(), 1);
        w.remove_entity("arm::lower").unwrap();
        assert_eq!(w.engine().body_count(), 1);
        assert!(w.remove_entity("arm::lower").is_err());
    }

    #[test]
    fn rebind_keeps_cached_state() {
        let mut w = world();
        w.add_model(&arm()).unwrap();
        w.step(50).unwrap();
        let before = w.link("arm", "lower").unwrap().pose();
        let time = w.sim_time();

        assert!(matches!(
            w.rebind_engine("ode"),
            Err(SimError::UnsupportedBackend(_))
        ));
        assert_eq!(w.engine_kind(), "xpbd");

        w.rebind_engine("articulated").unwrap();
        assert_eq!(w.engine_kind(), "articulated");
        assert_eq!(w.config().engine, "articulated");
        assert_eq!(w.engine().body_count(), 2);
        assert_eq!(w.engine().constraint_count(), 2);
        assert_eq!(w.link("arm", "lower").unwrap().pose(), before);
        assert_eq!(w.sim_time(), time);
        w.step(10).unwrap();
    }

    #[test]
    fn events_are_recorded() {
        let mut w = world();
        w.add_model(&ball("ball", 1.0)).unwrap();
        w.step(3).unwrap();
        w.remove_model("ball").unwrap();
        let events = w.drain_events();
        assert!(matches!(events[0], WorldEvent::ModelAdded { .. }));
        assert!(matches!(events[1], WorldEvent::LinkAdded { .. }));
        assert_eq!(
            events[2],
            WorldEvent::Stepped {
                iterations: 3,
                sim_time: 3.0 * 0.001
            }
        );
        assert!(matches!(events[3], WorldEvent::LinkRemoved { .. }));
        assert!(matches!(events[4], WorldEvent::ModelRemoved { .. }));
        assert_eq!(w.events().len(), 0);
    }

    #[test]
    fn link_sample_carries_time() {
        let mut w = world();
        let id = w.add_model(&ball("ball", 1.0)).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];
        w.step(4).unwrap();
        let sample = w.link_sample(link).unwrap();
        assert_eq!(sample.iteration, 4);
        assert_eq!(sample.time, w.sim_time());
        assert!(w.link_sample(LinkId(99)).is_err());
    }

    #[test]
    fn invalid_mass_is_rejected() {
        let mut w = world();
        let mut desc = ball("ball", 1.0);
        desc.links[0].inertial.mass = 0.0;
        assert!(matches!(w.add_model(&desc), Err(SimError::InvalidArgument(_))));
        // Static links carry no mass.
        assert!(w.add_model(&desc.into_static()).is_ok());
    }

    #[test]
    fn world_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<World>();
    }
}
