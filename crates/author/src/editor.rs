use robosim_common::{JointId, LinkId, ModelId, Pose, SCOPE_DELIMITER};
use robosim_kernel::{
    EntityDescription, JointDescription, LinkDescription, ModelDescription, SimError, World,
};

/// A recorded edit. Each command carries enough context to revert itself.
#[derive(Debug, Clone, PartialEq)]
pub enum EditCommand {
    /// Insert a top-level model. Revert = remove it.
    SpawnModel { desc: ModelDescription },
    /// Remove a model, link or joint by scoped name. Removal can cascade to
    /// joints, so the whole top-level model is captured beforehand and
    /// revert restores it.
    Remove {
        scoped: String,
        root_before: ModelDescription,
    },
    /// Move a model. Revert = restore the old pose.
    SetModelPose { model: String, old: Pose, new: Pose },
    /// Add a link to an existing model. Revert = remove it.
    AddLink {
        model: String,
        desc: LinkDescription,
    },
    /// Add a joint to an existing model. Revert = remove it.
    AddJoint {
        model: String,
        desc: JointDescription,
    },
}

impl EditCommand {
    fn apply(&self, world: &mut World) -> Result<(), SimError> {
        match self {
            Self::SpawnModel { desc } => world.spawn_entity(desc.clone()).map(drop),
            Self::Remove { scoped, .. } => world.remove_entity(scoped),
            Self::SetModelPose { model, new, .. } => world.set_model_pose(model, *new),
            Self::AddLink { model, desc } => world.add_link(model, desc).map(drop),
            Self::AddJoint { model, desc } => world.add_joint(model, desc).map(drop),
        }
    }

    fn revert(&self, world: &mut World) -> Result<(), SimError> {
        match self {
            Self::SpawnModel { desc } => world.remove_model(&desc.name),
            Self::Remove {
                scoped,
                root_before,
            } => {
                if scoped.contains(SCOPE_DELIMITER) {
                    world.remove_model(&root_before.name)?;
                }
                world.spawn_entity(root_before.clone()).map(drop)
            }
            Self::SetModelPose { model, old, .. } => world.set_model_pose(model, *old),
            Self::AddLink { model, desc } => world.remove_link(model, &desc.name),
            Self::AddJoint { model, desc } => world.remove_joint(model, &desc.name),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error(transparent)]
    World(#[from] SimError),
    #[error("`{0}` does not describe a model")]
    NotAModel(String),
}

/// Undo/redo history over a [`World`]'s editor interface.
///
/// Commands refer to entities by scoped name, so they stay valid across the
/// id changes that undoing a removal causes.
#[derive(Debug, Default)]
pub struct Editor {
    undo_stack: Vec<EditCommand>,
    redo_stack: Vec<EditCommand>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_model(
        &mut self,
        world: &mut World,
        desc: ModelDescription,
    ) -> Result<ModelId, EditError> {
        let id = world.spawn_entity(desc.clone())?;
        self.record(EditCommand::SpawnModel { desc });
        Ok(id)
    }

    /// Remove a model, link or joint.
    pub fn remove(&mut self, world: &mut World, scoped: &str) -> Result<(), EditError> {
        let root = scoped.split(SCOPE_DELIMITER).next().unwrap_or(scoped);
        let root_before = match world.entity_description(root)? {
            EntityDescription::Model(m) => m,
            _ => return Err(EditError::NotAModel(root.to_string())),
        };
        world.remove_entity(scoped)?;
        self.record(EditCommand::Remove {
            scoped: scoped.to_string(),
            root_before,
        });
        Ok(())
    }

    pub fn set_model_pose(
        &mut self,
        world: &mut World,
        model: &str,
        new: Pose,
    ) -> Result<(), EditError> {
        let old = world.model(model)?.pose();
        world.set_model_pose(model, new)?;
        self.record(EditCommand::SetModelPose {
            model: model.to_string(),
            old,
            new,
        });
        Ok(())
    }

    pub fn add_link(
        &mut self,
        world: &mut World,
        model: &str,
        desc: LinkDescription,
    ) -> Result<LinkId, EditError> {
        let id = world.add_link(model, &desc)?;
        self.record(EditCommand::AddLink {
            model: model.to_string(),
            desc,
        });
        Ok(id)
    }

    pub fn add_joint(
        &mut self,
        world: &mut World,
        model: &str,
        desc: JointDescription,
    ) -> Result<JointId, EditError> {
        let id = world.add_joint(model, &desc)?;
        self.record(EditCommand::AddJoint {
            model: model.to_string(),
            desc,
        });
        Ok(id)
    }

    /// Undo the last edit. Returns `Ok(false)` when there is nothing to undo.
    pub fn undo(&mut self, world: &mut World) -> Result<bool, EditError> {
        let Some(cmd) = self.undo_stack.pop() else {
            return Ok(false);
        };
        if let Err(err) = cmd.revert(world) {
            self.undo_stack.push(cmd);
            return Err(err.into());
        }
        tracing::debug!(?cmd, "undo");
        self.redo_stack.push(cmd);
        Ok(true)
    }

    /// Redo the last undone edit. Returns `Ok(false)` when there is nothing
    /// to redo.
    pub fn redo(&mut self, world: &mut World) -> Result<bool, EditError> {
        let Some(cmd) = self.redo_stack.pop() else {
            return Ok(false);
        };
        if let Err(err) = cmd.apply(world) {
            self.redo_stack.push(cmd);
            return Err(err.into());
        }
        tracing::debug!(?cmd, "redo");
        self.undo_stack.push(cmd);
        Ok(true)
    }

    pub fn history(&self) -> &[EditCommand] {
        &self.undo_stack
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    fn record(&mut self, cmd: EditCommand) {
        self.undo_stack.push(cmd);
        self.redo_stack.clear();
    }
}
