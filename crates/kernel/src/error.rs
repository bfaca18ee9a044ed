use robosim_physics::EngineError;
use std::fmt;

/// Kind of entity named in a lookup or insert failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Model,
    Link,
    Joint,
    /// A scoped name that did not resolve to any entity kind.
    Entity,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Model => "model",
            EntityKind::Link => "link",
            EntityKind::Joint => "joint",
            EntityKind::Entity => "entity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: EntityKind, name: String },
    #[error("{kind} `{name}` already exists")]
    DuplicateName { kind: EntityKind, name: String },
    #[error("world `{world}` is stepping")]
    Busy { world: String },
    #[error("physics backend `{0}` is not available")]
    UnsupportedBackend(String),
    #[error("simulation diverged: {0}")]
    SimulationDiverged(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("physics engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SimError {
    pub(crate) fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        SimError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn duplicate(kind: EntityKind, name: impl Into<String>) -> Self {
        SimError::DuplicateName {
            kind,
            name: name.into(),
        }
    }
}

/// Registry and solver failures that callers can act on keep their own
/// variants; everything else is a stale handle and stays wrapped.
pub(crate) fn from_engine(err: EngineError) -> SimError {
    match err {
        EngineError::UnsupportedBackend(name) => SimError::UnsupportedBackend(name),
        EngineError::Diverged { body, detail } => {
            SimError::SimulationDiverged(format!("{body}: {detail}"))
        }
        EngineError::InvalidConstraint { name, reason } => {
            SimError::InvalidArgument(format!("joint `{name}`: {reason}"))
        }
        other => SimError::Engine(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robosim_physics::BodyHandle;

    #[test]
    fn messages_name_the_entity() {
        let err = SimError::not_found(EntityKind::Link, "arm::upper");
        assert_eq!(err.to_string(), "link `arm::upper` not found");
        let err = SimError::duplicate(EntityKind::Model, "box");
        assert_eq!(err.to_string(), "model `box` already exists");
    }

    #[test]
    fn engine_errors_are_classified() {
        assert_eq!(
            from_engine(EngineError::UnsupportedBackend("ode".into())),
            SimError::UnsupportedBackend("ode".into())
        );
        assert!(matches!(
            from_engine(EngineError::Diverged {
                body: "ball".into(),
                detail: "non-finite".into()
            }),
            SimError::SimulationDiverged(_)
        ));
        let stale = EngineError::InvalidBodyHandle(BodyHandle::from_raw(3));
        assert_eq!(from_engine(stale.clone()), SimError::Engine(stale));
    }
}
