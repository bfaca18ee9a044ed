//! Structured scene descriptions exchanged with the editor and scene loader.
//!
//! Every description carries a flattened `extensions` map: fields the kernel
//! does not interpret are kept verbatim and written back unchanged.

use glam::{DMat3, DVec3};
use robosim_common::{Pose, Twist};
use robosim_physics::{JointKind, Shape, ShapeDesc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::WorldConfig;

/// Opaque fields carried through load/save without interpretation.
pub type Extensions = BTreeMap<String, serde_json::Value>;

fn default_true() -> bool {
    true
}

fn default_mass() -> f64 {
    1.0
}

fn default_friction() -> f64 {
    0.8
}

fn default_axis() -> DVec3 {
    DVec3::Z
}

/// A whole scene: world settings plus top-level models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub models: Vec<ModelDescription>,
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// A model and everything it owns. Poses are relative to the parent model
/// (or the world for top-level models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    #[serde(default)]
    pub pose: Pose,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub links: Vec<LinkDescription>,
    #[serde(default)]
    pub joints: Vec<JointDescription>,
    #[serde(default)]
    pub models: Vec<ModelDescription>,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl ModelDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pose: Pose::IDENTITY,
            is_static: false,
            links: Vec::new(),
            joints: Vec::new(),
            models: Vec::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_link(mut self, link: LinkDescription) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_joint(mut self, joint: JointDescription) -> Self {
        self.joints.push(joint);
        self
    }

    pub fn with_model(mut self, model: ModelDescription) -> Self {
        self.models.push(model);
        self
    }

    pub fn into_static(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Symmetric inertia tensor about the center of mass, in the link frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InertiaTensor {
    pub ixx: f64,
    pub ixy: f64,
    pub ixz: f64,
    pub iyy: f64,
    pub iyz: f64,
    pub izz: f64,
}

impl Default for InertiaTensor {
    fn default() -> Self {
        Self::diagonal(DVec3::ONE)
    }
}

impl InertiaTensor {
    pub fn diagonal(d: DVec3) -> Self {
        Self {
            ixx: d.x,
            ixy: 0.0,
            ixz: 0.0,
            iyy: d.y,
            iyz: 0.0,
            izz: d.z,
        }
    }

    pub fn from_matrix(m: DMat3) -> Self {
        Self {
            ixx: m.x_axis.x,
            ixy: m.y_axis.x,
            ixz: m.z_axis.x,
            iyy: m.y_axis.y,
            iyz: m.z_axis.y,
            izz: m.z_axis.z,
        }
    }

    pub fn to_matrix(&self) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(self.ixx, self.ixy, self.ixz),
            DVec3::new(self.ixy, self.iyy, self.iyz),
            DVec3::new(self.ixz, self.iyz, self.izz),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Inertial {
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default)]
    pub inertia: InertiaTensor,
}

impl Default for Inertial {
    fn default() -> Self {
        Self {
            mass: default_mass(),
            inertia: InertiaTensor::default(),
        }
    }
}

impl Inertial {
    /// Mass with the inertia of a solid `shape` of that mass.
    pub fn of_shape(mass: f64, shape: &Shape) -> Self {
        Self {
            mass,
            inertia: InertiaTensor::from_matrix(shape.inertia(mass)),
        }
    }
}

/// A rigid body. The link frame origin is its center of mass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDescription {
    pub name: String,
    #[serde(default)]
    pub pose: Pose,
    /// Initial velocity in world coordinates.
    #[serde(default)]
    pub velocity: Twist,
    #[serde(default)]
    pub inertial: Inertial,
    #[serde(default = "default_true")]
    pub gravity: bool,
    #[serde(default)]
    pub linear_damping: f64,
    #[serde(default)]
    pub angular_damping: f64,
    /// Collide with other links of the same model.
    #[serde(default)]
    pub self_collide: bool,
    #[serde(default)]
    pub collisions: Vec<CollisionDescription>,
    #[serde(default)]
    pub visuals: Vec<VisualDescription>,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl LinkDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pose: Pose::IDENTITY,
            velocity: Twist::ZERO,
            inertial: Inertial::default(),
            gravity: true,
            linear_damping: 0.0,
            angular_damping: 0.0,
            self_collide: false,
            collisions: Vec::new(),
            visuals: Vec::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_inertial(mut self, inertial: Inertial) -> Self {
        self.inertial = inertial;
        self
    }

    pub fn with_collision(mut self, collision: CollisionDescription) -> Self {
        self.collisions.push(collision);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionDescription {
    pub name: String,
    pub geometry: Shape,
    #[serde(default)]
    pub pose: Pose,
    #[serde(default = "default_friction")]
    pub friction: f64,
    #[serde(default)]
    pub restitution: f64,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl CollisionDescription {
    pub fn new(name: impl Into<String>, geometry: Shape) -> Self {
        Self {
            name: name.into(),
            geometry,
            pose: Pose::IDENTITY,
            friction: default_friction(),
            restitution: 0.0,
            extensions: Extensions::new(),
        }
    }

    pub(crate) fn shape_desc(&self) -> ShapeDesc {
        ShapeDesc {
            shape: self.geometry.clone(),
            local_pose: self.pose,
            friction: self.friction,
            restitution: self.restitution,
        }
    }
}

/// Visual geometry is never interpreted by the kernel; `geometry` is an
/// opaque reference (mesh URI, primitive name) for renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualDescription {
    pub name: String,
    #[serde(default)]
    pub geometry: String,
    #[serde(default)]
    pub pose: Pose,
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// A joint between two links of a model, or between a link and the world.
///
/// `parent` and `child` are link names relative to the owning model; links of
/// nested models are addressed with scoped names (`inner::link`). A missing
/// parent, or the name `world`, anchors the child to the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: JointKind,
    #[serde(default)]
    pub parent: Option<String>,
    pub child: String,
    /// Joint origin in the child link frame.
    #[serde(default)]
    pub anchor: DVec3,
    /// Joint axis in the child link frame.
    #[serde(default = "default_axis")]
    pub axis: DVec3,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub damping: f64,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl JointDescription {
    pub fn new(
        name: impl Into<String>,
        kind: JointKind,
        parent: Option<&str>,
        child: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: parent.map(str::to_string),
            child: child.into(),
            anchor: DVec3::ZERO,
            axis: default_axis(),
            lower: None,
            upper: None,
            damping: 0.0,
            extensions: Extensions::new(),
        }
    }

    pub fn with_anchor(mut self, anchor: DVec3) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn with_axis(mut self, axis: DVec3) -> Self {
        self.axis = axis;
        self
    }

    pub fn with_limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }

    /// Parent link name, or `None` when anchored to the world.
    pub fn parent_link(&self) -> Option<&str> {
        self.parent.as_deref().filter(|p| *p != WORLD_ANCHOR)
    }
}

/// Reserved parent name for joints anchored to the world.
pub const WORLD_ANCHOR: &str = "world";

/// Description of any addressable entity, as returned by
/// `World::entity_description`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityDescription {
    Model(ModelDescription),
    Link(LinkDescription),
    Joint(JointDescription),
}

impl EntityDescription {
    pub fn name(&self) -> &str {
        match self {
            EntityDescription::Model(m) => &m.name,
            EntityDescription::Link(l) => &l.name,
            EntityDescription::Joint(j) => &j.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PENDULUM: &str = r#"
name: pendulum
pose: { position: [0.0, 0.0, 2.0] }
vendor_tag: { color: orange }
links:
  - name: bob
    pose: { position: [0.0, 0.0, -1.0] }
    inertial: { mass: 2.0 }
    collisions:
      - name: ball
        geometry: { type: sphere, radius: 0.1 }
        surface_hint: rubber
joints:
  - name: hinge
    type: revolute
    parent: world
    child: bob
    anchor: [0.0, 0.0, 1.0]
    axis: [1.0, 0.0, 0.0]
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let m: ModelDescription = serde_yaml::from_str(PENDULUM).unwrap();
        assert_eq!(m.name, "pendulum");
        assert!(!m.is_static);
        let bob = &m.links[0];
        assert_eq!(bob.inertial.mass, 2.0);
        assert_eq!(bob.inertial.inertia, InertiaTensor::default());
        assert!(bob.gravity);
        assert_eq!(bob.collisions[0].friction, 0.8);
        let hinge = &m.joints[0];
        assert_eq!(hinge.kind, JointKind::Revolute);
        assert_eq!(hinge.parent_link(), None);
        assert_eq!(hinge.axis, DVec3::X);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let m: ModelDescription = serde_yaml::from_str(PENDULUM).unwrap();
        assert!(m.extensions.contains_key("vendor_tag"));
        assert_eq!(
            m.links[0].collisions[0].extensions["surface_hint"],
            serde_json::json!("rubber")
        );

        let json = serde_json::to_string(&m).unwrap();
        let back: ModelDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn inertia_tensor_matrix_is_symmetric() {
        let t = InertiaTensor {
            ixx: 1.0,
            ixy: 0.1,
            ixz: 0.2,
            iyy: 2.0,
            iyz: 0.3,
            izz: 3.0,
        };
        let m = t.to_matrix();
        assert_eq!(m, m.transpose());
        assert_eq!(InertiaTensor::from_matrix(m), t);
    }

    #[test]
    fn entity_description_is_tagged() {
        let e = EntityDescription::Joint(JointDescription::new(
            "j",
            JointKind::Fixed,
            None,
            "a",
        ));
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("joint").is_some());
        assert_eq!(e.name(), "j");
    }
}
