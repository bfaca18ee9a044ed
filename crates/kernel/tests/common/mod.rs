//! Shared fixtures for the kernel integration tests.

#![allow(dead_code)]

use glam::DVec3;
use robosim_common::Pose;
use robosim_kernel::{
    CollisionDescription, Inertial, LinkDescription, ModelDescription, SceneDescription, World,
    WorldConfig,
};
use robosim_physics::{EngineRegistry, Shape};

pub const PENDULUM_SCENE: &str = include_str!("../../../../scenes/inertia_ratio_pendulum.yaml");
pub const BALLS_SCENE: &str = include_str!("../../../../scenes/falling_balls.yaml");

/// Every back-end the builtin registry ships.
pub fn backends() -> Vec<String> {
    EngineRegistry::builtin().names().map(str::to_string).collect()
}

pub fn config(engine: &str) -> WorldConfig {
    WorldConfig {
        engine: engine.to_string(),
        ..WorldConfig::default()
    }
}

pub fn empty_world(engine: &str) -> World {
    World::new(config(engine)).unwrap()
}

/// Parse a bundled scene and load it on `engine`.
pub fn load_scene(yaml: &str, engine: &str) -> World {
    let mut scene: SceneDescription = serde_yaml::from_str(yaml).unwrap();
    scene.world.engine = engine.to_string();
    World::from_scene(&scene).unwrap()
}

pub fn ball(name: &str, position: DVec3) -> ModelDescription {
    let sphere = Shape::Sphere { radius: 0.1 };
    ModelDescription::new(name)
        .with_pose(Pose::from_position(position))
        .with_link(
            LinkDescription::new("body")
                .with_inertial(Inertial::of_shape(1.0, &sphere))
                .with_collision(CollisionDescription::new("sphere", sphere)),
        )
}

pub fn ground() -> ModelDescription {
    ModelDescription::new("ground")
        .with_link(LinkDescription::new("plane").with_collision(CollisionDescription::new(
            "surface",
            Shape::Plane { normal: DVec3::Z },
        )))
        .into_static()
}
