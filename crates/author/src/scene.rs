//! Scene files.
//!
//! The format is picked from the file extension: `.yaml`/`.yml` or `.json`.
//! Fields the kernel does not interpret survive a load/save cycle.

use std::path::{Path, PathBuf};

use robosim_kernel::{SceneDescription, SimError, World};

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported scene format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error(transparent)]
    World(#[from] SimError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneFormat {
    Yaml,
    Json,
}

impl SceneFormat {
    pub fn from_path(path: &Path) -> Result<Self, SceneError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("yaml" | "yml") => Ok(SceneFormat::Yaml),
            Some("json") => Ok(SceneFormat::Json),
            _ => Err(SceneError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn parse(self, text: &str) -> Result<SceneDescription, SceneError> {
        Ok(match self {
            SceneFormat::Yaml => serde_yaml::from_str(text)?,
            SceneFormat::Json => serde_json::from_str(text)?,
        })
    }

    pub fn render(self, scene: &SceneDescription) -> Result<String, SceneError> {
        Ok(match self {
            SceneFormat::Yaml => serde_yaml::to_string(scene)?,
            SceneFormat::Json => serde_json::to_string_pretty(scene)?,
        })
    }
}

pub fn load_scene(path: impl AsRef<Path>) -> Result<SceneDescription, SceneError> {
    let path = path.as_ref();
    let format = SceneFormat::from_path(path)?;
    let text = std::fs::read_to_string(path)?;
    let scene = format.parse(&text)?;
    tracing::info!(path = %path.display(), models = scene.models.len(), "loaded scene");
    Ok(scene)
}

pub fn save_scene(path: impl AsRef<Path>, scene: &SceneDescription) -> Result<(), SceneError> {
    let path = path.as_ref();
    let text = SceneFormat::from_path(path)?.render(scene)?;
    std::fs::write(path, text)?;
    tracing::info!(path = %path.display(), "saved scene");
    Ok(())
}

/// Load a scene file and build a world from it.
pub fn load_world(path: impl AsRef<Path>) -> Result<World, SceneError> {
    let scene = load_scene(path)?;
    Ok(World::from_scene(&scene)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use robosim_common::Pose;
    use robosim_kernel::{CollisionDescription, LinkDescription, ModelDescription};
    use robosim_physics::Shape;

    const SCENE: &str = r#"
world:
  name: shelf
  step_size: 0.002
generator: scene-tool 2.1
models:
  - name: crate
    pose: { position: [1.0, 0.0, 0.5] }
    links:
      - name: body
        inertial: { mass: 3.0 }
        collisions:
          - name: shell
            geometry: { type: box, size: [0.4, 0.4, 0.4] }
"#;

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            SceneFormat::from_path(Path::new("a/b.YML")).unwrap(),
            SceneFormat::Yaml
        );
        assert_eq!(
            SceneFormat::from_path(Path::new("scene.json")).unwrap(),
            SceneFormat::Json
        );
        assert!(matches!(
            SceneFormat::from_path(Path::new("scene.sdf")),
            Err(SceneError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn yaml_to_json_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("shelf.yaml");
        std::fs::write(&yaml, SCENE).unwrap();

        let scene = load_scene(&yaml).unwrap();
        assert_eq!(scene.world.step_size, 0.002);
        assert_eq!(
            scene.extensions["generator"],
            serde_json::json!("scene-tool 2.1")
        );

        let json = dir.path().join("shelf.json");
        save_scene(&json, &scene).unwrap();
        assert_eq!(load_scene(&json).unwrap(), scene);
    }

    #[test]
    fn world_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.yaml");
        std::fs::write(&path, SCENE).unwrap();

        let mut w = load_world(&path).unwrap();
        assert_eq!(w.name(), "shelf");
        let sphere = Shape::Sphere { radius: 0.05 };
        w.spawn_entity(
            ModelDescription::new("marble")
                .with_pose(Pose::from_position(DVec3::new(0.0, 0.0, 2.0)))
                .with_link(
                    LinkDescription::new("ball")
                        .with_collision(CollisionDescription::new("ball", sphere)),
                ),
        )
        .unwrap();

        let out = dir.path().join("saved.yml");
        save_scene(&out, &w.scene_description()).unwrap();
        let again = load_world(&out).unwrap();
        assert_eq!(again.model_count(), 2);
        assert_eq!(again.step_size(), 0.002);
        assert!(again.link("marble", "ball").is_ok());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_scene(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, SceneError::Io(_)));
    }
}
