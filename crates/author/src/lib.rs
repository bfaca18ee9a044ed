//! Scene authoring on top of the kernel's editor interface.
//!
//! # Invariants
//! - Every edit made through [`Editor`] can be undone and redone.
//! - A failed edit leaves both the world and the undo history unchanged.
//! - Scene files keep fields the kernel does not understand.

pub mod editor;
pub mod scene;

pub use editor::{EditCommand, EditError, Editor};
pub use scene::{SceneError, SceneFormat, load_scene, load_world, save_scene};

pub fn crate_info() -> &'static str {
    "robosim-author v0.1.0"
}
