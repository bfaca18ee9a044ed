//! Developer tooling: read-only world inspection.
//!
//! # Invariants
//! - Inspection never mutates the world.

mod inspector;

pub use inspector::{LinkInfo, WorldInspector, WorldSummary};

pub fn crate_info() -> &'static str {
    "robosim-tools v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("tools"));
    }
}
