use robosim_common::{LinkId, ModelId, SCOPE_DELIMITER};
use robosim_kernel::World;
use std::fmt::{self, Write};

/// Read-only queries against world state for debugging and CLI output.
pub struct WorldInspector;

impl WorldInspector {
    pub fn summary(world: &World) -> WorldSummary {
        WorldSummary {
            name: world.name().to_string(),
            engine: world.engine_kind(),
            sim_time: world.sim_time(),
            iterations: world.iterations(),
            model_count: world.models().count(),
            nested_model_count: world.model_count() - world.models().count(),
            link_count: world.link_count(),
            joint_count: world.joint_count(),
            contact_count: world.contacts().len(),
            pending_events: world.events().len(),
            diverged: world.is_diverged(),
        }
    }

    pub fn inspect_link(world: &World, id: LinkId) -> Option<LinkInfo> {
        let link = world.link_by_id(id)?;
        Some(LinkInfo {
            id,
            scoped_name: world.link_scoped_name(id)?,
            position: link.pose().position.to_array(),
            rpy: link.pose().rpy().to_array(),
            linear_velocity: link.twist().linear.to_array(),
            angular_velocity: link.twist().angular.to_array(),
        })
    }

    /// Scoped names of every link, in id order.
    pub fn list_links(world: &World) -> Vec<String> {
        world
            .links()
            .filter_map(|l| world.link_scoped_name(l.id()))
            .collect()
    }

    /// Indented model/link/joint tree.
    pub fn tree(world: &World) -> String {
        let mut out = String::new();
        for model in world.models() {
            write_model(world, model.id(), 0, &mut out);
        }
        out
    }
}

fn write_model(world: &World, id: ModelId, depth: usize, out: &mut String) {
    let Some(model) = world.model_by_id(id) else {
        return;
    };
    let pad = "  ".repeat(depth);
    let tag = if model.is_static() { " (static)" } else { "" };
    let _ = writeln!(out, "{pad}model {}{tag}", model.name());
    for link in model.links().iter().filter_map(|l| world.link_by_id(*l)) {
        let _ = writeln!(out, "{pad}  link {} mass={}", link.name(), link.mass());
    }
    for joint in model.joints().iter().filter_map(|j| world.joint_by_id(*j)) {
        let parent = joint
            .parent()
            .and_then(|p| world.link_by_id(p))
            .map_or("world", |l| l.name());
        let child = world.link_by_id(joint.child()).map_or("?", |l| l.name());
        let _ = writeln!(
            out,
            "{pad}  joint {} {:?} {parent} -> {child}",
            joint.name(),
            joint.kind()
        );
    }
    for child in model.models() {
        write_model(world, *child, depth + 1, out);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldSummary {
    pub name: String,
    pub engine: &'static str,
    pub sim_time: f64,
    pub iterations: u64,
    /// Top-level models.
    pub model_count: usize,
    pub nested_model_count: usize,
    pub link_count: usize,
    pub joint_count: usize,
    pub contact_count: usize,
    pub pending_events: usize,
    pub diverged: bool,
}

impl fmt::Display for WorldSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "World {}: engine={} t={:.6}s iterations={} models={} (+{} nested) links={} joints={} contacts={} pending_events={}",
            self.name,
            self.engine,
            self.sim_time,
            self.iterations,
            self.model_count,
            self.nested_model_count,
            self.link_count,
            self.joint_count,
            self.contact_count,
            self.pending_events,
        )?;
        if self.diverged {
            f.write_str(" DIVERGED")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub id: LinkId,
    pub scoped_name: String,
    pub position: [f64; 3],
    pub rpy: [f64; 3],
    pub linear_velocity: [f64; 3],
    pub angular_velocity: [f64; 3],
}

impl LinkInfo {
    /// Name of the owning top-level model.
    pub fn root_model(&self) -> &str {
        self.scoped_name
            .split(SCOPE_DELIMITER)
            .next()
            .unwrap_or_default()
    }
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.position;
        let [r, p, yaw] = self.rpy;
        let [vx, vy, vz] = self.linear_velocity;
        write!(
            f,
            "{} [{}] pos=({x:.3}, {y:.3}, {z:.3}) rpy=({r:.3}, {p:.3}, {yaw:.3}) vel=({vx:.3}, {vy:.3}, {vz:.3})",
            self.scoped_name, self.id
        )
    }
}
