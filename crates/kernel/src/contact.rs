use robosim_common::LinkId;
use robosim_physics::ContactPoint;

/// One colliding pair of link geometries from the most recent sub-step.
///
/// Normals point from the first geometry toward the second. Events are
/// replaced wholesale by the next sub-step; copy them out to keep history.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactEvent {
    pub link_a: LinkId,
    pub collision_a: String,
    pub link_b: LinkId,
    pub collision_b: String,
    pub points: Vec<ContactPoint>,
}

impl ContactEvent {
    pub fn involves(&self, link: LinkId) -> bool {
        self.link_a == link || self.link_b == link
    }

    /// Deepest penetration among the contact points.
    pub fn max_depth(&self) -> f64 {
        self.points.iter().map(|p| p.depth).fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    #[test]
    fn max_depth_over_points() {
        let point = |depth| ContactPoint {
            position: DVec3::ZERO,
            normal: DVec3::Z,
            depth,
        };
        let c = ContactEvent {
            link_a: LinkId(0),
            collision_a: "a".into(),
            link_b: LinkId(1),
            collision_b: "b".into(),
            points: vec![point(0.01), point(0.03)],
        };
        assert_eq!(c.max_depth(), 0.03);
        assert!(c.involves(LinkId(1)));
        assert!(!c.involves(LinkId(2)));
    }
}
