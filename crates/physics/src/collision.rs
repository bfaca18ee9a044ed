//! Collision shapes and a small narrow phase shared by the back-ends.
//!
//! Contact normals always point from shape A toward shape B and depths are
//! positive when the shapes overlap. Box-box and capsule-box pairs are
//! approximated (vertex sampling and sphere sampling respectively).

use glam::{DMat3, DVec3};
use robosim_common::Pose;
use serde::{Deserialize, Serialize};

use crate::engine::BodyHandle;

const EPS: f64 = 1e-12;

/// Collision geometry in the shape's local frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Sphere { radius: f64 },
    /// Full extents along the local axes.
    Box { size: DVec3 },
    /// Cylinder of `length` along local z capped by hemispheres.
    Capsule { radius: f64, length: f64 },
    /// Infinite half-space through the local origin; only meaningful on
    /// static bodies.
    Plane {
        #[serde(default = "up")]
        normal: DVec3,
    },
}

fn up() -> DVec3 {
    DVec3::Z
}

impl Shape {
    /// Rotational inertia about the shape's center for a uniform `mass`.
    ///
    /// Capsules are treated as solid cylinders of the same radius and
    /// length. Planes have no meaningful inertia and return a unit-sphere
    /// value scaled by mass.
    pub fn inertia(&self, mass: f64) -> DMat3 {
        match *self {
            Shape::Sphere { radius } => DMat3::from_diagonal(DVec3::splat(0.4 * mass * radius * radius)),
            Shape::Box { size } => {
                let s = size * size;
                DMat3::from_diagonal(DVec3::new(s.y + s.z, s.x + s.z, s.x + s.y) * (mass / 12.0))
            }
            Shape::Capsule { radius, length } => {
                let r2 = radius * radius;
                let side = mass * (3.0 * r2 + length * length) / 12.0;
                DMat3::from_diagonal(DVec3::new(side, side, 0.5 * mass * r2))
            }
            Shape::Plane { .. } => DMat3::from_diagonal(DVec3::splat(0.4 * mass)),
        }
    }

    /// World-space bounding box, or `None` for unbounded shapes.
    pub fn aabb(&self, pose: &Pose) -> Option<(DVec3, DVec3)> {
        let c = pose.position;
        let half = match *self {
            Shape::Sphere { radius } => DVec3::splat(radius),
            Shape::Box { size } => {
                let m = DMat3::from_quat(pose.rotation());
                let h = size * 0.5;
                DVec3::new(
                    m.row(0).abs().dot(h),
                    m.row(1).abs().dot(h),
                    m.row(2).abs().dot(h),
                )
            }
            Shape::Capsule { radius, length } => {
                let axis = pose.rotate_vector(DVec3::Z) * (0.5 * length);
                axis.abs() + DVec3::splat(radius)
            }
            Shape::Plane { .. } => return None,
        };
        Some((c - half, c + half))
    }
}

/// A collision shape attached to a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDesc {
    pub shape: Shape,
    /// Shape frame relative to the body's center-of-mass frame.
    #[serde(default)]
    pub local_pose: Pose,
    #[serde(default = "default_friction")]
    pub friction: f64,
    #[serde(default)]
    pub restitution: f64,
}

fn default_friction() -> f64 {
    0.8
}

impl ShapeDesc {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            local_pose: Pose::IDENTITY,
            friction: default_friction(),
            restitution: 0.0,
        }
    }
}

/// A single point of a contact manifold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPoint {
    pub position: DVec3,
    /// Unit normal from shape A toward shape B.
    pub normal: DVec3,
    pub depth: f64,
}

/// All contact points between one shape pair after a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub body_a: BodyHandle,
    pub shape_a: usize,
    pub body_b: BodyHandle,
    pub shape_b: usize,
    pub points: Vec<ContactPoint>,
}

/// Combined friction of two surfaces.
pub fn mix_friction(a: f64, b: f64) -> f64 {
    a.min(b)
}

/// Combined restitution of two surfaces.
pub fn mix_restitution(a: f64, b: f64) -> f64 {
    a.max(b)
}

/// Coarse overlap test used before the narrow phase.
pub fn may_overlap(a: &Shape, pose_a: &Pose, b: &Shape, pose_b: &Pose) -> bool {
    match (a.aabb(pose_a), b.aabb(pose_b)) {
        (Some((amin, amax)), Some((bmin, bmax))) => {
            amin.cmple(bmax).all() && bmin.cmple(amax).all()
        }
        _ => true,
    }
}

/// Narrow phase: contact points between two posed shapes.
pub fn collide(a: &Shape, pose_a: &Pose, b: &Shape, pose_b: &Pose) -> Vec<ContactPoint> {
    use Shape::*;
    match (a, b) {
        (Plane { .. }, Plane { .. }) => Vec::new(),
        (Sphere { radius: ra }, Sphere { radius: rb }) => {
            sphere_sphere(pose_a.position, *ra, pose_b.position, *rb)
                .into_iter()
                .collect()
        }
        (Sphere { radius }, Plane { normal }) => {
            sphere_plane(pose_a.position, *radius, pose_b, *normal)
                .into_iter()
                .collect()
        }
        (Box { size }, Plane { normal }) => box_plane(*size, pose_a, pose_b, *normal),
        (Capsule { radius, length }, Plane { normal }) => {
            let (p, q) = capsule_ends(pose_a, *length);
            [p, q]
                .into_iter()
                .filter_map(|c| sphere_plane(c, *radius, pose_b, *normal))
                .collect()
        }
        (Sphere { radius }, Box { size }) => {
            sphere_box(pose_a.position, *radius, *size, pose_b)
                .into_iter()
                .collect()
        }
        (Capsule { radius, length }, Sphere { radius: rb }) => {
            let (p, q) = capsule_ends(pose_a, *length);
            let c = closest_on_segment(p, q, pose_b.position);
            sphere_sphere(c, *radius, pose_b.position, *rb)
                .into_iter()
                .collect()
        }
        (Capsule { radius: ra, length: la }, Capsule { radius: rb, length: lb }) => {
            let (p1, q1) = capsule_ends(pose_a, *la);
            let (p2, q2) = capsule_ends(pose_b, *lb);
            let (c1, c2) = closest_between_segments(p1, q1, p2, q2);
            sphere_sphere(c1, *ra, c2, *rb).into_iter().collect()
        }
        (Capsule { radius, length }, Box { size }) => {
            let (p, q) = capsule_ends(pose_a, *length);
            let mid = closest_on_segment(p, q, pose_b.position);
            let mut points: Vec<ContactPoint> = Vec::new();
            for c in [p, mid, q] {
                if let Some(cp) = sphere_box(c, *radius, *size, pose_b) {
                    if !points.iter().any(|o| o.position.distance_squared(cp.position) < 1e-10) {
                        points.push(cp);
                    }
                }
            }
            points
        }
        (Box { size: sa }, Box { size: sb }) => box_box(*sa, pose_a, *sb, pose_b),
        // Remaining pairs are the mirror image of a handled one.
        _ => collide(b, pose_b, a, pose_a)
            .into_iter()
            .map(|p| ContactPoint {
                normal: -p.normal,
                ..p
            })
            .collect(),
    }
}

/// A posed body as seen by contact detection.
#[derive(Debug, Clone, Copy)]
pub struct Collider<'a> {
    pub body: BodyHandle,
    pub pose: Pose,
    pub shapes: &'a [ShapeDesc],
    pub group: Option<u32>,
    pub self_collide: bool,
    pub fixed: bool,
}

impl Collider<'_> {
    fn pairs_with(&self, other: &Collider<'_>) -> bool {
        if self.fixed && other.fixed {
            return false;
        }
        match (self.group, other.group) {
            (Some(a), Some(b)) if a == b => self.self_collide && other.self_collide,
            _ => true,
        }
    }
}

/// Brute-force pair search over `colliders` in slice order.
///
/// The output order depends only on the input order, which keeps stepping
/// deterministic.
pub fn detect(colliders: &[Collider<'_>]) -> Vec<Contact> {
    let mut out = Vec::new();
    for (i, a) in colliders.iter().enumerate() {
        for b in &colliders[i + 1..] {
            if !a.pairs_with(b) {
                continue;
            }
            for (ia, sa) in a.shapes.iter().enumerate() {
                let pa = a.pose * sa.local_pose;
                for (ib, sb) in b.shapes.iter().enumerate() {
                    let pb = b.pose * sb.local_pose;
                    if !may_overlap(&sa.shape, &pa, &sb.shape, &pb) {
                        continue;
                    }
                    let points = collide(&sa.shape, &pa, &sb.shape, &pb);
                    if !points.is_empty() {
                        out.push(Contact {
                            body_a: a.body,
                            shape_a: ia,
                            body_b: b.body,
                            shape_b: ib,
                            points,
                        });
                    }
                }
            }
        }
    }
    out
}

fn capsule_ends(pose: &Pose, length: f64) -> (DVec3, DVec3) {
    let half = pose.rotate_vector(DVec3::Z) * (0.5 * length);
    (pose.position - half, pose.position + half)
}

fn sphere_sphere(ca: DVec3, ra: f64, cb: DVec3, rb: f64) -> Option<ContactPoint> {
    let d = cb - ca;
    let dist = d.length();
    let depth = ra + rb - dist;
    if depth <= 0.0 {
        return None;
    }
    let normal = if dist > EPS { d / dist } else { DVec3::Z };
    Some(ContactPoint {
        position: ca + normal * (ra - 0.5 * depth),
        normal,
        depth,
    })
}

fn sphere_plane(center: DVec3, radius: f64, plane: &Pose, normal: DVec3) -> Option<ContactPoint> {
    let n = plane.rotate_vector(normal.normalize_or(DVec3::Z));
    let dist = (center - plane.position).dot(n);
    let depth = radius - dist;
    if depth <= 0.0 {
        return None;
    }
    Some(ContactPoint {
        position: center - n * (0.5 * (radius + dist)),
        normal: -n,
        depth,
    })
}

fn box_vertices(size: DVec3, pose: &Pose) -> [DVec3; 8] {
    let h = size * 0.5;
    let mut out = [DVec3::ZERO; 8];
    for (i, v) in out.iter_mut().enumerate() {
        let local = DVec3::new(
            if i & 1 == 0 { -h.x } else { h.x },
            if i & 2 == 0 { -h.y } else { h.y },
            if i & 4 == 0 { -h.z } else { h.z },
        );
        *v = pose.transform_point(local);
    }
    out
}

fn box_plane(size: DVec3, pose: &Pose, plane: &Pose, normal: DVec3) -> Vec<ContactPoint> {
    let n = plane.rotate_vector(normal.normalize_or(DVec3::Z));
    box_vertices(size, pose)
        .into_iter()
        .filter_map(|v| {
            let dist = (v - plane.position).dot(n);
            (dist < 0.0).then(|| ContactPoint {
                position: v - n * (0.5 * dist),
                normal: -n,
                depth: -dist,
            })
        })
        .collect()
}

/// Sphere A against box B.
fn sphere_box(center: DVec3, radius: f64, size: DVec3, pose: &Pose) -> Option<ContactPoint> {
    let h = size * 0.5;
    let inv = pose.inverse();
    let c = inv.transform_point(center);
    let q = c.clamp(-h, h);
    let d = c - q;
    let dist = d.length();

    if dist > EPS {
        let depth = radius - dist;
        if depth <= 0.0 {
            return None;
        }
        let outward = pose.rotate_vector(d / dist);
        let surface = pose.transform_point(q);
        return Some(ContactPoint {
            position: surface + outward * (0.5 * depth),
            normal: -outward,
            depth,
        });
    }

    // Center inside the box: push out through the nearest face.
    let gaps = h - c.abs();
    let axis = if gaps.x <= gaps.y && gaps.x <= gaps.z {
        0
    } else if gaps.y <= gaps.z {
        1
    } else {
        2
    };
    let mut local = DVec3::ZERO;
    local[axis] = if c[axis] >= 0.0 { 1.0 } else { -1.0 };
    let outward = pose.rotate_vector(local);
    let depth = radius + gaps[axis];
    Some(ContactPoint {
        position: center + outward * (gaps[axis] - 0.5 * depth),
        normal: -outward,
        depth,
    })
}

/// Vertices of `size_a` at `pose_a` that lie inside the box at `pose_b`.
/// The returned normal is the outward face normal of box B.
fn vertices_inside(size_a: DVec3, pose_a: &Pose, size_b: DVec3, pose_b: &Pose) -> Vec<(DVec3, DVec3, f64)> {
    let hb = size_b * 0.5;
    let inv = pose_b.inverse();
    box_vertices(size_a, pose_a)
        .into_iter()
        .filter_map(|v| {
            let c = inv.transform_point(v);
            let gaps = hb - c.abs();
            if gaps.min_element() <= 0.0 {
                return None;
            }
            let axis = if gaps.x <= gaps.y && gaps.x <= gaps.z {
                0
            } else if gaps.y <= gaps.z {
                1
            } else {
                2
            };
            let mut local = DVec3::ZERO;
            local[axis] = if c[axis] >= 0.0 { 1.0 } else { -1.0 };
            Some((v, pose_b.rotate_vector(local), gaps[axis]))
        })
        .collect()
}

fn box_box(sa: DVec3, pa: &Pose, sb: DVec3, pb: &Pose) -> Vec<ContactPoint> {
    let mut points = Vec::new();
    for (v, outward_b, depth) in vertices_inside(sa, pa, sb, pb) {
        points.push(ContactPoint {
            position: v + outward_b * (0.5 * depth),
            normal: -outward_b,
            depth,
        });
    }
    for (v, outward_a, depth) in vertices_inside(sb, pb, sa, pa) {
        points.push(ContactPoint {
            position: v + outward_a * (0.5 * depth),
            normal: outward_a,
            depth,
        });
    }
    points
}

fn closest_on_segment(p: DVec3, q: DVec3, x: DVec3) -> DVec3 {
    let d = q - p;
    let len2 = d.length_squared();
    if len2 < EPS {
        return p;
    }
    let t = ((x - p).dot(d) / len2).clamp(0.0, 1.0);
    p + d * t
}

/// Closest points between segments `p1q1` and `p2q2`.
fn closest_between_segments(p1: DVec3, q1: DVec3, p2: DVec3, q2: DVec3) -> (DVec3, DVec3) {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (s, t) = if a < EPS && e < EPS {
        (0.0, 0.0)
    } else if a < EPS {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d1.dot(r);
        if e < EPS {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let mut s = if denom > EPS {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };
    (p1 + d1 * s, p2 + d2 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use glam::DQuat;

    fn at(x: f64, y: f64, z: f64) -> Pose {
        Pose::from_position(DVec3::new(x, y, z))
    }

    const GROUND: Shape = Shape::Plane { normal: DVec3::Z };

    #[test]
    fn sphere_resting_on_plane() {
        let ball = Shape::Sphere { radius: 0.5 };
        let pts = collide(&ball, &at(0.0, 0.0, 0.4), &GROUND, &Pose::IDENTITY);
        assert_eq!(pts.len(), 1);
        assert_abs_diff_eq!(pts[0].depth, 0.1, epsilon = 1e-12);
        assert_eq!(pts[0].normal, -DVec3::Z);
        assert_abs_diff_eq!(pts[0].position.z, -0.05, epsilon = 1e-12);

        assert!(collide(&ball, &at(0.0, 0.0, 0.6), &GROUND, &Pose::IDENTITY).is_empty());
    }

    #[test]
    fn mirrored_pair_flips_normal() {
        let ball = Shape::Sphere { radius: 0.5 };
        let pts = collide(&GROUND, &Pose::IDENTITY, &ball, &at(0.0, 0.0, 0.4));
        assert_eq!(pts.len(), 1);
        assert_eq!(pts[0].normal, DVec3::Z);
    }

    #[test]
    fn box_on_plane_reports_bottom_vertices() {
        let cube = Shape::Box { size: DVec3::ONE };
        let pts = collide(&cube, &at(0.0, 0.0, 0.49), &GROUND, &Pose::IDENTITY);
        assert_eq!(pts.len(), 4);
        for p in &pts {
            assert_abs_diff_eq!(p.depth, 0.01, epsilon = 1e-9);
        }
    }

    #[test]
    fn spheres_overlap_along_center_line() {
        let a = Shape::Sphere { radius: 1.0 };
        let pts = collide(&a, &at(0.0, 0.0, 0.0), &a, &at(1.5, 0.0, 0.0));
        assert_eq!(pts.len(), 1);
        assert_abs_diff_eq!(pts[0].normal.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pts[0].depth, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(pts[0].position.x, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn sphere_touching_box_face() {
        let ball = Shape::Sphere { radius: 0.5 };
        let cube = Shape::Box { size: DVec3::splat(2.0) };
        let pts = collide(&ball, &at(0.0, 0.0, 1.4), &cube, &Pose::IDENTITY);
        assert_eq!(pts.len(), 1);
        assert_abs_diff_eq!(pts[0].normal.z, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pts[0].depth, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn sphere_center_inside_box_uses_nearest_face() {
        let ball = Shape::Sphere { radius: 0.1 };
        let cube = Shape::Box { size: DVec3::splat(2.0) };
        let pts = collide(&ball, &at(0.0, 0.9, 0.0), &cube, &Pose::IDENTITY);
        assert_eq!(pts.len(), 1);
        assert_abs_diff_eq!(pts[0].normal.y, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pts[0].depth, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn lying_capsule_touches_plane_at_both_ends() {
        let capsule = Shape::Capsule { radius: 0.1, length: 1.0 };
        let pose = Pose::new(
            DVec3::new(0.0, 0.0, 0.09),
            DQuat::from_rotation_y(std::f64::consts::FRAC_PI_2),
        );
        let pts = collide(&capsule, &pose, &GROUND, &Pose::IDENTITY);
        assert_eq!(pts.len(), 2);
    }

    #[test]
    fn crossed_capsules_meet_at_closest_points() {
        let capsule = Shape::Capsule { radius: 0.2, length: 2.0 };
        let a = Pose::new(DVec3::ZERO, DQuat::from_rotation_y(std::f64::consts::FRAC_PI_2));
        let b = Pose::new(
            DVec3::new(0.0, 0.0, 0.3),
            DQuat::from_rotation_x(std::f64::consts::FRAC_PI_2),
        );
        let pts = collide(&capsule, &a, &capsule, &b);
        assert_eq!(pts.len(), 1);
        assert_abs_diff_eq!(pts[0].normal.z, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pts[0].depth, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn stacked_boxes_push_apart_vertically() {
        let cube = Shape::Box { size: DVec3::ONE };
        let small = Shape::Box { size: DVec3::splat(0.5) };
        let pts = collide(&small, &at(0.0, 0.0, 0.74), &cube, &Pose::IDENTITY);
        assert_eq!(pts.len(), 4);
        for p in &pts {
            assert_abs_diff_eq!(p.normal.z, -1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(p.depth, 0.01, epsilon = 1e-9);
        }
    }

    #[test]
    fn aabb_prefilter() {
        let ball = Shape::Sphere { radius: 0.5 };
        assert!(!may_overlap(&ball, &at(0.0, 0.0, 0.0), &ball, &at(2.0, 0.0, 0.0)));
        assert!(may_overlap(&ball, &at(0.0, 0.0, 0.0), &ball, &at(0.9, 0.0, 0.0)));
        assert!(may_overlap(&ball, &at(0.0, 0.0, 100.0), &GROUND, &Pose::IDENTITY));
    }

    #[test]
    fn box_inertia_matches_closed_form() {
        let i = Shape::Box { size: DVec3::new(1.0, 2.0, 3.0) }.inertia(12.0);
        assert_abs_diff_eq!(i.x_axis.x, 13.0, epsilon = 1e-12);
        assert_abs_diff_eq!(i.y_axis.y, 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(i.z_axis.z, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn detection_skips_same_group_and_static_pairs() {
        let ball = vec![ShapeDesc::new(Shape::Sphere { radius: 0.5 })];
        let ground = vec![ShapeDesc::new(GROUND)];
        fn collider(raw: u32, z: f64, group: Option<u32>, fixed: bool, shapes: &[ShapeDesc]) -> Collider<'_> {
            Collider {
                body: BodyHandle::from_raw(raw),
                pose: at(0.0, 0.0, z),
                shapes,
                group,
                self_collide: false,
                fixed,
            }
        }

        let scene = [
            collider(0, 0.0, None, true, &ground[..]),
            collider(1, 0.4, Some(1), false, &ball[..]),
            collider(2, 0.8, Some(1), false, &ball[..]),
            collider(3, 0.0, None, true, &ground[..]),
        ];
        let contacts = detect(&scene);
        // Ball 1 touches both grounds; ball 2 is in its group; grounds
        // never collide with each other.
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].body_a, BodyHandle::from_raw(0));
        assert_eq!(contacts[0].body_b, BodyHandle::from_raw(1));
        assert_eq!(contacts[1].body_a, BodyHandle::from_raw(1));
        assert_eq!(contacts[1].body_b, BodyHandle::from_raw(3));
    }

    #[test]
    fn material_mixing() {
        assert_eq!(mix_friction(0.3, 0.9), 0.3);
        assert_eq!(mix_restitution(0.3, 0.9), 0.9);
    }
}
