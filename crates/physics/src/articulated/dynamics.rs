//! Recursive Newton-Euler bias forces, composite-rigid-body mass matrix and
//! a dense Cholesky solve for the generalized accelerations.

use super::tree::{Kinematics, Tree};
use crate::spatial::{SpatialForce, SpatialInertia, SpatialMotion};

/// Generalized forces that produce zero acceleration: `C(q, qd) - J^T f_ext`.
pub(crate) fn bias_forces(
    tree: &Tree,
    kin: &Kinematics,
    inertias: &[SpatialInertia],
    external: &[SpatialForce],
) -> Vec<f64> {
    let n = tree.nodes.len();
    let mut accel = vec![SpatialMotion::ZERO; n];
    let mut force = vec![SpatialForce::ZERO; n];

    for (i, node) in tree.nodes.iter().enumerate() {
        let (parent_accel, parent_velocity) = match node.parent {
            Some(p) => (accel[p], kin.velocities[p]),
            None => (SpatialMotion::ZERO, SpatialMotion::ZERO),
        };
        let mut a = parent_accel;
        for k in node.offset..node.offset + node.dofs() {
            a += parent_velocity.cross_motion(&kin.subspace[k]) * tree.velocity[k];
        }
        accel[i] = a;

        let v = kin.velocities[i];
        let momentum = inertias[i].mul_motion(&v);
        force[i] = inertias[i].mul_motion(&a) + v.cross_force(&momentum) - external[i];
    }

    let mut bias = vec![0.0; tree.velocity.len()];
    for i in (0..n).rev() {
        let node = &tree.nodes[i];
        for k in node.offset..node.offset + node.dofs() {
            bias[k] = kin.subspace[k].dot(&force[i]);
        }
        if let Some(p) = node.parent {
            let f = force[i];
            force[p] += f;
        }
    }
    bias
}

/// Joint-space inertia matrix, row-major `dofs x dofs`.
pub(crate) fn mass_matrix(tree: &Tree, kin: &Kinematics, inertias: &[SpatialInertia]) -> Vec<f64> {
    let dofs = tree.velocity.len();
    let mut composite = inertias.to_vec();
    for i in (0..tree.nodes.len()).rev() {
        if let Some(p) = tree.nodes[i].parent {
            let c = composite[i];
            composite[p] += c;
        }
    }

    let mut m = vec![0.0; dofs * dofs];
    for (i, node) in tree.nodes.iter().enumerate() {
        for a in node.offset..node.offset + node.dofs() {
            let f = composite[i].mul_motion(&kin.subspace[a]);
            let mut j = Some(i);
            while let Some(jn) = j {
                let other = &tree.nodes[jn];
                for b in other.offset..other.offset + other.dofs() {
                    let value = kin.subspace[b].dot(&f);
                    m[a * dofs + b] = value;
                    m[b * dofs + a] = value;
                }
                j = other.parent;
            }
        }
    }
    m
}

/// Solve `m x = rhs` for symmetric positive-definite `m` in place.
///
/// Returns `None` when the matrix is not positive definite.
pub(crate) fn cholesky_solve(mut m: Vec<f64>, mut rhs: Vec<f64>) -> Option<Vec<f64>> {
    let n = rhs.len();
    for j in 0..n {
        let mut d = m[j * n + j];
        for k in 0..j {
            d -= m[j * n + k] * m[j * n + k];
        }
        if !(d > 0.0) || !d.is_finite() {
            return None;
        }
        let d = d.sqrt();
        m[j * n + j] = d;
        for i in j + 1..n {
            let mut s = m[i * n + j];
            for k in 0..j {
                s -= m[i * n + k] * m[j * n + k];
            }
            m[i * n + j] = s / d;
        }
    }
    for i in 0..n {
        let mut s = rhs[i];
        for k in 0..i {
            s -= m[i * n + k] * rhs[k];
        }
        rhs[i] = s / m[i * n + i];
    }
    for i in (0..n).rev() {
        let mut s = rhs[i];
        for k in i + 1..n {
            s -= m[k * n + i] * rhs[k];
        }
        rhs[i] = s / m[i * n + i];
    }
    Some(rhs)
}
