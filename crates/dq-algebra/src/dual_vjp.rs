//! Vector-Jacobian products of the [`crate::dual`] operations.

use dq_core::Real;

use crate::dual::{DualQuat, split_homogeneous};
use crate::quat::{Quat, Vec3};
use crate::quat_vjp;

#[must_use]
pub fn mul_vjp<T: Real>(
    a: DualQuat<T>,
    b: DualQuat<T>,
    grad: DualQuat<T>,
) -> (DualQuat<T>, DualQuat<T>) {
    let br = b.real.conjugate();
    let bd = b.dual.conjugate();
    let ar = a.real.conjugate();
    let ad = a.dual.conjugate();
    let grad_a = DualQuat::new(grad.real * br + grad.dual * bd, grad.dual * br);
    let grad_b = DualQuat::new(ar * grad.real + ad * grad.dual, ar * grad.dual);
    (grad_a, grad_b)
}

#[must_use]
pub fn conjugate_vjp<T: Real>(grad: DualQuat<T>) -> DualQuat<T> {
    crate::dual::conjugate(grad)
}

#[must_use]
pub fn number_conjugate_vjp<T: Real>(grad: DualQuat<T>) -> DualQuat<T> {
    crate::dual::number_conjugate(grad)
}

#[must_use]
pub fn full_conjugate_vjp<T: Real>(grad: DualQuat<T>) -> DualQuat<T> {
    crate::dual::full_conjugate(grad)
}

/// Zero on the identity fallback.
#[must_use]
pub fn normalize_vjp<T: Real>(a: DualQuat<T>, grad: DualQuat<T>) -> DualQuat<T> {
    let n = a.real.norm();
    let inv = n.recip();
    let real = a.real.scale(inv);
    let dual = a.dual.scale(inv);

    // Through the projection d' = d - (r.d) r.
    let gr = grad.real - grad.dual.scale(real.dot(dual)) - dual.scale(real.dot(grad.dual));
    let gd = grad.dual - real.scale(real.dot(grad.dual));

    // Through r = A_r / n and d = A_d / n.
    let grad_real = (gr - real.scale(real.dot(gr)) - real.scale(gd.dot(dual))).scale(inv);
    let grad_dual = gd.scale(inv);

    DualQuat::select(
        n >= T::NORM_EPS,
        DualQuat::new(grad_real, grad_dual),
        DualQuat::new(Quat::zero(), Quat::zero()),
    )
}

#[must_use]
pub fn from_rigid_vjp<T: Real>(
    q: Quat<T>,
    t: Vec3<T>,
    grad: DualQuat<T>,
) -> (Quat<T>, Vec3<T>) {
    let half = T::half();
    let grad_q = grad.real - (Quat::pure(t) * grad.dual).scale(half);
    let grad_t = (grad.dual * q.conjugate()).scale(half).vector();
    (grad_q, grad_t)
}

#[must_use]
pub fn to_rigid_vjp<T: Real>(a: DualQuat<T>, grad_q: Quat<T>, grad_t: Vec3<T>) -> DualQuat<T> {
    let gt = Quat::pure(grad_t);
    let two = T::two();
    DualQuat::new(
        grad_q - (gt * a.dual).scale(two),
        (gt * a.real).scale(two),
    )
}

#[must_use]
pub fn to_matrix_vjp<T: Real>(a: DualQuat<T>, grad: &[T; 16]) -> DualQuat<T> {
    let (grad_rotation, grad_t) = split_homogeneous(grad);
    let grad_rotation_q = quat_vjp::to_matrix_vjp(a.real, &grad_rotation);
    to_rigid_vjp(a, grad_rotation_q, grad_t)
}

/// Bottom-row entries receive zero gradient.
#[must_use]
pub fn from_matrix_vjp<T: Real>(m: &[T; 16], grad: DualQuat<T>) -> [T; 16] {
    let (rotation, t) = split_homogeneous(m);
    let q = crate::quat::from_matrix(&rotation);
    let (grad_q, grad_t) = from_rigid_vjp(q, t, grad);
    let g = quat_vjp::from_matrix_vjp(&rotation, grad_q);
    let zero = T::zero();
    [
        g[0], g[1], g[2], grad_t[0], g[3], g[4], g[5], grad_t[1], g[6], g[7], g[8], grad_t[2],
        zero, zero, zero, zero,
    ]
}

#[must_use]
pub fn apply_vjp<T: Real>(a: DualQuat<T>, p: Vec3<T>, grad: Vec3<T>) -> (DualQuat<T>, Vec3<T>) {
    let g = Quat::pure(grad);
    let two = T::two();
    let grad_p = (a.real.conjugate() * g * a.real).vector();
    let grad_real = (g * a.real * Quat::pure(p)).scale(-two) - (g * a.dual).scale(two);
    let grad_dual = (g * a.real).scale(two);
    (DualQuat::new(grad_real, grad_dual), grad_p)
}
