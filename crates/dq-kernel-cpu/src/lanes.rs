//! Lane bodies: one element in, one packed element out.
//!
//! Forward lanes write the operator's outputs back to back; backward lanes
//! write one gradient per input in argument order. The boolean result marks
//! lanes that hit a normalize fallback.

use dq_algebra::dual::{self, DualQuat};
use dq_algebra::quat::{self, Quat, Vec3};
use dq_algebra::{dual_vjp, quat_vjp, sclerp};
use dq_core::Real;

fn vec3<T: Real>(values: &[T]) -> Vec3<T> {
    [values[0], values[1], values[2]]
}

fn array<T: Real, const N: usize>(values: &[T]) -> [T; N] {
    let mut out = [T::zero(); N];
    out.copy_from_slice(&values[..N]);
    out
}

fn write_vec3<T: Real>(v: Vec3<T>, out: &mut [T]) {
    out[..3].copy_from_slice(&v);
}

fn q<T: Real>(values: &[T]) -> Quat<T> {
    Quat::from_slice(values)
}

fn dq<T: Real>(values: &[T]) -> DualQuat<T> {
    DualQuat::from_slice(values)
}

pub fn quat_mul<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::mul(q(inputs[0]), q(inputs[1])).write_to(out);
    false
}

pub fn quat_mul_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (ga, gb) = quat_vjp::mul_vjp(q(inputs[0]), q(inputs[1]), q(grad));
    ga.write_to(&mut grads[..4]);
    gb.write_to(&mut grads[4..8]);
    false
}

pub fn quat_conjugate<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::conjugate(q(inputs[0])).write_to(out);
    false
}

pub fn quat_conjugate_backward<T: Real>(_inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    quat_vjp::conjugate_vjp(q(grad)).write_to(grads);
    false
}

pub fn quat_norm_squared<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    out[0] = quat::norm_squared(q(inputs[0]));
    false
}

pub fn quat_norm_squared_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    quat_vjp::norm_squared_vjp(q(inputs[0]), grad[0]).write_to(grads);
    false
}

pub fn quat_normalize<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    let value = q(inputs[0]);
    quat::normalize(value).write_to(out);
    quat::is_degenerate(value)
}

pub fn quat_normalize_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let value = q(inputs[0]);
    quat_vjp::normalize_vjp(value, q(grad)).write_to(grads);
    quat::is_degenerate(value)
}

pub fn quat_rotate<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    write_vec3(quat::rotate(q(inputs[0]), vec3(inputs[1])), out);
    false
}

pub fn quat_rotate_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (gq, gv) = quat_vjp::rotate_vjp(q(inputs[0]), vec3(inputs[1]), vec3(grad));
    gq.write_to(&mut grads[..4]);
    write_vec3(gv, &mut grads[4..7]);
    false
}

pub fn quat_exp<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::exp(vec3(inputs[0])).write_to(out);
    false
}

pub fn quat_exp_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    write_vec3(quat_vjp::exp_vjp(vec3(inputs[0]), q(grad)), grads);
    false
}

pub fn quat_log<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    write_vec3(quat::log(q(inputs[0])), out);
    false
}

pub fn quat_log_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    quat_vjp::log_vjp(q(inputs[0]), vec3(grad)).write_to(grads);
    false
}

pub fn quat_from_axis_angle<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::from_axis_angle(vec3(inputs[0])).write_to(out);
    false
}

pub fn quat_from_axis_angle_backward<T: Real>(
    inputs: &[&[T]],
    grad: &[T],
    grads: &mut [T],
) -> bool {
    write_vec3(
        quat_vjp::from_axis_angle_vjp(vec3(inputs[0]), q(grad)),
        grads,
    );
    false
}

pub fn quat_to_axis_angle<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    write_vec3(quat::to_axis_angle(q(inputs[0])), out);
    false
}

pub fn quat_to_axis_angle_backward<T: Real>(
    inputs: &[&[T]],
    grad: &[T],
    grads: &mut [T],
) -> bool {
    quat_vjp::to_axis_angle_vjp(q(inputs[0]), vec3(grad)).write_to(grads);
    false
}

pub fn quat_to_matrix<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    out[..9].copy_from_slice(&quat::to_matrix(q(inputs[0])));
    false
}

pub fn quat_to_matrix_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    quat_vjp::to_matrix_vjp(q(inputs[0]), &array(grad)).write_to(grads);
    false
}

pub fn quat_from_matrix<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::from_matrix(&array(inputs[0])).write_to(out);
    false
}

pub fn quat_from_matrix_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    grads[..9].copy_from_slice(&quat_vjp::from_matrix_vjp(&array(inputs[0]), q(grad)));
    false
}

pub fn quat_standardize<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    quat::standardize(q(inputs[0])).write_to(out);
    false
}

pub fn quat_standardize_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    quat_vjp::standardize_vjp(q(inputs[0]), q(grad)).write_to(grads);
    false
}

pub fn dual_mul<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::mul(dq(inputs[0]), dq(inputs[1])).write_to(out);
    false
}

pub fn dual_mul_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (ga, gb) = dual_vjp::mul_vjp(dq(inputs[0]), dq(inputs[1]), dq(grad));
    ga.write_to(&mut grads[..8]);
    gb.write_to(&mut grads[8..16]);
    false
}

pub fn dual_conjugate<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::conjugate(dq(inputs[0])).write_to(out);
    false
}

pub fn dual_conjugate_backward<T: Real>(_inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    dual_vjp::conjugate_vjp(dq(grad)).write_to(grads);
    false
}

pub fn dual_number_conjugate<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::number_conjugate(dq(inputs[0])).write_to(out);
    false
}

pub fn dual_number_conjugate_backward<T: Real>(
    _inputs: &[&[T]],
    grad: &[T],
    grads: &mut [T],
) -> bool {
    dual_vjp::number_conjugate_vjp(dq(grad)).write_to(grads);
    false
}

pub fn dual_full_conjugate<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::full_conjugate(dq(inputs[0])).write_to(out);
    false
}

pub fn dual_full_conjugate_backward<T: Real>(
    _inputs: &[&[T]],
    grad: &[T],
    grads: &mut [T],
) -> bool {
    dual_vjp::full_conjugate_vjp(dq(grad)).write_to(grads);
    false
}

pub fn dual_normalize<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    let value = dq(inputs[0]);
    dual::normalize(value).write_to(out);
    dual::is_degenerate(value)
}

pub fn dual_normalize_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let value = dq(inputs[0]);
    dual_vjp::normalize_vjp(value, dq(grad)).write_to(grads);
    dual::is_degenerate(value)
}

pub fn dual_from_rigid<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::from_rigid(q(inputs[0]), vec3(inputs[1])).write_to(out);
    false
}

pub fn dual_from_rigid_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (gq, gt) = dual_vjp::from_rigid_vjp(q(inputs[0]), vec3(inputs[1]), dq(grad));
    gq.write_to(&mut grads[..4]);
    write_vec3(gt, &mut grads[4..7]);
    false
}

/// Packs the rotation (4) followed by the translation (3).
pub fn dual_to_rigid<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    let (rotation, translation) = dual::to_rigid(dq(inputs[0]));
    rotation.write_to(&mut out[..4]);
    write_vec3(translation, &mut out[4..7]);
    false
}

pub fn dual_to_rigid_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    dual_vjp::to_rigid_vjp(dq(inputs[0]), q(&grad[..4]), vec3(&grad[4..7])).write_to(grads);
    false
}

pub fn dual_to_matrix<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    out[..16].copy_from_slice(&dual::to_matrix(dq(inputs[0])));
    false
}

pub fn dual_to_matrix_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    dual_vjp::to_matrix_vjp(dq(inputs[0]), &array(grad)).write_to(grads);
    false
}

pub fn dual_from_matrix<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    dual::from_matrix(&array(inputs[0])).write_to(out);
    false
}

pub fn dual_from_matrix_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    grads[..16].copy_from_slice(&dual_vjp::from_matrix_vjp(&array(inputs[0]), dq(grad)));
    false
}

pub fn dual_apply<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    write_vec3(dual::apply(dq(inputs[0]), vec3(inputs[1])), out);
    false
}

pub fn dual_apply_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (ga, gp) = dual_vjp::apply_vjp(dq(inputs[0]), vec3(inputs[1]), vec3(grad));
    ga.write_to(&mut grads[..8]);
    write_vec3(gp, &mut grads[8..11]);
    false
}

pub fn dual_sclerp<T: Real>(inputs: &[&[T]], out: &mut [T]) -> bool {
    sclerp::sclerp(dq(inputs[0]), dq(inputs[1]), inputs[2][0]).write_to(out);
    false
}

pub fn dual_sclerp_backward<T: Real>(inputs: &[&[T]], grad: &[T], grads: &mut [T]) -> bool {
    let (ga, gb, gt) = sclerp::sclerp_vjp(dq(inputs[0]), dq(inputs[1]), inputs[2][0], dq(grad));
    ga.write_to(&mut grads[..8]);
    gb.write_to(&mut grads[8..16]);
    grads[16] = gt;
    false
}
