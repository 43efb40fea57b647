//! Vector-Jacobian products of the [`crate::quat`] operations.
//!
//! Each function takes the forward inputs and the gradient of the forward
//! output and returns one gradient per input.

use dq_core::Real;

use crate::quat::{
    CANDIDATE_TERMS, Quat, Vec3, add3, best_candidate, dot3, matrix_terms, scale3,
    standardize_sign,
};
use crate::special::{atan_ratio, sinc_terms};

/// `(g b*, a* g)`, from `<a b, g> = <a, g b*> = <b, a* g>`.
#[must_use]
pub fn mul_vjp<T: Real>(a: Quat<T>, b: Quat<T>, grad: Quat<T>) -> (Quat<T>, Quat<T>) {
    (grad * b.conjugate(), a.conjugate() * grad)
}

#[must_use]
pub fn conjugate_vjp<T: Real>(grad: Quat<T>) -> Quat<T> {
    grad.conjugate()
}

#[must_use]
pub fn norm_squared_vjp<T: Real>(q: Quat<T>, grad: T) -> Quat<T> {
    q.scale(T::two() * grad)
}

/// Tangential projection of `grad` divided by `|q|`; exactly zero on the
/// identity fallback.
#[must_use]
pub fn normalize_vjp<T: Real>(q: Quat<T>, grad: Quat<T>) -> Quat<T> {
    let n = q.norm();
    let inv = n.recip();
    let unit = q.scale(inv);
    let projected = (grad - unit.scale(unit.dot(grad))).scale(inv);
    Quat::select(n >= T::NORM_EPS, projected, Quat::zero())
}

/// Gradients of `vec(q (0,v) q*)`: `-2 (0,g) q (0,v)` for `q` and
/// `vec(q* (0,g) q)` for `v`.
#[must_use]
pub fn rotate_vjp<T: Real>(q: Quat<T>, v: Vec3<T>, grad: Vec3<T>) -> (Quat<T>, Vec3<T>) {
    let g = Quat::pure(grad);
    let grad_v = (q.conjugate() * g * q).vector();
    let grad_q = (g * q * Quat::pure(v)).scale(-T::two());
    (grad_q, grad_v)
}

#[must_use]
pub fn exp_vjp<T: Real>(v: Vec3<T>, grad: Quat<T>) -> Vec3<T> {
    let theta = dot3(v, v).sqrt();
    let sinc = sinc_terms(theta);
    let grad_vec = grad.vector();
    let radial = sinc.derivative_over_theta * dot3(v, grad_vec) - sinc.value * grad.w;
    add3(scale3(grad_vec, sinc.value), scale3(v, radial))
}

#[must_use]
pub fn log_vjp<T: Real>(q: Quat<T>, grad: Vec3<T>) -> Quat<T> {
    let u = q.vector();
    let ratio = atan_ratio(dot3(u, u).sqrt(), q.w);
    let ug = dot3(u, grad);
    let grad_u = add3(scale3(grad, ratio.value), scale3(u, ug * ratio.ds_over_s));
    Quat::new(ug * ratio.dw, grad_u[0], grad_u[1], grad_u[2])
}

#[must_use]
pub fn from_axis_angle_vjp<T: Real>(r: Vec3<T>, grad: Quat<T>) -> Vec3<T> {
    scale3(exp_vjp(scale3(r, T::half()), grad), T::half())
}

#[must_use]
pub fn to_axis_angle_vjp<T: Real>(q: Quat<T>, grad: Vec3<T>) -> Quat<T> {
    log_vjp(q, scale3(grad, T::two()))
}

#[must_use]
pub fn to_matrix_vjp<T: Real>(q: Quat<T>, grad: &[T; 9]) -> Quat<T> {
    let Quat { w, x, y, z } = q;
    let [g00, g01, g02, g10, g11, g12, g20, g21, g22] = *grad;
    let two = T::two();
    Quat::new(
        two * (-z * g01 + y * g02 + z * g10 - x * g12 - y * g20 + x * g21),
        two * (y * g01 + z * g02 + y * g10 - two * x * g11 - w * g12 + z * g20 + w * g21
            - two * x * g22),
        two * (-two * y * g00 + x * g01 + w * g02 + x * g10 + z * g12 - w * g20 + z * g21
            - two * y * g22),
        two * (-two * z * g00 - w * g01 + x * g02 + w * g10 - two * z * g11
            + y * g12
            + x * g20
            + y * g21),
    )
}

/// Diagonal signs of `a_i = 1 +- m00 +- m11 +- m22`, per candidate.
const CANDIDATE_DIAGONAL: [[f64; 3]; 4] = [
    [1.0, 1.0, 1.0],
    [1.0, -1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
];

/// Gradient through the candidate selected in the forward pass.
#[must_use]
pub fn from_matrix_vjp<T: Real>(m: &[T; 9], grad: Quat<T>) -> [T; 9] {
    let terms = matrix_terms(m);
    let best = best_candidate(&terms);
    let row = CANDIDATE_TERMS[best];
    let r = terms[best].sqrt();
    let inv = (T::two() * r).recip();
    let q = Quat::new(
        terms[row[0]] * inv,
        terms[row[1]] * inv,
        terms[row[2]] * inv,
        terms[row[3]] * inv,
    );

    let mut grad_terms = [T::zero(); 10];
    for (slot, g) in row.iter().zip(grad.to_array()) {
        grad_terms[*slot] = grad_terms[*slot] + g * inv;
    }
    grad_terms[best] = grad_terms[best] - grad.dot(q) * inv / r;

    let diag = CANDIDATE_DIAGONAL[best];
    let ga = grad_terms[best];
    let [_, _, _, _, wx, wy, wz, xy, xz, yz] = grad_terms;
    [
        T::lit(diag[0]) * ga,
        xy - wz,
        wy + xz,
        wz + xy,
        T::lit(diag[1]) * ga,
        yz - wx,
        xz - wy,
        wx + yz,
        T::lit(diag[2]) * ga,
    ]
}

#[must_use]
pub fn standardize_vjp<T: Real>(q: Quat<T>, grad: Quat<T>) -> Quat<T> {
    grad.scale(standardize_sign(q))
}

#[cfg(test)]
mod tests {
    use super::{
        exp_vjp, from_axis_angle_vjp, from_matrix_vjp, log_vjp, mul_vjp, norm_squared_vjp,
        normalize_vjp, rotate_vjp, standardize_vjp, to_axis_angle_vjp, to_matrix_vjp,
    };
    use crate::quat::{
        Quat, exp, from_axis_angle, from_matrix, log, normalize, norm_squared, rotate, standardize,
        to_axis_angle, to_matrix,
    };
    use crate::testing::{assert_vjp_close, numeric_vjp};

    const Q: [f64; 4] = [0.7, -0.3, 0.5, 0.2];
    const R: [f64; 4] = [-0.1, 0.8, 0.4, -0.6];
    const V: [f64; 3] = [0.9, -1.3, 0.4];

    fn q(values: &[f64]) -> Quat<f64> {
        Quat::from_slice(values)
    }

    #[test]
    fn mul_vjp_matches_finite_differences() {
        let grad = [0.3, -0.7, 0.2, 0.9];
        let (ga, gb) = mul_vjp(q(&Q), q(&R), q(&grad));
        let joint = [Q.as_slice(), R.as_slice()].concat();
        let numeric = numeric_vjp(
            |x| (q(&x[..4]) * q(&x[4..])).to_array().to_vec(),
            &joint,
            &grad,
        );
        assert_vjp_close(&[ga.to_array(), gb.to_array()].concat(), &numeric);
    }

    #[test]
    fn norm_squared_and_normalize_vjps_match_finite_differences() {
        let gn = norm_squared_vjp(q(&Q), 1.5);
        let numeric = numeric_vjp(|x| vec![norm_squared(q(x))], &Q, &[1.5]);
        assert_vjp_close(&gn.to_array(), &numeric);

        let grad = [0.1, 0.4, -0.8, 0.3];
        let gu = normalize_vjp(q(&Q), q(&grad));
        let numeric = numeric_vjp(|x| normalize(q(x)).to_array().to_vec(), &Q, &grad);
        assert_vjp_close(&gu.to_array(), &numeric);
    }

    #[test]
    fn normalize_vjp_is_zero_on_fallback() {
        let g = normalize_vjp(Quat::<f64>::zero(), Quat::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(g, Quat::zero());
    }

    #[test]
    fn rotate_vjp_matches_finite_differences() {
        let grad = [0.5, 0.25, -1.0];
        let (gq, gv) = rotate_vjp(q(&Q), V, grad);
        let joint = [Q.as_slice(), V.as_slice()].concat();
        let numeric = numeric_vjp(
            |x| rotate(q(&x[..4]), [x[4], x[5], x[6]]).to_vec(),
            &joint,
            &grad,
        );
        assert_vjp_close(&[gq.to_array().as_slice(), gv.as_slice()].concat(), &numeric);
    }

    #[test]
    fn exp_and_axis_angle_vjps_match_finite_differences() {
        let grad = [0.2, -0.4, 0.6, 0.1];
        for scale in [1.0, 1e-4] {
            let v = [V[0] * scale, V[1] * scale, V[2] * scale];
            let numeric = numeric_vjp(|x| exp([x[0], x[1], x[2]]).to_array().to_vec(), &v, &grad);
            assert_vjp_close(&exp_vjp(v, q(&grad)), &numeric);

            let numeric = numeric_vjp(
                |x| from_axis_angle([x[0], x[1], x[2]]).to_array().to_vec(),
                &v,
                &grad,
            );
            assert_vjp_close(&from_axis_angle_vjp(v, q(&grad)), &numeric);
        }
    }

    #[test]
    fn log_and_axis_angle_vjps_match_finite_differences() {
        let grad = [0.3, 0.8, -0.5];
        let near_identity = [0.9, 2e-4, -1e-4, 3e-4];
        for sample in [Q, near_identity, [-0.6, 0.2, 0.3, -0.1]] {
            let numeric = numeric_vjp(|x| log(q(x)).to_vec(), &sample, &grad);
            assert_vjp_close(&log_vjp(q(&sample), grad).to_array(), &numeric);

            let numeric = numeric_vjp(|x| to_axis_angle(q(x)).to_vec(), &sample, &grad);
            assert_vjp_close(&to_axis_angle_vjp(q(&sample), grad).to_array(), &numeric);
        }
    }

    #[test]
    fn matrix_vjps_match_finite_differences() {
        let grad9 = [0.3, -0.1, 0.7, 0.2, -0.5, 0.4, 0.9, -0.3, 0.1];
        let numeric = numeric_vjp(|x| to_matrix(q(x)).to_vec(), &Q, &grad9);
        assert_vjp_close(&to_matrix_vjp(q(&Q), &grad9).to_array(), &numeric);

        let grad4 = [0.4, -0.2, 0.6, 0.3];
        for sample in [Q, R, [0.1, 0.2, 0.9, -0.3], [0.05, -0.1, 0.2, 0.95]] {
            let m = to_matrix(normalize(q(&sample)));
            let numeric = numeric_vjp(
                |x| {
                    let mut m = [0.0; 9];
                    m.copy_from_slice(x);
                    from_matrix(&m).to_array().to_vec()
                },
                &m,
                &grad4,
            );
            assert_vjp_close(&from_matrix_vjp(&m, q(&grad4)), &numeric);
        }
    }

    #[test]
    fn standardize_vjp_follows_sign_flip() {
        let grad = q(&[1.0, 2.0, 3.0, 4.0]);
        let negative = q(&[-0.5, 0.1, 0.2, 0.3]);
        assert_eq!(standardize_vjp(negative, grad), -grad);
        assert_eq!(standardize_vjp(standardize(negative), grad), grad);
    }

    fn narrow(values: &[f64]) -> Quat<f32> {
        Quat::from_slice(&values.iter().map(|v| *v as f32).collect::<Vec<_>>())
    }

    fn widen(q: Quat<f32>) -> [f64; 4] {
        q.to_array().map(f64::from)
    }

    #[test]
    fn f32_exp_and_log_vjp_track_f64_around_series_switch() {
        let grad = [0.4, -0.2, 0.7, 0.1];
        let axis = [0.48, -0.6, 0.64];
        for theta in [0.005, 0.0099, 0.0101, 0.3] {
            let v32 = axis.map(|a: f64| (a * theta) as f32);
            let v64 = v32.map(f64::from);

            let g32 = exp_vjp(v32, narrow(&grad)).map(f64::from);
            let g64 = exp_vjp(v64, q(&grad));
            for (lhs, rhs) in g32.iter().zip(&g64) {
                assert!((lhs - rhs).abs() <= 1e-6, "theta={theta} f32={g32:?} f64={g64:?}");
            }

            let q32 = exp(v32);
            let log32 = log_vjp(q32, [0.3f32, -0.5, 0.2]);
            let log64 = log_vjp(Quat::from_slice(&widen(q32)), [0.3, -0.5, 0.2]);
            let log32 = widen(log32);
            for (lhs, rhs) in log32.iter().zip(&log64.to_array()) {
                assert!((lhs - rhs).abs() <= 1e-5, "theta={theta} f32={log32:?} f64={log64:?}");
            }
        }
    }

    #[test]
    fn f32_normalize_vjp_switches_to_zero_at_its_own_threshold() {
        let grad = [0.4, -0.2, 0.7, 0.1];
        let tiny = Q.map(|v| v * 5e-7);
        let g32 = widen(normalize_vjp(narrow(&tiny), narrow(&grad)));
        assert_eq!(g32, [0.0; 4]);
        let g64 = normalize_vjp(q(&tiny), q(&grad));
        assert!(g64.to_array().iter().any(|v| v.abs() > 1.0));

        let small = widen(narrow(&Q.map(|v| v * 1e-3)));
        let g32 = widen(normalize_vjp(narrow(&small), narrow(&grad)));
        let g64 = normalize_vjp(q(&small), q(&grad)).to_array();
        let scale = g64.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        for (lhs, rhs) in g32.iter().zip(&g64) {
            assert!((lhs - rhs).abs() <= 1e-5 * scale, "{g32:?} vs {g64:?}");
        }
    }
}
