//! Screw linear interpolation `A (A* B)^t`.
//!
//! The relative motion `D = A* B` is used with the sign the caller gave, so
//! `t = 0` returns `A` and `t = 1` returns `B` component for component. A
//! caller that wants the shorter screw flips `B` onto the hemisphere of `A`
//! first. `t` is never clamped: values outside `[0, 1]` extrapolate along
//! the same screw.

use dq_core::Real;

use crate::dual::{self, DualQuat};
use crate::dual_vjp;
use crate::quat::{Quat, Vec3, dot3, scale3};
use crate::special::{ScrewCoefficients, screw_coefficients};

/// Screw parameters of a relative motion `D`; `phi` lies in `[0, pi]`.
struct Screw<T> {
    w: T,
    v: Vec3<T>,
    wd: T,
    vd: Vec3<T>,
    s: T,
    rho: T,
    phi: T,
    coefficients: ScrewCoefficients<T>,
}

impl<T: Real> Screw<T> {
    fn new(d: DualQuat<T>, t: T) -> Self {
        let v = d.real.vector();
        let s = dot3(v, v).sqrt();
        let rho = (s * s + d.real.w * d.real.w).sqrt();
        // Only reachable for a zero real part; keeps the ratios finite.
        let rho = T::select(rho < T::NORM_EPS, T::one(), rho);
        let phi = s.atan2(d.real.w);
        let coefficients = screw_coefficients(phi, s / rho, d.real.w / rho, t);
        Self {
            w: d.real.w,
            v,
            wd: d.dual.w,
            vd: d.dual.vector(),
            s,
            rho,
            phi,
            coefficients,
        }
    }
}

/// `D^t` for a relative motion `D` whose real part is not a full turn.
#[must_use]
pub fn power<T: Real>(d: DualQuat<T>, t: T) -> DualQuat<T> {
    let screw = Screw::new(d, t);
    let ScrewCoefficients { cos_tphi, k, g, .. } = screw.coefficients;
    let real_v = scale3(screw.v, k);
    let dual_v = [
        k * screw.vd[0] + g * screw.wd * screw.v[0],
        k * screw.vd[1] + g * screw.wd * screw.v[1],
        k * screw.vd[2] + g * screw.wd * screw.v[2],
    ];
    DualQuat::new(
        Quat::new(cos_tphi, real_v[0], real_v[1], real_v[2]),
        Quat::new(t * k * screw.wd, dual_v[0], dual_v[1], dual_v[2]),
    )
}

/// Gradients of [`power`] with respect to `d` and `t`.
#[must_use]
pub fn power_vjp<T: Real>(d: DualQuat<T>, t: T, grad: DualQuat<T>) -> (DualQuat<T>, T) {
    let screw = Screw::new(d, t);
    let ScrewCoefficients {
        sin_tphi,
        k,
        g,
        g1,
        dk_dt,
        dg_dt,
        ..
    } = screw.coefficients;
    let Screw {
        w,
        v,
        wd,
        vd,
        s,
        rho,
        phi,
        ..
    } = screw;

    let grad_rw = grad.real.w;
    let grad_rv = grad.real.vector();
    let grad_dw = grad.dual.w;
    let grad_dv = grad.dual.vector();

    // Adjoints of k and g as they enter the output.
    let adj_k = dot3(grad_rv, v) + t * wd * grad_dw + dot3(grad_dv, vd);
    let adj_g = wd * dot3(grad_dv, v);

    // d/dphi folded with dphi/d(w, s) = (-s, w) / rho^2; the factor sin(phi)
    // of the phi-derivatives cancels against s / rho.
    let b = -t * k * grad_rw - g * adj_k + g1 * adj_g;
    let rho3 = rho * rho * rho;

    let grad_w = -b * s * s / rho3;
    let radial = b * w / rho3;
    let grad_v = [
        k * grad_rv[0] + g * wd * grad_dv[0] + radial * v[0],
        k * grad_rv[1] + g * wd * grad_dv[1] + radial * v[1],
        k * grad_rv[2] + g * wd * grad_dv[2] + radial * v[2],
    ];
    let grad_wd = t * k * grad_dw + g * dot3(grad_dv, v);
    let grad_vd = scale3(grad_dv, k);
    let grad_t = -phi * sin_tphi * grad_rw + k * wd * grad_dw + adj_k * dk_dt + adj_g * dg_dt;

    (
        DualQuat::new(
            Quat::new(grad_w, grad_v[0], grad_v[1], grad_v[2]),
            Quat::new(grad_wd, grad_vd[0], grad_vd[1], grad_vd[2]),
        ),
        grad_t,
    )
}

/// `A* B`, negated only when its real part is a full turn `(-1, 0, 0, 0)`,
/// which has no screw axis.
fn relative<T: Real>(a: DualQuat<T>, b: DualQuat<T>) -> (DualQuat<T>, T) {
    let raw = dual::mul(dual::conjugate(a), b);
    let v = raw.real.vector();
    let full_turn = raw.real.w < T::zero() && dot3(v, v) < T::NORM_EPS * T::NORM_EPS;
    let sign = T::select(full_turn, -T::one(), T::one());
    (raw.scale(sign), sign)
}

#[must_use]
pub fn sclerp<T: Real>(a: DualQuat<T>, b: DualQuat<T>, t: T) -> DualQuat<T> {
    let (d, _) = relative(a, b);
    dual::mul(a, power(d, t))
}

/// Gradients of [`sclerp`] for `a`, `b` and `t`.
#[must_use]
pub fn sclerp_vjp<T: Real>(
    a: DualQuat<T>,
    b: DualQuat<T>,
    t: T,
    grad: DualQuat<T>,
) -> (DualQuat<T>, DualQuat<T>, T) {
    let a_conj = dual::conjugate(a);
    let (d, sign) = relative(a, b);
    let p = power(d, t);

    let (grad_a_outer, grad_p) = dual_vjp::mul_vjp(a, p, grad);
    let (grad_d, grad_t) = power_vjp(d, t, grad_p);
    let (grad_a_conj, grad_b) = dual_vjp::mul_vjp(a_conj, b, grad_d.scale(sign));
    let grad_a = grad_a_outer + dual_vjp::conjugate_vjp(grad_a_conj);
    (grad_a, grad_b, grad_t)
}
