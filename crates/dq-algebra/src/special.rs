//! Scalar coefficient functions shared by the exp/log and ScLERP kernels.
//!
//! Each helper evaluates the closed form and its Taylor expansion and picks
//! one with a value select, so both branches stay finite-valued on the side
//! they are used.

use dq_core::Real;

/// Evaluates `c[0] + c[1] x + c[2] x^2 + ...` by Horner's rule.
#[must_use]
pub fn horner<T: Real>(x: T, coefficients: &[f64]) -> T {
    coefficients
        .iter()
        .rev()
        .fold(T::zero(), |acc, c| acc * x + T::lit(*c))
}

/// `sin(theta)/theta` and `d/dtheta(sin(theta)/theta) / theta`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SincTerms<T> {
    pub value: T,
    pub derivative_over_theta: T,
}

#[must_use]
pub fn sinc_terms<T: Real>(theta: T) -> SincTerms<T> {
    let theta2 = theta * theta;
    let series = theta < T::SERIES_EPS;

    let value_series = horner(
        theta2,
        &[1.0, -1.0 / 6.0, 1.0 / 120.0, -1.0 / 5040.0],
    );
    let derivative_series = horner(
        theta2,
        &[-1.0 / 3.0, 1.0 / 30.0, -1.0 / 840.0, 1.0 / 45360.0],
    );

    let (sin, cos) = theta.sin_cos();
    let value_exact = sin / theta;
    let derivative_exact = (theta * cos - sin) / (theta2 * theta);

    SincTerms {
        value: T::select(series, value_series, value_exact),
        derivative_over_theta: T::select(series, derivative_series, derivative_exact),
    }
}

/// `atan2(s, w) / s` for `s = |u| >= 0` and its partial derivatives.
///
/// `tiny` marks inputs with `s < NORM_EPS` and no usable series (the point
/// sits on or behind the origin of the real axis); there the ratio and its
/// derivatives are all zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtanRatio<T> {
    pub value: T,
    /// `(d ratio / d s) / s`.
    pub ds_over_s: T,
    pub dw: T,
    pub tiny: bool,
}

#[must_use]
pub fn atan_ratio<T: Real>(s: T, w: T) -> AtanRatio<T> {
    let series = s < T::SERIES_EPS * w;
    let tiny = !series && s < T::NORM_EPS;
    let rho2 = s * s + w * w;

    let inv_w = w.recip();
    let x = s * inv_w;
    let value_series = inv_w * horner(x * x, &[1.0, -1.0 / 3.0, 1.0 / 5.0, -1.0 / 7.0]);
    let ds_series = inv_w
        * inv_w
        * inv_w
        * horner(x * x, &[-2.0 / 3.0, 4.0 / 5.0, -6.0 / 7.0]);

    let phi = s.atan2(w);
    let value_exact = phi / s;
    let ds_exact = (w * s / rho2 - phi) / (s * s * s);

    let zero = T::zero();
    AtanRatio {
        value: T::select(tiny, zero, T::select(series, value_series, value_exact)),
        ds_over_s: T::select(tiny, zero, T::select(series, ds_series, ds_exact)),
        dw: T::select(tiny, zero, -rho2.recip()),
        tiny,
    }
}

/// Coefficients of the screw power `D^t` at half-angle `phi`.
///
/// `k = sin(t phi)/sin(phi)` and
/// `g = (sin(t phi) cos(phi) - t cos(t phi) sin(phi)) / sin^3(phi)` drive the
/// forward map. `g1` satisfies `dg/dphi = g1 sin(phi)` (and `dk/dphi = -g
/// sin(phi)`), which keeps the backward pass finite as `phi -> 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrewCoefficients<T> {
    pub sin_tphi: T,
    pub cos_tphi: T,
    pub k: T,
    pub g: T,
    pub g1: T,
    pub dk_dt: T,
    pub dg_dt: T,
}

#[must_use]
pub fn screw_coefficients<T: Real>(phi: T, sin_phi: T, cos_phi: T, t: T) -> ScrewCoefficients<T> {
    let tphi = t * phi;
    let (sin_tphi, cos_tphi) = tphi.sin_cos();
    let series = phi < T::SCREW_SERIES_EPS;

    // Exact forms divide by powers of sin(phi).
    let inv_sin = sin_phi.recip();
    let inv_sin2 = inv_sin * inv_sin;
    let inv_sin3 = inv_sin2 * inv_sin;
    let k_exact = sin_tphi * inv_sin;
    let g_exact = (sin_tphi * cos_phi - t * cos_tphi * sin_phi) * inv_sin3;
    let g1_exact = ((t * t - T::one()) * k_exact - T::lit(3.0) * g_exact * cos_phi) * inv_sin2;
    let dk_dt_exact = phi * cos_tphi * inv_sin;
    let dg_dt_exact = (phi * cos_tphi * cos_phi - cos_tphi * sin_phi + tphi * sin_tphi * sin_phi)
        * inv_sin3;

    // Series in phi^2 through phi^4.
    let p2 = phi * phi;
    let t2 = t * t;
    let one = T::one();
    let c1 = t * (t2 - one);
    let c2 = c1 * (t2 - T::lit(4.0));
    let c3 = c2 * (t2 - T::lit(9.0));
    let k_series = t - p2 * c1 / T::lit(6.0)
        + p2 * p2 * c1 * (T::lit(3.0) * t2 - T::lit(7.0)) / T::lit(360.0);
    let g_series = c1 / T::lit(3.0) - p2 * c2 / T::lit(30.0)
        + p2 * p2 * c2 * (T::lit(3.0) * t2 - T::lit(20.0)) / T::lit(2520.0);
    let g1_series = -c2 / T::lit(15.0) + p2 * c3 / T::lit(210.0)
        - p2 * p2 * c3 * (t2 - T::lit(13.0)) / T::lit(7560.0);
    let dk_dt_series = one - p2 * horner(t2, &[-1.0, 3.0]) / T::lit(6.0)
        + p2 * p2 * horner(t2, &[7.0, -30.0, 15.0]) / T::lit(360.0);
    let dg_dt_series = horner(t2, &[-1.0, 3.0]) / T::lit(3.0)
        - p2 * horner(t2, &[4.0, -15.0, 5.0]) / T::lit(30.0)
        + p2 * p2 * horner(t2, &[-80.0, 336.0, -175.0, 21.0]) / T::lit(2520.0);

    ScrewCoefficients {
        sin_tphi,
        cos_tphi,
        k: T::select(series, k_series, k_exact),
        g: T::select(series, g_series, g_exact),
        g1: T::select(series, g1_series, g1_exact),
        dk_dt: T::select(series, dk_dt_series, dk_dt_exact),
        dg_dt: T::select(series, dg_dt_series, dg_dt_exact),
    }
}

#[cfg(test)]
mod tests {
    use super::{atan_ratio, horner, screw_coefficients, sinc_terms};

    fn exact_screw(phi: f64, t: f64) -> [f64; 5] {
        let (s, c) = phi.sin_cos();
        let (st, ct) = (t * phi).sin_cos();
        let k = st / s;
        let g = (st * c - t * ct * s) / s.powi(3);
        let g1 = ((t * t - 1.0) * k - 3.0 * g * c) / (s * s);
        let dk = phi * ct / s;
        let dg = (phi * ct * c - ct * s + t * phi * st * s) / s.powi(3);
        [k, g, g1, dk, dg]
    }

    #[test]
    fn horner_evaluates_in_ascending_powers() {
        assert_eq!(horner(2.0f64, &[1.0, 3.0, 0.5]), 1.0 + 6.0 + 2.0);
    }

    fn exact_sinc(theta: f64) -> (f64, f64) {
        let (s, c) = theta.sin_cos();
        (s / theta, (theta * c - s) / theta.powi(3))
    }

    #[test]
    fn sinc_branches_agree_at_threshold() {
        for theta in [0.999e-3f64, 1.001e-3] {
            let got = sinc_terms(theta);
            let (value, derivative_over_theta) = exact_sinc(theta);
            assert!((got.value - value).abs() < 1e-12, "theta={theta}");
            // The closed form loses digits to cancellation at this angle.
            assert!(
                (got.derivative_over_theta - derivative_over_theta).abs() < 1e-6,
                "theta={theta}"
            );
        }
        let series = sinc_terms(0.999e-3f64);
        assert!((series.derivative_over_theta + 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn atan_ratio_series_matches_closed_form() {
        let w = 0.8f64;
        let s = 0.999e-3 * w;
        let series = atan_ratio(s, w);
        let exact = s.atan2(w) / s;
        assert!(!series.tiny);
        assert!((series.value - exact).abs() < 1e-13);
        let exact_ds = (w * s / (s * s + w * w) - s.atan2(w)) / s.powi(3);
        assert!((series.ds_over_s - exact_ds).abs() < 1e-6);
    }

    #[test]
    fn atan_ratio_behind_origin_is_tiny_and_zero() {
        let ratio = atan_ratio(0.0f64, -1.0);
        assert!(ratio.tiny);
        assert_eq!(ratio.value, 0.0);
        assert_eq!(ratio.ds_over_s, 0.0);
        assert_eq!(ratio.dw, 0.0);
    }

    #[test]
    fn screw_series_matches_closed_form_near_threshold() {
        for t in [-0.5, 0.0, 0.3, 1.0, 1.5] {
            let phi = 0.0201f64;
            let exact = exact_screw(phi, t);
            let below = screw_coefficients(0.0199f64, 0.0199f64.sin(), 0.0199f64.cos(), t);
            let reference = exact_screw(0.0199, t);
            let got = [below.k, below.g, below.g1, below.dk_dt, below.dg_dt];
            for (a, e) in got.iter().zip(reference) {
                assert!((a - e).abs() < 1e-7, "t={t} series={got:?} exact={reference:?}");
            }
            let above = screw_coefficients(phi, phi.sin(), phi.cos(), t);
            assert!((above.k - exact[0]).abs() < 1e-15);
        }
    }

    #[test]
    fn screw_coefficients_at_zero_angle_are_finite() {
        let c = screw_coefficients(0.0f64, 0.0, 1.0, 0.25);
        assert_eq!(c.k, 0.25);
        assert_eq!(c.dk_dt, 1.0);
        assert!(c.g.is_finite() && c.g1.is_finite() && c.dg_dt.is_finite());
    }
}
