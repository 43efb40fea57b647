#![forbid(unsafe_code)]

//! Single-element quaternion and dual-quaternion algebra.
//!
//! Every forward operation has a matching vector-Jacobian product in
//! [`quat_vjp`], [`dual_vjp`] or [`sclerp`]. Nothing here knows about
//! batches; the CPU kernels lift these functions over lanes.

pub mod dual;
pub mod dual_vjp;
pub mod quat;
pub mod quat_vjp;
pub mod sclerp;
pub mod special;

pub use dual::DualQuat;
pub use quat::{Quat, Vec3};

#[cfg(test)]
pub(crate) mod testing {
    const STEP: f64 = 1e-6;
    const TOLERANCE: f64 = 1e-7;

    /// Central-difference estimate of `J(x)^T grad`.
    pub(crate) fn numeric_vjp<F>(f: F, x: &[f64], grad: &[f64]) -> Vec<f64>
    where
        F: Fn(&[f64]) -> Vec<f64>,
    {
        let mut shifted = x.to_vec();
        (0..x.len())
            .map(|idx| {
                shifted[idx] = x[idx] + STEP;
                let plus = f(&shifted);
                shifted[idx] = x[idx] - STEP;
                let minus = f(&shifted);
                shifted[idx] = x[idx];
                plus.iter()
                    .zip(&minus)
                    .zip(grad)
                    .map(|((p, m), g)| g * (p - m) / (2.0 * STEP))
                    .sum()
            })
            .collect()
    }

    pub(crate) fn assert_vjp_close(analytic: &[f64], numeric: &[f64]) {
        assert_eq!(analytic.len(), numeric.len());
        for (idx, (a, n)) in analytic.iter().zip(numeric).enumerate() {
            assert!(
                (a - n).abs() <= TOLERANCE * (1.0 + n.abs()),
                "component {idx}: analytic={a} numeric={n}\nanalytic={analytic:?}\nnumeric={numeric:?}"
            );
        }
    }
}
