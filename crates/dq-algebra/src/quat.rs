use std::ops::{Add, Mul, Neg, Sub};

use dq_core::Real;

use crate::special::{atan_ratio, sinc_terms};

pub type Vec3<T> = [T; 3];

/// Quaternion stored as `(w, x, y, z)` with scalar part first.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quat<T> {
    pub w: T,
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Real> Quat<T> {
    #[must_use]
    pub const fn new(w: T, x: T, y: T, z: T) -> Self {
        Self { w, x, y, z }
    }

    #[must_use]
    pub fn identity() -> Self {
        Self::new(T::one(), T::zero(), T::zero(), T::zero())
    }

    #[must_use]
    pub fn zero() -> Self {
        Self::new(T::zero(), T::zero(), T::zero(), T::zero())
    }

    /// Pure quaternion `(0, v)`.
    #[must_use]
    pub fn pure(v: Vec3<T>) -> Self {
        Self::new(T::zero(), v[0], v[1], v[2])
    }

    /// Reads the first four components of `values`.
    #[must_use]
    pub fn from_slice(values: &[T]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn write_to(self, out: &mut [T]) {
        out[0] = self.w;
        out[1] = self.x;
        out[2] = self.y;
        out[3] = self.z;
    }

    #[must_use]
    pub fn to_array(self) -> [T; 4] {
        [self.w, self.x, self.y, self.z]
    }

    #[must_use]
    pub fn vector(self) -> Vec3<T> {
        [self.x, self.y, self.z]
    }

    #[must_use]
    pub fn scale(self, factor: T) -> Self {
        Self::new(
            self.w * factor,
            self.x * factor,
            self.y * factor,
            self.z * factor,
        )
    }

    #[must_use]
    pub fn dot(self, other: Self) -> T {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[must_use]
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    #[must_use]
    pub fn norm_squared(self) -> T {
        self.dot(self)
    }

    #[must_use]
    pub fn norm(self) -> T {
        self.norm_squared().sqrt()
    }

    #[must_use]
    pub fn select(cond: bool, when_true: Self, when_false: Self) -> Self {
        Self::new(
            T::select(cond, when_true.w, when_false.w),
            T::select(cond, when_true.x, when_false.x),
            T::select(cond, when_true.y, when_false.y),
            T::select(cond, when_true.z, when_false.z),
        )
    }
}

impl<T: Real> Add for Quat<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.w + rhs.w,
            self.x + rhs.x,
            self.y + rhs.y,
            self.z + rhs.z,
        )
    }
}

impl<T: Real> Sub for Quat<T> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.w - rhs.w,
            self.x - rhs.x,
            self.y - rhs.y,
            self.z - rhs.z,
        )
    }
}

impl<T: Real> Neg for Quat<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.w, -self.x, -self.y, -self.z)
    }
}

/// Hamilton product, `i * j = k`.
impl<T: Real> Mul for Quat<T> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let a = self;
        let b = rhs;
        Self::new(
            a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        )
    }
}

#[must_use]
pub fn dot3<T: Real>(a: Vec3<T>, b: Vec3<T>) -> T {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[must_use]
pub fn add3<T: Real>(a: Vec3<T>, b: Vec3<T>) -> Vec3<T> {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[must_use]
pub fn scale3<T: Real>(a: Vec3<T>, factor: T) -> Vec3<T> {
    [a[0] * factor, a[1] * factor, a[2] * factor]
}

#[must_use]
pub fn mul<T: Real>(a: Quat<T>, b: Quat<T>) -> Quat<T> {
    a * b
}

#[must_use]
pub fn conjugate<T: Real>(q: Quat<T>) -> Quat<T> {
    q.conjugate()
}

#[must_use]
pub fn norm_squared<T: Real>(q: Quat<T>) -> T {
    q.norm_squared()
}

/// True when `normalize` falls back to the identity for `q`.
#[must_use]
pub fn is_degenerate<T: Real>(q: Quat<T>) -> bool {
    q.norm() < T::NORM_EPS
}

/// Unit quaternion along `q`; the identity when `|q| < NORM_EPS`.
#[must_use]
pub fn normalize<T: Real>(q: Quat<T>) -> Quat<T> {
    let n = q.norm();
    Quat::select(n >= T::NORM_EPS, q.scale(n.recip()), Quat::identity())
}

/// `vec(q (0, v) q*)`. Not renormalised: a non-unit `q` scales by `|q|^2`.
#[must_use]
pub fn rotate<T: Real>(q: Quat<T>, v: Vec3<T>) -> Vec3<T> {
    (q * Quat::pure(v) * q.conjugate()).vector()
}

/// Exponential of the pure quaternion `(0, v)`.
#[must_use]
pub fn exp<T: Real>(v: Vec3<T>) -> Quat<T> {
    let theta = dot3(v, v).sqrt();
    let sinc = sinc_terms(theta);
    Quat::new(
        theta.cos(),
        sinc.value * v[0],
        sinc.value * v[1],
        sinc.value * v[2],
    )
}

/// Vector part of the principal logarithm of a unit quaternion.
///
/// Quaternions within `NORM_EPS` of the negative real axis map to the zero
/// vector, the same rotation as `-q`.
#[must_use]
pub fn log<T: Real>(q: Quat<T>) -> Vec3<T> {
    let u = q.vector();
    let ratio = atan_ratio(dot3(u, u).sqrt(), q.w);
    scale3(u, ratio.value)
}

/// Unit quaternion rotating by `|r|` radians about `r`.
#[must_use]
pub fn from_axis_angle<T: Real>(r: Vec3<T>) -> Quat<T> {
    exp(scale3(r, T::half()))
}

#[must_use]
pub fn to_axis_angle<T: Real>(q: Quat<T>) -> Vec3<T> {
    scale3(log(q), T::two())
}

/// Row-major 3x3 rotation matrix from the unit-quaternion formula.
#[must_use]
pub fn to_matrix<T: Real>(q: Quat<T>) -> [T; 9] {
    let Quat { w, x, y, z } = q;
    let one = T::one();
    let two = T::two();
    [
        one - two * (y * y + z * z),
        two * (x * y - w * z),
        two * (x * z + w * y),
        two * (x * y + w * z),
        one - two * (x * x + z * z),
        two * (y * z - w * x),
        two * (x * z - w * y),
        two * (y * z + w * x),
        one - two * (x * x + y * y),
    ]
}

/// Index into [`matrix_terms`] of each quaternion component, per candidate.
pub(crate) const CANDIDATE_TERMS: [[usize; 4]; 4] =
    [[0, 4, 5, 6], [4, 1, 7, 8], [5, 7, 2, 9], [6, 8, 9, 3]];

/// `[4w^2, 4x^2, 4y^2, 4z^2, 4wx, 4wy, 4wz, 4xy, 4xz, 4yz]` read off a
/// rotation matrix.
#[must_use]
pub(crate) fn matrix_terms<T: Real>(m: &[T; 9]) -> [T; 10] {
    let one = T::one();
    [
        one + m[0] + m[4] + m[8],
        one + m[0] - m[4] - m[8],
        one - m[0] + m[4] - m[8],
        one - m[0] - m[4] + m[8],
        m[7] - m[5],
        m[2] - m[6],
        m[3] - m[1],
        m[1] + m[3],
        m[2] + m[6],
        m[5] + m[7],
    ]
}

/// Candidate with the largest diagonal term; ties keep the lowest index.
#[must_use]
pub(crate) fn best_candidate<T: Real>(terms: &[T; 10]) -> usize {
    let mut best = 0;
    for candidate in 1..4 {
        if terms[candidate] > terms[best] {
            best = candidate;
        }
    }
    best
}

/// Unit quaternion of a rotation matrix.
///
/// The candidate whose diagonal term is largest is used, so the divisor is
/// never below `1`. The selected component comes out positive.
#[must_use]
pub fn from_matrix<T: Real>(m: &[T; 9]) -> Quat<T> {
    let terms = matrix_terms(m);
    let best = best_candidate(&terms);
    let row = CANDIDATE_TERMS[best];
    let inv = (T::two() * terms[best].sqrt()).recip();
    Quat::new(
        terms[row[0]] * inv,
        terms[row[1]] * inv,
        terms[row[2]] * inv,
        terms[row[3]] * inv,
    )
}

/// Sign flip onto the `w >= 0` hemisphere; `w = 0` keeps its sign.
#[must_use]
pub fn standardize<T: Real>(q: Quat<T>) -> Quat<T> {
    q.scale(standardize_sign(q))
}

#[must_use]
pub(crate) fn standardize_sign<T: Real>(q: Quat<T>) -> T {
    T::select(q.w < T::zero(), -T::one(), T::one())
}

#[cfg(test)]
mod tests {
    use super::{
        Quat, exp, from_axis_angle, from_matrix, log, normalize, rotate, standardize, to_axis_angle,
        to_matrix,
    };

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= tol, "actual={actual:?} expected={expected:?}");
        }
    }

    #[test]
    fn hamilton_basis_products_follow_ijk_rule() {
        let i = Quat::new(0.0, 1.0, 0.0, 0.0);
        let j = Quat::new(0.0, 0.0, 1.0, 0.0);
        let k = Quat::new(0.0, 0.0, 0.0, 1.0);
        assert_eq!(i * j, k);
        assert_eq!(j * k, i);
        assert_eq!(k * i, j);
        assert_eq!(j * i, -k);
        assert_eq!(i * i, Quat::new(-1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn normalize_zero_returns_identity() {
        assert_eq!(normalize(Quat::<f64>::zero()), Quat::identity());
        assert_eq!(normalize(Quat::<f32>::zero()), Quat::identity());
        let unit = normalize(Quat::new(0.0, 3.0, 0.0, 4.0));
        assert_close(&unit.to_array(), &[0.0, 0.6, 0.0, 0.8], 1e-15);
    }

    #[test]
    fn rotate_quarter_turn_about_z() {
        let q = from_axis_angle([0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        assert_close(&rotate(q, [1.0, 0.0, 0.0]), &[0.0, 1.0, 0.0], 1e-15);
    }

    #[test]
    fn rotate_with_non_unit_quaternion_scales_by_norm_squared() {
        let q = Quat::new(2.0, 0.0, 0.0, 0.0);
        assert_close(&rotate(q, [1.0, -2.0, 0.5]), &[4.0, -8.0, 2.0], 1e-15);
    }

    #[test]
    fn exp_of_zero_is_identity_and_log_of_identity_is_zero() {
        assert_eq!(exp([0.0f64, 0.0, 0.0]), Quat::identity());
        assert_eq!(log(Quat::<f64>::identity()), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn log_of_negative_identity_maps_to_zero_vector() {
        assert_eq!(log(Quat::new(-1.0f64, 0.0, 0.0, 0.0)), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn axis_angle_round_trips_across_series_threshold() {
        for angle in [1e-9, 1e-4, 9e-4, 1.1e-3, 0.3, 2.5] {
            let r = [angle * 0.48, -angle * 0.6, angle * 0.64];
            let back = to_axis_angle(from_axis_angle(r));
            assert_close(&back, &r, 1e-14);
        }
    }

    #[test]
    fn matrix_round_trip_recovers_quaternion_up_to_sign() {
        let samples = [
            Quat::new(0.9, 0.1, -0.3, 0.2),
            Quat::new(0.01, 0.99, 0.05, -0.1),
            Quat::new(-0.2, 0.1, 0.95, 0.2),
            Quat::new(0.0, 0.0, 0.0, 1.0),
        ];
        for q in samples {
            let q = normalize(q);
            let back = from_matrix(&to_matrix(q));
            let aligned = if back.dot(q) < 0.0 { -back } else { back };
            assert_close(&aligned.to_array(), &q.to_array(), 1e-14);
        }
    }

    #[test]
    fn from_matrix_of_identity_is_identity() {
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        assert_eq!(from_matrix(&m), Quat::identity());
    }

    #[test]
    fn standardize_flips_only_negative_scalar_part() {
        assert_eq!(
            standardize(Quat::new(-0.5, 0.5, -0.5, 0.5)),
            Quat::new(0.5, -0.5, 0.5, -0.5)
        );
        assert_eq!(
            standardize(Quat::new(0.0, -1.0, 0.0, 0.0)),
            Quat::new(0.0, -1.0, 0.0, 0.0)
        );
    }
}
