use std::ops::{Add, Neg};

use dq_core::Real;

use crate::quat::{self, Quat, Vec3, add3};

/// Dual quaternion `real + eps * dual`, stored as eight components
/// `(real.w, real.x, real.y, real.z, dual.w, dual.x, dual.y, dual.z)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DualQuat<T> {
    pub real: Quat<T>,
    pub dual: Quat<T>,
}

impl<T: Real> DualQuat<T> {
    #[must_use]
    pub const fn new(real: Quat<T>, dual: Quat<T>) -> Self {
        Self { real, dual }
    }

    #[must_use]
    pub fn identity() -> Self {
        Self::new(Quat::identity(), Quat::zero())
    }

    #[must_use]
    pub fn from_slice(values: &[T]) -> Self {
        Self::new(Quat::from_slice(&values[..4]), Quat::from_slice(&values[4..8]))
    }

    pub fn write_to(self, out: &mut [T]) {
        self.real.write_to(&mut out[..4]);
        self.dual.write_to(&mut out[4..8]);
    }

    #[must_use]
    pub fn to_array(self) -> [T; 8] {
        let mut out = [T::zero(); 8];
        self.write_to(&mut out);
        out
    }

    #[must_use]
    pub fn scale(self, factor: T) -> Self {
        Self::new(self.real.scale(factor), self.dual.scale(factor))
    }

    #[must_use]
    pub fn select(cond: bool, when_true: Self, when_false: Self) -> Self {
        Self::new(
            Quat::select(cond, when_true.real, when_false.real),
            Quat::select(cond, when_true.dual, when_false.dual),
        )
    }
}

impl<T: Real> Add for DualQuat<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.real + rhs.real, self.dual + rhs.dual)
    }
}

impl<T: Real> Neg for DualQuat<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.real, -self.dual)
    }
}

/// `(A_r B_r, A_r B_d + A_d B_r)`. As a rigid transform this applies `b`
/// first, then `a`.
#[must_use]
pub fn mul<T: Real>(a: DualQuat<T>, b: DualQuat<T>) -> DualQuat<T> {
    DualQuat::new(a.real * b.real, a.real * b.dual + a.dual * b.real)
}

/// Quaternion conjugate of both parts; the inverse of a unit dual quaternion.
#[must_use]
pub fn conjugate<T: Real>(a: DualQuat<T>) -> DualQuat<T> {
    DualQuat::new(a.real.conjugate(), a.dual.conjugate())
}

#[must_use]
pub fn number_conjugate<T: Real>(a: DualQuat<T>) -> DualQuat<T> {
    DualQuat::new(a.real, -a.dual)
}

#[must_use]
pub fn full_conjugate<T: Real>(a: DualQuat<T>) -> DualQuat<T> {
    DualQuat::new(a.real.conjugate(), -a.dual.conjugate())
}

#[must_use]
pub fn is_degenerate<T: Real>(a: DualQuat<T>) -> bool {
    quat::is_degenerate(a.real)
}

/// Scales to a unit real part and projects the dual part orthogonal to it.
///
/// Falls back to the identity transform when `|A_r| < NORM_EPS`.
#[must_use]
pub fn normalize<T: Real>(a: DualQuat<T>) -> DualQuat<T> {
    let n = a.real.norm();
    let inv = n.recip();
    let real = a.real.scale(inv);
    let dual = a.dual.scale(inv);
    let dual = dual - real.scale(real.dot(dual));
    DualQuat::select(
        n >= T::NORM_EPS,
        DualQuat::new(real, dual),
        DualQuat::identity(),
    )
}

/// `(q, 1/2 (0, t) q)`.
#[must_use]
pub fn from_rigid<T: Real>(q: Quat<T>, t: Vec3<T>) -> DualQuat<T> {
    DualQuat::new(q, (Quat::pure(t) * q).scale(T::half()))
}

/// Rotation and translation `2 vec(A_d A_r*)`.
#[must_use]
pub fn to_rigid<T: Real>(a: DualQuat<T>) -> (Quat<T>, Vec3<T>) {
    (a.real, translation(a))
}

#[must_use]
pub fn translation<T: Real>(a: DualQuat<T>) -> Vec3<T> {
    (a.dual * a.real.conjugate()).scale(T::two()).vector()
}

/// Row-major homogeneous matrix `[R t; 0 0 0 1]`.
#[must_use]
pub fn to_matrix<T: Real>(a: DualQuat<T>) -> [T; 16] {
    let r = quat::to_matrix(a.real);
    let t = translation(a);
    let zero = T::zero();
    [
        r[0],
        r[1],
        r[2],
        t[0],
        r[3],
        r[4],
        r[5],
        t[1],
        r[6],
        r[7],
        r[8],
        t[2],
        zero,
        zero,
        zero,
        T::one(),
    ]
}

/// Upper-left 3x3 block and translation column of a homogeneous matrix.
#[must_use]
pub(crate) fn split_homogeneous<T: Real>(m: &[T; 16]) -> ([T; 9], Vec3<T>) {
    (
        [m[0], m[1], m[2], m[4], m[5], m[6], m[8], m[9], m[10]],
        [m[3], m[7], m[11]],
    )
}

/// Inverse of [`to_matrix`] for rigid matrices; the bottom row is ignored.
#[must_use]
pub fn from_matrix<T: Real>(m: &[T; 16]) -> DualQuat<T> {
    let (rotation, t) = split_homogeneous(m);
    from_rigid(quat::from_matrix(&rotation), t)
}

/// `R p + t` for the transform `a`.
#[must_use]
pub fn apply<T: Real>(a: DualQuat<T>, p: Vec3<T>) -> Vec3<T> {
    add3(quat::rotate(a.real, p), translation(a))
}
