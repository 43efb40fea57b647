//! Random lane inputs for the randomized suites.
//!
//! Each operator draws from a region that stays clear of its branch points
//! (sign flips, candidate switches, the `log` cut, the full-turn screw), so a
//! central difference of width `2 * step` never straddles a discontinuity.

use dq_algebra::quat::{self, scale3};
use dq_algebra::{DualQuat, Quat, Vec3, dual};
use dq_dispatch::QuatOp;
use rand::Rng;

/// Least gap between the two largest `|q_i|` of a from-matrix sample.
const CANDIDATE_GAP: f64 = 0.05;
/// Least `|w|` of a standardize sample.
const EQUATOR_GAP: f64 = 0.05;
/// Largest relative rotation of a sclerp pair. Past `pi` the pair takes the
/// long screw; the bound keeps `D_w >= cos(2.5)`, clear of a full turn.
const MAX_SCREW_ANGLE: f64 = 5.0;

/// One lane of inputs in schema order.
pub(crate) fn sample_lane<R: Rng>(op: QuatOp, rng: &mut R) -> Vec<Vec<f64>> {
    match op {
        QuatOp::QuatMul => vec![any_quat(rng).to_vec(), any_quat(rng).to_vec()],
        QuatOp::QuatConjugate | QuatOp::QuatNormSquared | QuatOp::QuatToMatrix => {
            vec![any_quat(rng).to_vec()]
        }
        QuatOp::QuatNormalize => vec![scaled_quat(rng).to_array().to_vec()],
        QuatOp::QuatRotate => vec![any_quat(rng).to_vec(), vec3(rng, 2.0).to_vec()],
        QuatOp::QuatExp | QuatOp::QuatFromAxisAngle => vec![vec3(rng, 2.0).to_vec()],
        QuatOp::QuatLog | QuatOp::QuatToAxisAngle => vec![forward_hemisphere_quat(rng).to_vec()],
        QuatOp::QuatFromMatrix => vec![quat::to_matrix(dominant_unit_quat(rng)).to_vec()],
        QuatOp::QuatStandardize => vec![off_equator_quat(rng).to_vec()],
        QuatOp::DualMul => vec![any_dual(rng).to_vec(), any_dual(rng).to_vec()],
        QuatOp::DualConjugate
        | QuatOp::DualNumberConjugate
        | QuatOp::DualFullConjugate
        | QuatOp::DualToRigid
        | QuatOp::DualToMatrix => vec![any_dual(rng).to_vec()],
        QuatOp::DualNormalize => vec![scaled_dual(rng).to_array().to_vec()],
        QuatOp::DualFromRigid => vec![any_quat(rng).to_vec(), vec3(rng, 2.0).to_vec()],
        QuatOp::DualFromMatrix => {
            let transform = dual::from_rigid(dominant_unit_quat(rng), vec3(rng, 2.0));
            vec![dual::to_matrix(transform).to_vec()]
        }
        QuatOp::DualApply => vec![any_dual(rng).to_vec(), vec3(rng, 2.0).to_vec()],
        QuatOp::DualSclerp => {
            let (a, b) = screw_pair(rng);
            vec![
                a.to_array().to_vec(),
                b.to_array().to_vec(),
                vec![rng.gen_range(-0.5..1.5)],
            ]
        }
    }
}

/// `lanes` lanes as one contiguous `[lanes, width]` buffer per schema input.
pub(crate) fn sample_batch<R: Rng>(op: QuatOp, lanes: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let widths = op.schema().input_widths;
    let mut buffers = widths
        .iter()
        .map(|width| Vec::with_capacity(width * lanes))
        .collect::<Vec<_>>();
    for _ in 0..lanes {
        for (buffer, lane) in buffers.iter_mut().zip(sample_lane(op, rng)) {
            buffer.extend(lane);
        }
    }
    buffers
}

pub(crate) fn uniform_buffer<R: Rng>(rng: &mut R, len: usize, bound: f64) -> Vec<f64> {
    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
}

pub(crate) fn any_quat<R: Rng>(rng: &mut R) -> [f64; 4] {
    std::array::from_fn(|_| rng.gen_range(-1.0..1.0))
}

pub(crate) fn any_dual<R: Rng>(rng: &mut R) -> [f64; 8] {
    std::array::from_fn(|_| rng.gen_range(-1.0..1.0))
}

pub(crate) fn vec3<R: Rng>(rng: &mut R, bound: f64) -> Vec3<f64> {
    std::array::from_fn(|_| rng.gen_range(-bound..bound))
}

pub(crate) fn unit_quat<R: Rng>(rng: &mut R) -> Quat<f64> {
    loop {
        let q = Quat::from_slice(&any_quat(rng));
        let n = q.norm();
        if n > 0.1 {
            return q.scale(n.recip());
        }
    }
}

/// Norm drawn from `[0.5, 2)`, far from the normalize fallback.
pub(crate) fn scaled_quat<R: Rng>(rng: &mut R) -> Quat<f64> {
    let target = rng.gen_range(0.5..2.0);
    unit_quat(rng).scale(target)
}

pub(crate) fn scaled_dual<R: Rng>(rng: &mut R) -> DualQuat<f64> {
    let real = scaled_quat(rng);
    let dual = Quat::from_slice(&any_quat(rng));
    DualQuat::new(real, dual)
}

pub(crate) fn rigid<R: Rng>(rng: &mut R) -> DualQuat<f64> {
    dual::from_rigid(unit_quat(rng), vec3(rng, 2.0))
}

/// `(A, A D)` with `D` a screw of rotation below [`MAX_SCREW_ANGLE`]; about
/// a third of the pairs need the long screw (`D_w < 0`).
pub(crate) fn screw_pair<R: Rng>(rng: &mut R) -> (DualQuat<f64>, DualQuat<f64>) {
    let a = rigid(rng);
    let axis = unit_axis(rng);
    let angle = rng.gen_range(0.0..MAX_SCREW_ANGLE);
    let delta = dual::from_rigid(quat::from_axis_angle(scale3(axis, angle)), vec3(rng, 2.0));
    (a, dual::mul(a, delta))
}

fn unit_axis<R: Rng>(rng: &mut R) -> Vec3<f64> {
    loop {
        let v = vec3(rng, 1.0);
        let n = quat::dot3(v, v).sqrt();
        if n > 0.1 {
            return scale3(v, n.recip());
        }
    }
}

fn forward_hemisphere_quat<R: Rng>(rng: &mut R) -> [f64; 4] {
    [
        rng.gen_range(0.2..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
    ]
}

fn off_equator_quat<R: Rng>(rng: &mut R) -> [f64; 4] {
    loop {
        let q = any_quat(rng);
        if q[0].abs() >= EQUATOR_GAP {
            return q;
        }
    }
}

/// Unit quaternion whose largest component clearly wins the matrix
/// candidate selection.
pub(crate) fn dominant_unit_quat<R: Rng>(rng: &mut R) -> Quat<f64> {
    loop {
        let q = unit_quat(rng);
        let mut magnitudes = q.to_array().map(f64::abs);
        magnitudes.sort_by(|a, b| b.total_cmp(a));
        if magnitudes[0] - magnitudes[1] >= CANDIDATE_GAP {
            return q;
        }
    }
}

#[cfg(test)]
mod tests {
    use dq_algebra::dual;
    use dq_dispatch::QuatOp;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{dominant_unit_quat, sample_batch, screw_pair};

    #[test]
    fn batches_match_schema_widths() {
        let mut rng = StdRng::seed_from_u64(11);
        for &op in QuatOp::all() {
            let buffers = sample_batch(op, 5, &mut rng);
            let widths = op.schema().input_widths;
            assert_eq!(buffers.len(), widths.len(), "{op}");
            for (buffer, width) in buffers.iter().zip(widths) {
                assert_eq!(buffer.len(), width * 5, "{op}");
                assert!(buffer.iter().all(|value| value.is_finite()), "{op}");
            }
        }
    }

    #[test]
    fn screw_pairs_cover_both_hemispheres_away_from_full_turn() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut long_screws = 0;
        for _ in 0..200 {
            let (a, b) = screw_pair(&mut rng);
            let relative = dual::mul(dual::conjugate(a), b);
            assert!(relative.real.w > -0.81, "relative={relative:?}");
            if relative.real.w < 0.0 {
                long_screws += 1;
            }
        }
        assert!(long_screws > 20, "long_screws={long_screws}");
    }

    #[test]
    fn dominant_samples_keep_a_candidate_gap() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..200 {
            let mut magnitudes = dominant_unit_quat(&mut rng).to_array().map(f64::abs);
            magnitudes.sort_by(|a, b| b.total_cmp(a));
            assert!(magnitudes[0] - magnitudes[1] >= 0.05);
        }
    }
}
