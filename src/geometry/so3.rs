//! SO(3) utilities shared by fusion, smoothing and calibration.
//!
//! Two families live here:
//! - Lie-group helpers (skew matrix, right Jacobian) used to differentiate
//!   rotation-vector parameterized poses in the calibrator.
//! - Quaternion blending helpers (hemisphere alignment, weighted
//!   sum-then-normalize) used by fusion and the temporal smoother.
//!
//! # Rotation averaging regime
//!
//! `weighted_quaternion_mean` is the linear "sum, then renormalize" average.
//! It is a first-order approximation of the geodesic (Karcher) mean: accurate
//! to a fraction of a degree while the inputs lie within a few degrees of each
//! other, increasingly biased as the spread grows toward 90°, and undefined
//! for antipodal inputs (180°) where the sum can vanish. Callers report the
//! spread so this regime can be monitored.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity()
        - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi_sq
}

/// Derivative of `exp(φ) · v` with respect to the rotation vector φ.
///
/// ```text
/// ∂(R(φ) v)/∂φ = -R(φ) [v]× Jr(φ)
/// ```
pub fn rotate_point_jacobian(phi: &Vector3<f64>, v: &Vector3<f64>) -> Matrix3<f64> {
    let r = UnitQuaternion::from_scaled_axis(*phi)
        .to_rotation_matrix()
        .into_inner();
    -r * skew(v) * right_jacobian_so3(phi)
}

/// Flip `q` onto the same hemisphere as `reference` (q and -q encode the same
/// rotation; blending requires both operands on one side).
#[inline]
pub fn align_hemisphere(q: &Quaternion<f64>, reference: &Quaternion<f64>) -> Quaternion<f64> {
    if q.dot(reference) < 0.0 {
        -*q
    } else {
        *q
    }
}

/// Weighted linear quaternion average: hemisphere-align every input to
/// `reference`, sum with weights, renormalize.
///
/// Returns `None` when the inputs are empty, weights are all zero, or the
/// weighted sum collapses (near-antipodal inputs).
pub fn weighted_quaternion_mean(
    rotations: &[(UnitQuaternion<f64>, f64)],
    reference: &UnitQuaternion<f64>,
) -> Option<UnitQuaternion<f64>> {
    let reference = *reference.quaternion();
    let mut sum = Quaternion::new(0.0, 0.0, 0.0, 0.0);
    for (q, w) in rotations {
        sum += align_hemisphere(q.quaternion(), &reference) * *w;
    }

    if sum.norm() < 1e-12 {
        return None;
    }
    Some(UnitQuaternion::new_normalize(sum))
}

/// Normalized linear interpolation from `from` toward `to` by `alpha`, taking
/// the short way around.
pub fn nlerp(from: &UnitQuaternion<f64>, to: &UnitQuaternion<f64>, alpha: f64) -> UnitQuaternion<f64> {
    weighted_quaternion_mean(&[(*from, 1.0 - alpha), (*to, alpha)], from).unwrap_or(*to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        let jr = right_jacobian_so3(&Vector3::zeros());
        assert_relative_eq!(jr, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_rotate_point_jacobian_matches_finite_difference() {
        let phi = Vector3::new(0.4, -0.2, 0.9);
        let v = Vector3::new(25.0, -10.0, 3.0);
        let analytic = rotate_point_jacobian(&phi, &v);

        let h = 1e-6;
        for k in 0..3 {
            let mut plus = phi;
            let mut minus = phi;
            plus[k] += h;
            minus[k] -= h;
            let f_plus = UnitQuaternion::from_scaled_axis(plus) * v;
            let f_minus = UnitQuaternion::from_scaled_axis(minus) * v;
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_align_hemisphere_flips_negative_dot() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.2);
        let flipped = -q.into_inner();

        let aligned = align_hemisphere(&flipped, q.quaternion());
        assert!(aligned.dot(q.quaternion()) > 0.0);
        assert_relative_eq!(aligned, q.into_inner(), epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_mean_of_sign_flipped_inputs() {
        let axis = Unit::new_normalize(Vector3::new(1.0, 1.0, 0.0));
        let a = UnitQuaternion::from_axis_angle(&axis, 0.30);
        let b = UnitQuaternion::from_axis_angle(&axis, 0.34);
        // Same rotation as b, opposite quaternion sign
        let b_flipped = UnitQuaternion::new_unchecked(-b.into_inner());

        let mean = weighted_quaternion_mean(&[(a, 1.0), (b_flipped, 1.0)], &a).unwrap();
        assert_relative_eq!(mean.angle(), 0.32, epsilon = 1e-4);
        assert!(mean.quaternion().dot(a.quaternion()) > 0.0);
    }

    #[test]
    fn test_weighted_mean_empty_is_none() {
        assert!(weighted_quaternion_mean(&[], &UnitQuaternion::identity()).is_none());
    }

    #[test]
    fn test_nlerp_endpoints() {
        let a = UnitQuaternion::identity();
        let b = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5);

        assert!(nlerp(&a, &b, 0.0).angle_to(&a) < 1e-12);
        assert!(nlerp(&a, &b, 1.0).angle_to(&b) < 1e-12);
    }
}
