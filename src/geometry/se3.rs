//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Naming convention used throughout the crate: `T_a_b` maps coordinates
//! expressed in frame `b` into frame `a`:
//!
//! ```text
//! p_a = T_a_b * p_b
//! T_a_c = T_a_b ∘ T_b_c
//! ```
//!
//! The rotation is stored as a unit quaternion, so it is orthonormal with
//! determinant +1 by construction. Anything that blends quaternions (fusion,
//! smoothing) must go through `UnitQuaternion::new_normalize` before building
//! an `SE3` again.

use nalgebra::{Matrix3, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};

use crate::error::NavError;

/// Tolerance used when checking that a 4x4 matrix holds a proper rotation.
const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation matrix and translation.
    ///
    /// The matrix is projected onto SO(3) (via quaternion extraction), so small
    /// numerical drift in the input is tolerated.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a Rodrigues rotation vector and translation
    /// (the representation marker detectors usually report).
    pub fn from_rvec_tvec(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rvec),
            translation: tvec,
        }
    }

    /// Construct from a homogeneous 4x4 matrix without validation.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Construct from a homogeneous 4x4 matrix, checking that the bottom row
    /// is `[0, 0, 0, 1]` and that the rotation block is orthonormal with
    /// determinant +1.
    pub fn try_from_matrix(mat: Matrix4<f64>) -> Result<Self, NavError> {
        let bottom = [mat[(3, 0)], mat[(3, 1)], mat[(3, 2)], mat[(3, 3)]];
        let expected = [0.0, 0.0, 0.0, 1.0];
        if bottom
            .iter()
            .zip(expected.iter())
            .any(|(a, b)| (a - b).abs() > ORTHONORMAL_TOLERANCE)
        {
            return Err(NavError::InvalidTransform(format!(
                "bottom row must be [0, 0, 0, 1], got {:?}",
                bottom
            )));
        }

        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let rtr = r.transpose() * r;
        if (rtr - Matrix3::identity()).abs().max() > ORTHONORMAL_TOLERANCE * 100.0 {
            return Err(NavError::InvalidTransform(
                "rotation block is not orthonormal".to_string(),
            ));
        }
        if r.determinant() <= 0.0 {
            return Err(NavError::InvalidTransform(
                "rotation block has non-positive determinant".to_string(),
            ));
        }

        Ok(Self::from_matrix(mat))
    }

    /// Construct from 16 row-major values.
    pub fn try_from_row_slice(data: &[f64]) -> Result<Self, NavError> {
        if data.len() != 16 {
            return Err(NavError::InvalidTransform(format!(
                "expected 16 elements for transform, got {}",
                data.len()
            )));
        }
        Self::try_from_matrix(Matrix4::from_row_slice(data))
    }

    /// Convert to homogeneous 4x4 matrix [R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// 16 row-major values of the homogeneous matrix.
    pub fn to_row_vec(&self) -> Vec<f64> {
        let mat = self.to_matrix();
        let mut out = Vec::with_capacity(16);
        for r in 0..4 {
            for c in 0..4 {
                out.push(mat[(r, c)]);
            }
        }
        out
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Inverse transformation: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a single point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Log map used by the optimizers: [rotation_vec (3), translation (3)].
    pub fn log(&self) -> [f64; 6] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Inverse of [`SE3::log`].
    pub fn exp(params: &[f64; 6]) -> Self {
        let rot_vec = Vector3::new(params[0], params[1], params[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(params[3], params[4], params[5]),
        }
    }

    /// Angle (radians) of the relative rotation between two transforms.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.3, -0.5, 0.8)),
                1.1,
            ),
            translation: Vector3::new(12.0, -4.5, 310.0),
        }
    }

    #[test]
    fn test_inverse_of_inverse() {
        let t = sample_pose();
        let back = t.inverse().inverse();

        assert_relative_eq!(back.to_matrix(), t.to_matrix(), epsilon = 1e-9);
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());

        assert_relative_eq!(id.to_matrix(), Matrix4::identity(), epsilon = 1e-9);
        let id_left = t.inverse().compose(&t);
        assert_relative_eq!(id_left.to_matrix(), Matrix4::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_composition_rule() {
        // b sits 1 along X of a, c sits 2 along Y of b
        let t_a_b = SE3::from_rt(Matrix3::identity(), Vector3::new(1.0, 0.0, 0.0));
        let t_b_c = SE3::from_rt(Matrix3::identity(), Vector3::new(0.0, 2.0, 0.0));

        let t_a_c = t_a_b.compose(&t_b_c);
        assert_relative_eq!(t_a_c.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_90deg_z() {
        let rz = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let t = SE3::from_rt(rz, Vector3::zeros());

        let p = t.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_round_trip() {
        let t = sample_pose();
        let back = SE3::try_from_matrix(t.to_matrix()).unwrap();

        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
        assert!(back.rotation_angle_to(&t) < 1e-9);
    }

    #[test]
    fn test_try_from_matrix_rejects_bad_bottom_row() {
        let mut mat = Matrix4::identity();
        mat[(3, 0)] = 0.5;
        assert!(matches!(
            SE3::try_from_matrix(mat),
            Err(NavError::InvalidTransform(_))
        ));
    }

    #[test]
    fn test_try_from_matrix_rejects_reflection() {
        let mut mat = Matrix4::identity();
        mat[(0, 0)] = -1.0;
        assert!(SE3::try_from_matrix(mat).is_err());
    }

    #[test]
    fn test_log_exp() {
        let t = sample_pose();
        let back = SE3::exp(&t.log());

        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
        assert!(back.rotation_angle_to(&t) < 1e-12);
    }
}
