//! Pinhole camera with Brown–Conrady distortion, and the camera rig.
//!
//! Distortion coefficients follow the OpenCV ordering `[k1, k2, p1, p2, k3]`:
//!
//! ```text
//! x = X/Z, y = Y/Z, r² = x² + y²
//! radial = 1 + k1 r² + k2 r⁴ + k3 r⁶
//! x_d = x·radial + 2 p1 x y + p2 (r² + 2x²)
//! y_d = y·radial + p1 (r² + 2y²) + 2 p2 x y
//! u = fx x_d + cx,  v = fy y_d + cy
//! ```

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Points closer than this to the image plane are treated as unprojectable.
const MIN_DEPTH: f64 = 1e-9;

/// Camera intrinsics and lens distortion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// `[k1, k2, p1, p2, k3]`
    #[serde(default)]
    pub distortion: [f64; 5],
    /// Image width in pixels (used to scale the validation threshold).
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    /// Distortion-free pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
            width,
            height,
        }
    }

    /// Construct from a 3x3 intrinsic matrix K and distortion coefficients.
    pub fn from_k(k: &Matrix3<f64>, distortion: [f64; 5], width: u32, height: u32) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            distortion,
            width,
            height,
        }
    }

    /// Intrinsic matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a point in camera coordinates. `None` when the point is not in
    /// front of the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let x = p_cam.x / p_cam.z;
        let y = p_cam.y / p_cam.z;
        let (xd, yd) = self.distort(x, y);
        Some(Vector2::new(self.fx * xd + self.cx, self.fy * yd + self.cy))
    }

    /// Project a point and return the 2x3 Jacobian of the pixel coordinates
    /// with respect to the camera-frame point.
    pub fn project_with_jacobian(
        &self,
        p_cam: &Vector3<f64>,
    ) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        let x = p_cam.x * inv_z;
        let y = p_cam.y * inv_z;

        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        // d(radial)/d(r²)
        let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r2 * r2;

        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        // ∂(x_d, y_d)/∂(x, y)
        let dxd_dx = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
        let dxd_dy = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let dyd_dx = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let dyd_dy = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

        let d_pixel_d_distorted = Matrix2::new(
            self.fx * dxd_dx, self.fx * dxd_dy,
            self.fy * dyd_dx, self.fy * dyd_dy,
        );
        // ∂(x, y)/∂(X, Y, Z)
        let d_normalized_d_point = Matrix2x3::new(
            inv_z, 0.0, -x * inv_z,
            0.0, inv_z, -y * inv_z,
        );

        let pixel = Vector2::new(self.fx * xd + self.cx, self.fy * yd + self.cy);
        Some((pixel, d_pixel_d_distorted * d_normalized_d_point))
    }

    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }
}

/// One camera of the rig together with its extrinsic `T_rig_cam`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigCamera {
    pub id: u32,
    pub model: CameraModel,
    /// Maps camera coordinates into the rig frame.
    pub t_rig_cam: SE3,
}

/// The set of cameras whose observations are fused into one rig frame.
///
/// With a single camera the rig frame is that camera's frame.
#[derive(Debug, Clone, Default)]
pub struct CameraRig {
    cameras: Vec<RigCamera>,
}

impl CameraRig {
    pub fn new(cameras: Vec<RigCamera>) -> Self {
        Self { cameras }
    }

    /// Rig made of one camera at the rig origin.
    pub fn single(id: u32, model: CameraModel) -> Self {
        Self::new(vec![RigCamera {
            id,
            model,
            t_rig_cam: SE3::identity(),
        }])
    }

    pub fn camera(&self, id: u32) -> Option<&RigCamera> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn cameras(&self) -> &[RigCamera] {
        &self.cameras
    }
}
