//! Planar square marker model.

use nalgebra::Vector3;

/// Corner coordinates of a square marker of edge length `edge` in its own
/// frame: centred at the origin, lying in z = 0, ordered top-left, top-right,
/// bottom-right, bottom-left (the order detectors report corners in).
pub fn marker_corners(edge: f64) -> [Vector3<f64>; 4] {
    let h = edge / 2.0;
    [
        Vector3::new(-h, h, 0.0),
        Vector3::new(h, h, 0.0),
        Vector3::new(h, -h, 0.0),
        Vector3::new(-h, -h, 0.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corners_are_centred_and_square() {
        let c = marker_corners(20.0);
        let centroid = c.iter().fold(Vector3::zeros(), |acc, p| acc + p) / 4.0;
        assert!(centroid.norm() < 1e-12);

        for i in 0..4 {
            let edge = (c[(i + 1) % 4] - c[i]).norm();
            assert!((edge - 20.0).abs() < 1e-12);
        }
        // Top-left is at negative x, positive y
        assert!(c[0].x < 0.0 && c[0].y > 0.0);
    }
}
