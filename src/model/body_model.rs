//! Rigid-body marker models.
//!
//! A [`BodyModel`] is the set of `T_body_marker` transforms of every marker
//! mounted on one physical body. It is immutable once published; calibration
//! produces a new model rather than editing one in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Golden ratio, used for the dodecahedron face normals.
const PHI: f64 = 1.618_033_988_749_895;

/// Marker layout of one rigid body.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyModel {
    pub name: String,
    markers: BTreeMap<u32, SE3>,
}

/// On-disk representation: marker ids as string keys, 16 row-major floats.
#[derive(Debug, Serialize, Deserialize)]
struct BodyModelFile {
    name: String,
    markers: BTreeMap<String, Vec<f64>>,
}

impl BodyModel {
    pub fn new(name: impl Into<String>, markers: BTreeMap<u32, SE3>) -> Self {
        Self {
            name: name.into(),
            markers,
        }
    }

    /// Body made of one marker whose frame is the body frame.
    pub fn single_marker(name: impl Into<String>, marker_id: u32) -> Self {
        let mut markers = BTreeMap::new();
        markers.insert(marker_id, SE3::identity());
        Self::new(name, markers)
    }

    /// Design-time model of a regular dodecahedron with one marker per face.
    ///
    /// Face `k` gets id `first_id + k`. Each marker frame sits at distance
    /// `inradius` from the body centre with its z axis along the outward face
    /// normal. The in-plane marker orientation is a guess (x kept horizontal
    /// where possible); run the rigid-body calibration to refine it.
    pub fn dodecahedron(name: impl Into<String>, first_id: u32, inradius: f64) -> Self {
        let mut markers = BTreeMap::new();
        for (k, normal) in dodecahedron_face_normals().iter().enumerate() {
            let rotation = frame_with_z_axis(normal);
            let marker = SE3::from_rt(rotation, normal * inradius);
            markers.insert(first_id + k as u32, marker);
        }
        Self::new(name, markers)
    }

    /// `T_body_marker` of a marker, if it belongs to this body.
    pub fn marker(&self, id: u32) -> Option<&SE3> {
        self.markers.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.markers.contains_key(&id)
    }

    pub fn marker_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.markers.keys().copied()
    }

    pub fn markers(&self) -> &BTreeMap<u32, SE3> {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Lowest marker id, the default calibration anchor.
    pub fn first_marker_id(&self) -> Option<u32> {
        self.markers.keys().next().copied()
    }

    /// Parse a body model from its JSON text, validating every transform.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: BodyModelFile =
            serde_json::from_str(text).context("Failed to parse body model JSON")?;

        let mut markers = BTreeMap::new();
        for (key, values) in &file.markers {
            let id: u32 = key
                .parse()
                .with_context(|| format!("Marker key '{}' is not an integer id", key))?;
            let t = SE3::try_from_row_slice(values)
                .with_context(|| format!("Invalid transform for marker {}", id))?;
            markers.insert(id, t);
        }

        Ok(Self::new(file.name, markers))
    }

    pub fn to_json_string(&self) -> Result<String> {
        let file = BodyModelFile {
            name: self.name.clone(),
            markers: self
                .markers
                .iter()
                .map(|(id, t)| (id.to_string(), t.to_row_vec()))
                .collect(),
        };
        serde_json::to_string_pretty(&file).context("Failed to serialize body model")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read body model {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("In body model {}", path.display()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)
            .with_context(|| format!("Failed to write body model {}", path.display()))
    }
}

/// Outward face normals of a regular dodecahedron (the vertex directions of
/// its dual icosahedron).
fn dodecahedron_face_normals() -> Vec<Vector3<f64>> {
    let mut normals = Vec::with_capacity(12);
    for &a in &[1.0, -1.0] {
        for &b in &[PHI, -PHI] {
            normals.push(Vector3::new(0.0, a, b));
            normals.push(Vector3::new(a, b, 0.0));
            normals.push(Vector3::new(b, 0.0, a));
        }
    }
    normals.iter().map(|n| n.normalize()).collect()
}

/// Rotation whose third column is `z` (unit), with x horizontal when possible.
fn frame_with_z_axis(z: &Vector3<f64>) -> Matrix3<f64> {
    let up = if z.z.abs() > 0.9 {
        Vector3::y()
    } else {
        Vector3::z()
    };
    let x = up.cross(z).normalize();
    let y = z.cross(&x);
    Matrix3::from_columns(&[x, y, *z])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_json_round_trip() {
        let model = BodyModel::dodecahedron("awl", 1, 22.3);
        let text = model.to_json_string().unwrap();
        let back = BodyModel::from_json_str(&text).unwrap();

        assert_eq!(back.name, "awl");
        assert_eq!(back.len(), 12);
        for (id, t) in model.markers() {
            let b = back.marker(*id).unwrap();
            assert_relative_eq!(b.translation, t.translation, epsilon = 1e-9);
            assert!(b.rotation_angle_to(t) < 1e-9);
        }
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("body_model_{}.json", std::process::id()));
        let model = BodyModel::single_marker("reference", 0);
        model.save(&path).unwrap();
        let back = BodyModel::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(back.name, "reference");
        assert_eq!(back.marker_ids().collect::<Vec<_>>(), vec![0]);
        assert!(back.marker(0).unwrap().rotation_angle_to(&SE3::identity()) < 1e-12);
    }

    #[test]
    fn test_rejects_non_rigid_transform() {
        let text = r#"{
            "name": "bad",
            "markers": { "3": [1,0,0,0, 0,1,0,0, 0,0,1,0, 0,0,0.5,1] }
        }"#;
        assert!(BodyModel::from_json_str(text).is_err());
    }

    #[test]
    fn test_rejects_non_numeric_id() {
        let text = r#"{ "name": "bad", "markers": { "left": [1,0,0,0, 0,1,0,0, 0,0,1,0, 0,0,0,1] } }"#;
        assert!(BodyModel::from_json_str(text).is_err());
    }

    #[test]
    fn test_dodecahedron_geometry() {
        let model = BodyModel::dodecahedron("awl", 1, 10.0);
        assert_eq!(model.marker_ids().collect::<Vec<_>>(), (1..=12).collect::<Vec<_>>());

        for t in model.markers().values() {
            // Marker sits on the inscribed sphere, facing outward
            assert_relative_eq!(t.translation.norm(), 10.0, epsilon = 1e-9);
            let z_axis = t.rotation * Vector3::z();
            assert_relative_eq!(z_axis, t.translation / 10.0, epsilon = 1e-9);
        }

        // Adjacent faces of a dodecahedron meet at the dihedral angle 116.57°,
        // so the smallest angle between normals is 63.43°.
        let normals = dodecahedron_face_normals();
        let mut min_angle = f64::INFINITY;
        for i in 0..normals.len() {
            for j in i + 1..normals.len() {
                min_angle = min_angle.min(normals[i].angle(&normals[j]));
            }
        }
        assert_relative_eq!(min_angle.to_degrees(), 63.4349, epsilon = 1e-3);
    }

    #[test]
    fn test_first_marker_id() {
        let model = BodyModel::dodecahedron("awl", 5, 10.0);
        assert_eq!(model.first_marker_id(), Some(5));
        assert!(BodyModel::new("empty", BTreeMap::new()).first_marker_id().is_none());
    }
}
