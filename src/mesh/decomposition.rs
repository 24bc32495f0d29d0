//! Convex decomposition data: hull sets for physics queries plus the
//! triangle soup decoded from the physics-shape sub-blob.

use crate::codec::value::{self, MapEntries, MapValue};
use crate::codec::CodecError;
use crate::mesh::{MeshId, Point3};

/// One mesh's physics approximation. Arrives in halves: the convex-hull
/// set from the `physics_convex` sub-blob and the raw shape mesh from the
/// `physics_mesh` sub-blob; entries merge as pieces land.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    pub mesh_id: MeshId,
    pub hulls: Vec<Vec<Point3>>,
    pub base_hull: Vec<Point3>,
    pub physics_shape_mesh: Vec<Point3>,
}

impl Decomposition {
    pub fn new(mesh_id: MeshId) -> Self {
        Self {
            mesh_id,
            ..Default::default()
        }
    }

    /// Build from a decompressed `physics_convex` map.
    pub fn from_map(mesh_id: MeshId, entries: &MapEntries) -> Result<Self, CodecError> {
        let hulls = match value::lookup(entries, "hulls") {
            Some(v) => {
                let list = v
                    .as_list()
                    .ok_or(CodecError::WrongType { key: "hulls".into() })?;
                list.iter()
                    .map(|item| points_from_value(item, "hulls"))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => Vec::new(),
        };

        let base_hull = match value::lookup(entries, "base_hull") {
            Some(v) => points_from_value(v, "base_hull")?,
            None => Vec::new(),
        };

        Ok(Self {
            mesh_id,
            hulls,
            base_hull,
            physics_shape_mesh: Vec::new(),
        })
    }

    pub fn to_map(&self) -> MapEntries {
        vec![
            (
                "hulls".into(),
                MapValue::List(self.hulls.iter().map(|h| points_to_value(h)).collect()),
            ),
            ("base_hull".into(), points_to_value(&self.base_hull)),
        ]
    }

    pub fn has_hulls(&self) -> bool {
        !self.hulls.is_empty()
    }

    pub fn has_base_hull(&self) -> bool {
        !self.base_hull.is_empty()
    }

    pub fn has_physics_shape(&self) -> bool {
        !self.physics_shape_mesh.is_empty()
    }

    /// Fold a newly arrived half into this entry. Non-empty fields of
    /// `other` win; existing data is kept where `other` is empty.
    pub fn merge(&mut self, other: Decomposition) {
        let has_hulls = other.has_hulls();
        let has_base_hull = other.has_base_hull();
        let has_physics_shape = other.has_physics_shape();
        if has_hulls {
            self.hulls = other.hulls;
        }
        if has_base_hull {
            self.base_hull = other.base_hull;
        }
        if has_physics_shape {
            self.physics_shape_mesh = other.physics_shape_mesh;
        }
    }

    pub fn size_bytes(&self) -> usize {
        let hull_points: usize = self.hulls.iter().map(Vec::len).sum();
        (hull_points + self.base_hull.len() + self.physics_shape_mesh.len()) * 12
            + std::mem::size_of::<Self>()
    }
}

fn points_from_value(v: &MapValue, key: &str) -> Result<Vec<Point3>, CodecError> {
    let fs = v.as_f32s().ok_or(CodecError::WrongType { key: key.into() })?;
    if fs.len() % 3 != 0 {
        return Err(CodecError::WrongType { key: key.into() });
    }
    Ok(fs.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn points_to_value(points: &[Point3]) -> MapValue {
    let mut fs = Vec::with_capacity(points.len() * 3);
    for p in points {
        fs.extend_from_slice(p);
    }
    MapValue::F32Array(fs)
}
