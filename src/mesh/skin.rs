//! Skin rig data: joint names and bind matrices. Prerequisite for
//! rendering any LOD of a rigged mesh, so the pipeline fetches it eagerly.

use crate::codec::value::{self, MapEntries, MapValue};
use crate::codec::CodecError;
use crate::mesh::MeshId;

pub type Matrix4 = [f32; 16];

#[derive(Debug, Clone, PartialEq)]
pub struct SkinInfo {
    pub mesh_id: MeshId,
    pub joint_names: Vec<String>,
    pub inverse_bind_matrices: Vec<Matrix4>,
    pub bind_shape_matrix: Option<Matrix4>,
    pub pelvis_offset: f32,
}

impl SkinInfo {
    /// Build from a decompressed skin map. Joint names and their inverse
    /// bind matrices must pair up.
    pub fn from_map(mesh_id: MeshId, entries: &MapEntries) -> Result<Self, CodecError> {
        let joint_names = match value::lookup(entries, "joint_names") {
            Some(v) => {
                let list = v.as_list().ok_or(CodecError::WrongType {
                    key: "joint_names".into(),
                })?;
                list.iter()
                    .map(|item| {
                        item.as_str().map(str::to_owned).ok_or(CodecError::WrongType {
                            key: "joint_names".into(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => Vec::new(),
        };

        let inverse_bind_matrices = match value::lookup(entries, "inverse_bind_matrix") {
            Some(v) => {
                let list = v.as_list().ok_or(CodecError::WrongType {
                    key: "inverse_bind_matrix".into(),
                })?;
                list.iter()
                    .map(|item| matrix_from_value(item, "inverse_bind_matrix"))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => Vec::new(),
        };

        if joint_names.len() != inverse_bind_matrices.len() {
            return Err(CodecError::WrongType {
                key: "inverse_bind_matrix".into(),
            });
        }

        let bind_shape_matrix = match value::lookup(entries, "bind_shape_matrix") {
            Some(v) => Some(matrix_from_value(v, "bind_shape_matrix")?),
            None => None,
        };

        let pelvis_offset = value::lookup(entries, "pelvis_offset")
            .and_then(|v| v.as_f32s())
            .and_then(|fs| fs.first().copied())
            .unwrap_or(0.0);

        Ok(Self {
            mesh_id,
            joint_names,
            inverse_bind_matrices,
            bind_shape_matrix,
            pelvis_offset,
        })
    }

    /// Emit the map form (used by cache round-trip tests and tools).
    pub fn to_map(&self) -> MapEntries {
        let mut entries: MapEntries = vec![
            (
                "joint_names".into(),
                MapValue::List(
                    self.joint_names
                        .iter()
                        .map(|n| MapValue::Str(n.clone()))
                        .collect(),
                ),
            ),
            (
                "inverse_bind_matrix".into(),
                MapValue::List(
                    self.inverse_bind_matrices
                        .iter()
                        .map(|m| MapValue::F32Array(m.to_vec()))
                        .collect(),
                ),
            ),
        ];
        if let Some(m) = self.bind_shape_matrix {
            entries.push(("bind_shape_matrix".into(), MapValue::F32Array(m.to_vec())));
        }
        if self.pelvis_offset != 0.0 {
            entries.push((
                "pelvis_offset".into(),
                MapValue::F32Array(vec![self.pelvis_offset]),
            ));
        }
        entries
    }

    /// Approximate resident size, for cache accounting.
    pub fn size_bytes(&self) -> usize {
        let names: usize = self.joint_names.iter().map(|n| n.len() + 24).sum();
        names + self.inverse_bind_matrices.len() * 64 + std::mem::size_of::<Self>()
    }
}

fn matrix_from_value(v: &MapValue, key: &str) -> Result<Matrix4, CodecError> {
    let fs = v.as_f32s().ok_or(CodecError::WrongType { key: key.into() })?;
    let arr: Matrix4 = fs
        .try_into()
        .map_err(|_| CodecError::WrongType { key: key.into() })?;
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> Matrix4 {
        let mut m = [0.0; 16];
        for i in 0..4 {
            m[i * 4 + i] = 1.0;
        }
        m
    }

    #[test]
    fn map_roundtrip() {
        let skin = SkinInfo {
            mesh_id: MeshId::from_u64(3),
            joint_names: vec!["mPelvis".into(), "mTorso".into()],
            inverse_bind_matrices: vec![ident(), ident()],
            bind_shape_matrix: Some(ident()),
            pelvis_offset: -0.5,
        };
        let parsed = SkinInfo::from_map(skin.mesh_id, &skin.to_map()).expect("parse");
        assert_eq!(parsed, skin);
    }

    #[test]
    fn joint_matrix_count_mismatch_is_rejected() {
        let entries = vec![
            (
                "joint_names".into(),
                MapValue::List(vec![MapValue::Str("mPelvis".into())]),
            ),
            ("inverse_bind_matrix".into(), MapValue::List(vec![])),
        ];
        assert!(SkinInfo::from_map(MeshId::NULL, &entries).is_err());
    }

    #[test]
    fn short_matrix_is_rejected() {
        let entries = vec![(
            "bind_shape_matrix".into(),
            MapValue::F32Array(vec![1.0; 15]),
        )];
        assert!(SkinInfo::from_map(MeshId::NULL, &entries).is_err());
    }
}
