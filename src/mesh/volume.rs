//! Seam to the external geometry decoder.
//!
//! Turning decompressed face bytes into renderable geometry is not this
//! crate's job; the host engine supplies a [`VolumeDecoder`] and receives
//! [`Volume`]s back through the subscriber callbacks.

use crate::error::MeshResult;
use crate::mesh::{MeshId, Point3};

/// Decoded geometry for one LOD of one mesh. The repository inspects the
/// face list to tell a usable volume from an empty one, and flattens face
/// positions into a triangle soup for physics-shape sub-blobs; everything
/// else is the renderer's business.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub mesh_id: MeshId,
    pub lod: usize,
    pub faces: Vec<VolumeFace>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeFace {
    pub positions: Vec<Point3>,
}

impl Volume {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// A volume with no faces renders nothing and is reported unavailable.
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// All face positions, concatenated. Used when a physics-shape
    /// sub-blob is decoded through the volume path.
    pub fn flatten_positions(&self) -> Vec<Point3> {
        let total: usize = self.faces.iter().map(|f| f.positions.len()).sum();
        let mut out = Vec::with_capacity(total);
        for face in &self.faces {
            out.extend_from_slice(&face.positions);
        }
        out
    }
}

/// External face decoder. Implementations must be callable from the
/// processing pool, so the trait is `Send + Sync`.
pub trait VolumeDecoder: Send + Sync {
    fn decode_volume(&self, mesh_id: MeshId, lod: usize, data: &[u8]) -> MeshResult<Volume>;
}
