//! Mesh asset data model: ids, headers, skin rigs, decompositions, volumes.

pub mod decomposition;
pub mod header;
pub mod id;
pub mod skin;
pub mod volume;

pub use decomposition::Decomposition;
pub use header::{BlobKind, BlobRange, MeshHeader};
pub use id::MeshId;
pub use skin::SkinInfo;
pub use volume::{Volume, VolumeDecoder, VolumeFace};

pub use crate::constants::format::{MAX_MESH_VERSION, NUM_LODS};

/// Wire/header-map key for each LOD slot, lowest first.
pub const LOD_NAMES: [&str; NUM_LODS] = ["lowest_lod", "low_lod", "medium_lod", "high_lod"];

/// Position triple shared by hulls, physics meshes and volume faces.
pub type Point3 = [f32; 3];
