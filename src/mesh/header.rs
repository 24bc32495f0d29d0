//! In-memory mesh header: the asset index plus cache-presence bookkeeping.

use crate::constants::format::{MAX_MESH_VERSION, NUM_LODS};
use crate::mesh::MeshId;

/// Offset/size of one sub-blob, relative to the end of the header region.
/// A zero size means the blob is not present in the asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobRange {
    pub offset: u32,
    pub size: u32,
}

impl BlobRange {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn is_declared(&self) -> bool {
        self.size > 0
    }

    /// Exclusive end, still header-relative.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

// Preamble flag bits. lod[i] occupies bit 3 + i.
const FLAG_SKIN: u32 = 1 << 0;
const FLAG_PHYSICS_CONVEX: u32 = 1 << 1;
const FLAG_PHYSICS_MESH: u32 = 1 << 2;
const FLAG_LOD_BASE: u32 = 3;

/// Parsed header of one mesh asset plus the sticky not-found mark and the
/// cache-presence flags persisted in the file preamble.
///
/// Writers are exclusively the repo worker; the main thread reads through
/// the shared header map's rwlock.
#[derive(Debug, Clone, Default)]
pub struct MeshHeader {
    /// Packed major/minor; integer 1 is version 0.001.
    pub version: u32,
    /// Byte length of the serialized header map, excluding the preamble.
    pub header_size: u32,
    pub creator: Option<MeshId>,
    pub skin: BlobRange,
    pub physics_convex: BlobRange,
    pub physics_mesh: BlobRange,
    pub lods: [BlobRange; NUM_LODS],
    /// Once true no further fetch is attempted this session.
    pub not_found: bool,

    pub skin_in_cache: bool,
    pub physics_convex_in_cache: bool,
    pub physics_mesh_in_cache: bool,
    pub lod_in_cache: [bool; NUM_LODS],
}

impl MeshHeader {
    pub fn supported_version(&self) -> bool {
        self.version <= MAX_MESH_VERSION
    }

    /// Pack the cache-presence bits for the file preamble.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.skin_in_cache {
            flags |= FLAG_SKIN;
        }
        if self.physics_convex_in_cache {
            flags |= FLAG_PHYSICS_CONVEX;
        }
        if self.physics_mesh_in_cache {
            flags |= FLAG_PHYSICS_MESH;
        }
        for (i, in_cache) in self.lod_in_cache.iter().enumerate() {
            if *in_cache {
                flags |= 1 << (FLAG_LOD_BASE + i as u32);
            }
        }
        flags
    }

    /// Restore cache-presence bits from a preamble read off disk.
    pub fn apply_flags(&mut self, flags: u32) {
        self.skin_in_cache = flags & FLAG_SKIN != 0;
        self.physics_convex_in_cache = flags & FLAG_PHYSICS_CONVEX != 0;
        self.physics_mesh_in_cache = flags & FLAG_PHYSICS_MESH != 0;
        for (i, in_cache) in self.lod_in_cache.iter_mut().enumerate() {
            *in_cache = flags & (1 << (FLAG_LOD_BASE + i as u32)) != 0;
        }
    }

    /// Cache-mismatch recovery marks everything as missing before the
    /// preamble is rewritten and the request requeued.
    pub fn clear_cache_flags(&mut self) {
        self.skin_in_cache = false;
        self.physics_convex_in_cache = false;
        self.physics_mesh_in_cache = false;
        self.lod_in_cache = [false; NUM_LODS];
    }

    /// Furthest header-relative byte any declared blob reaches; the header
    /// handler zero-fills the cache file up to this point.
    pub fn payload_extent(&self) -> u64 {
        let mut extent = 0;
        for lod in &self.lods {
            extent = extent.max(lod.end());
        }
        extent = extent.max(self.skin.end());
        extent = extent.max(self.physics_convex.end());
        extent.max(self.physics_mesh.end())
    }

    /// Resolve a LOD request against what the asset actually carries:
    /// the requested level if it has data, else the nearest lower, else the
    /// nearest higher. `None` means no LOD is usable and marks the header
    /// not-found for the rest of the session.
    pub fn actual_lod(&mut self, lod: usize) -> Option<usize> {
        let resolved = self.substitute_lod(lod);
        if resolved.is_none() {
            // Header exists but carries no usable LOD; treat as 404.
            self.not_found = true;
        }
        resolved
    }

    /// Non-sticky form of [`actual_lod`](Self::actual_lod), for callers
    /// that only want to report a substitute level.
    pub fn substitute_lod(&self, lod: usize) -> Option<usize> {
        let lod = lod.min(NUM_LODS - 1);

        if self.not_found || !self.supported_version() {
            return None;
        }

        if self.lods[lod].is_declared() {
            return Some(lod);
        }
        for i in (0..lod).rev() {
            if self.lods[i].is_declared() {
                return Some(i);
            }
        }
        for i in lod + 1..NUM_LODS {
            if self.lods[i].is_declared() {
                return Some(i);
            }
        }
        None
    }

    pub fn blob(&self, kind: BlobKind) -> BlobRange {
        match kind {
            BlobKind::Skin => self.skin,
            BlobKind::PhysicsConvex => self.physics_convex,
            BlobKind::PhysicsMesh => self.physics_mesh,
            BlobKind::Lod(i) => self.lods[i],
        }
    }

    pub fn blob_in_cache(&self, kind: BlobKind) -> bool {
        match kind {
            BlobKind::Skin => self.skin_in_cache,
            BlobKind::PhysicsConvex => self.physics_convex_in_cache,
            BlobKind::PhysicsMesh => self.physics_mesh_in_cache,
            BlobKind::Lod(i) => self.lod_in_cache[i],
        }
    }

    pub fn set_blob_in_cache(&mut self, kind: BlobKind, in_cache: bool) {
        match kind {
            BlobKind::Skin => self.skin_in_cache = in_cache,
            BlobKind::PhysicsConvex => self.physics_convex_in_cache = in_cache,
            BlobKind::PhysicsMesh => self.physics_mesh_in_cache = in_cache,
            BlobKind::Lod(i) => self.lod_in_cache[i] = in_cache,
        }
    }
}

/// Addressable sub-blob of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Skin,
    PhysicsConvex,
    PhysicsMesh,
    Lod(usize),
}
