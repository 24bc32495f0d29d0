//! On-disk mesh asset cache.
//!
//! One file per asset, named by the hex mesh id, sharing the wire layout
//! (preamble, header map, payloads at declared offsets). Files only ever
//! grow; space reclamation is somebody else's job. Unwritten regions read
//! back as zeros, which the read-through paths detect by probing the first
//! kilobyte of a region.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::AssetPreamble;
use crate::constants::cache::{CACHE_PREAMBLE_SIZE, ZERO_PROBE_BYTES};
use crate::error::MeshResult;
use crate::mesh::MeshId;

/// Directory of per-asset cache files.
#[derive(Debug, Clone)]
pub struct MeshCache {
    dir: PathBuf,
    max_asset_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

impl MeshCache {
    pub fn new(dir: impl Into<PathBuf>, max_asset_size: u64) -> MeshResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_asset_size,
        })
    }

    pub fn asset_path(&self, mesh_id: MeshId) -> PathBuf {
        self.dir.join(format!("{}.mesh", mesh_id.to_hex()))
    }

    /// Open the asset's cache file. `Read` mode fails if the file does not
    /// exist; `ReadWrite` creates it.
    pub fn open(&self, mesh_id: MeshId, mode: OpenMode) -> MeshResult<CacheFile> {
        let path = self.asset_path(mesh_id);
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&path)?,
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        };
        Ok(CacheFile {
            file,
            max_size: self.max_asset_size,
        })
    }

    /// Size of the asset's cache file, or 0 when absent.
    pub fn asset_size(&self, mesh_id: MeshId) -> u64 {
        std::fs::metadata(self.asset_path(mesh_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_asset_size(&self) -> u64 {
        self.max_asset_size
    }
}

/// Handle over one asset's cache file.
#[derive(Debug)]
pub struct CacheFile {
    file: File,
    max_size: u64,
}

impl CacheFile {
    pub fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    /// Per-asset growth cap; writes that would exceed it are refused by
    /// callers before seeking.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> MeshResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> MeshResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Single positioned write of the 12-byte preamble. Writing the
    /// preamble last (after payload data) is what makes a crash between
    /// writes detectable: flags stay zero until the payload is down.
    pub fn write_preamble(&mut self, header_size: u32, flags: u32) -> MeshResult<()> {
        let preamble = AssetPreamble::new(header_size, flags);
        self.write_at(0, &preamble.encode())
    }

    /// Grow the file to `len` bytes (never shrinks). The new span reads
    /// back as zeros, which the zero-probe treats as unwritten.
    pub fn reserve(&mut self, len: u64) -> MeshResult<()> {
        if self.size() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    /// Preamble read-back; None if the file is too short to hold one or
    /// the container version does not match.
    pub fn read_preamble(&mut self) -> Option<AssetPreamble> {
        let mut raw = [0u8; CACHE_PREAMBLE_SIZE as usize];
        self.read_at(0, &mut raw).ok()?;
        AssetPreamble::parse(&raw).ok()
    }

}

/// Reserved-but-unwritten detection: true when the first kilobyte (or the
/// whole buffer if shorter) is all zeros.
pub fn region_is_unwritten(data: &[u8]) -> bool {
    data.iter().take(ZERO_PROBE_BYTES).all(|b| *b == 0)
}
