//! Asset-level framing: the 12-byte preamble, the header map, and the
//! zlib-framed compressed sub-blobs.
//!
//! The remote asset blob and the local cache file share this layout:
//!
//! ```text
//! [0 .. 12)    version | header_size | flags   (LE u32 x3)
//! [12 .. 12+H) header map (see codec::value)
//! [12+H .. )   sub-blob payloads at their declared offsets
//! ```
//!
//! The flags word is only meaningful locally (cache presence bits); values
//! arriving off the wire are discarded and rebuilt by the header handler.

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::codec::value::{self, MapEntries, MapValue, Writer};
use crate::codec::CodecError;
use crate::constants::cache::{CACHE_PREAMBLE_SIZE, CACHE_PREAMBLE_VERSION, MAX_HEADER_MAP_SIZE};
use crate::constants::worker::MAX_BLOB_ALLOC;
use crate::mesh::{BlobRange, MeshHeader, LOD_NAMES, NUM_LODS};

/// The leading 12 bytes of an asset or cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetPreamble {
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
}

impl AssetPreamble {
    pub fn new(header_size: u32, flags: u32) -> Self {
        Self {
            version: CACHE_PREAMBLE_VERSION,
            header_size,
            flags,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < CACHE_PREAMBLE_SIZE as usize {
            return Err(CodecError::Truncated {
                at: 0,
                needed: CACHE_PREAMBLE_SIZE as usize,
            });
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let preamble = Self {
            version: word(0),
            header_size: word(4),
            flags: word(8),
        };
        if preamble.version != CACHE_PREAMBLE_VERSION {
            return Err(CodecError::BadContainerVersion {
                found: preamble.version,
            });
        }
        if preamble.header_size as u64 > MAX_HEADER_MAP_SIZE {
            return Err(CodecError::HeaderTooLarge {
                size: preamble.header_size as u64,
            });
        }
        Ok(preamble)
    }

    pub fn encode(&self) -> [u8; CACHE_PREAMBLE_SIZE as usize] {
        let mut out = [0u8; CACHE_PREAMBLE_SIZE as usize];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.header_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

fn blob_from_map(entries: &MapEntries, key: &str) -> Result<BlobRange, CodecError> {
    match value::lookup(entries, key) {
        Some(v) => {
            let map = v.as_map().ok_or(CodecError::WrongType { key: key.into() })?;
            Ok(BlobRange::new(
                value::require_u32(map, "offset")?,
                value::require_u32(map, "size")?,
            ))
        }
        None => Ok(BlobRange::default()),
    }
}

fn blob_to_map(range: BlobRange) -> MapValue {
    MapValue::Map(vec![
        ("offset".into(), MapValue::U32(range.offset)),
        ("size".into(), MapValue::U32(range.size)),
    ])
}

/// Parse the preamble and header map off the front of an asset (the first
/// byte-range response, or a cache read). Cache-presence flags are NOT
/// applied to the returned header; the caller decides whether the preamble
/// flags are trustworthy.
pub fn parse_asset_header(data: &[u8]) -> Result<(AssetPreamble, MeshHeader), CodecError> {
    let preamble = AssetPreamble::parse(data)?;

    let map_start = CACHE_PREAMBLE_SIZE as usize;
    let map_end = map_start + preamble.header_size as usize;
    if data.len() < map_end {
        return Err(CodecError::Truncated {
            at: map_start,
            needed: preamble.header_size as usize,
        });
    }

    let (entries, _consumed) = value::parse_map(&data[map_start..map_end])?;

    let mut header = MeshHeader {
        version: value::require_u32(&entries, "version")?,
        header_size: preamble.header_size,
        creator: value::lookup(&entries, "creator").and_then(|v| v.as_id()),
        skin: blob_from_map(&entries, "skin")?,
        physics_convex: blob_from_map(&entries, "physics_convex")?,
        physics_mesh: blob_from_map(&entries, "physics_mesh")?,
        ..Default::default()
    };
    for (i, name) in LOD_NAMES.iter().enumerate() {
        header.lods[i] = blob_from_map(&entries, name)?;
    }

    Ok((preamble, header))
}

/// Emit preamble + header map. The map length becomes the preamble's
/// `header_size`; the flags come from the header's presence bits.
pub fn encode_asset_header(header: &MeshHeader) -> Result<Vec<u8>, CodecError> {
    let mut entries: MapEntries = vec![("version".into(), MapValue::U32(header.version))];
    if let Some(creator) = header.creator {
        entries.push(("creator".into(), MapValue::Id(creator)));
    }
    if header.skin.is_declared() {
        entries.push(("skin".into(), blob_to_map(header.skin)));
    }
    if header.physics_convex.is_declared() {
        entries.push(("physics_convex".into(), blob_to_map(header.physics_convex)));
    }
    if header.physics_mesh.is_declared() {
        entries.push(("physics_mesh".into(), blob_to_map(header.physics_mesh)));
    }
    for i in 0..NUM_LODS {
        if header.lods[i].is_declared() {
            entries.push((LOD_NAMES[i].into(), blob_to_map(header.lods[i])));
        }
    }

    let mut writer = Writer::new();
    writer.put_value(&MapValue::Map(entries));
    let map_bytes = writer.into_bytes();
    if map_bytes.len() as u64 > MAX_HEADER_MAP_SIZE {
        return Err(CodecError::HeaderTooLarge {
            size: map_bytes.len() as u64,
        });
    }

    let preamble = AssetPreamble::new(map_bytes.len() as u32, header.flags());
    let mut out = Vec::with_capacity(CACHE_PREAMBLE_SIZE as usize + map_bytes.len());
    out.extend_from_slice(&preamble.encode());
    out.extend_from_slice(&map_bytes);
    Ok(out)
}

/// Wrap a serialized map in the length-framed zlib stream used by skin and
/// decomposition sub-blobs.
pub fn compress_blob(payload: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut out = Vec::with_capacity(payload.len() / 2 + 8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(payload).expect("zlib write to Vec");
    encoder.finish().expect("zlib finish to Vec")
}

/// Unwrap a length-framed zlib stream. The frame length is validated
/// against the per-blob allocation cap before inflating.
pub fn decompress_blob(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::Truncated { at: 0, needed: 4 });
    }
    let framed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if framed > MAX_BLOB_ALLOC {
        return Err(CodecError::Decompress(format!(
            "framed length {framed} exceeds allocation cap"
        )));
    }

    let mut decoder = ZlibDecoder::new(&data[4..]);
    let mut out = Vec::with_capacity(framed);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    if out.len() != framed {
        return Err(CodecError::LengthMismatch {
            framed,
            actual: out.len(),
        });
    }
    Ok(out)
}
