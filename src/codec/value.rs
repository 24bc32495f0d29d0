//! Self-describing binary map values.
//!
//! Little-endian, tag-prefixed. One byte of tag, then the payload:
//!
//! ```text
//! 0  u32
//! 1  id         16 raw bytes
//! 2  str        u16 len + utf-8
//! 3  bytes      u32 len + raw
//! 4  f32 array  u32 count + count * f32
//! 5  list       u32 count + count * value
//! 6  map        u32 count + count * (u16 key len + utf-8 key, value)
//! ```
//!
//! Counts are validated against the remaining input before any allocation
//! so a hostile length prefix cannot balloon memory.

use crate::codec::CodecError;
use crate::mesh::MeshId;

const TAG_U32: u8 = 0;
const TAG_ID: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_F32_ARRAY: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;

/// Maps deeper than this are rejected.
const MAX_DEPTH: usize = 16;

pub type MapEntries = Vec<(String, MapValue)>;

#[derive(Debug, Clone, PartialEq)]
pub enum MapValue {
    U32(u32),
    Id(MeshId),
    Str(String),
    Bytes(Vec<u8>),
    F32Array(Vec<f32>),
    List(Vec<MapValue>),
    Map(MapEntries),
}

impl MapValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MapValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<MeshId> {
        match self {
            MapValue::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MapValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32s(&self) -> Option<&[f32]> {
        match self {
            MapValue::F32Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MapValue]> {
        match self {
            MapValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapEntries> {
        match self {
            MapValue::Map(v) => Some(v),
            _ => None,
        }
    }
}

/// First value under `key`, or None.
pub fn lookup<'a>(entries: &'a MapEntries, key: &str) -> Option<&'a MapValue> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

pub fn require_u32(entries: &MapEntries, key: &'static str) -> Result<u32, CodecError> {
    match lookup(entries, key) {
        Some(v) => v.as_u32().ok_or(CodecError::WrongType { key: key.into() }),
        None => Err(CodecError::MissingKey { key }),
    }
}

// ---------------------------------------------------------------------------
// Encoding

pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_value(&mut self, value: &MapValue) {
        match value {
            MapValue::U32(v) => {
                self.buf.push(TAG_U32);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            MapValue::Id(id) => {
                self.buf.push(TAG_ID);
                self.buf.extend_from_slice(&id.0);
            }
            MapValue::Str(s) => {
                self.buf.push(TAG_STR);
                self.put_short_str(s);
            }
            MapValue::Bytes(b) => {
                self.buf.push(TAG_BYTES);
                self.buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                self.buf.extend_from_slice(b);
            }
            MapValue::F32Array(fs) => {
                self.buf.push(TAG_F32_ARRAY);
                self.buf.extend_from_slice(&(fs.len() as u32).to_le_bytes());
                for f in fs {
                    self.buf.extend_from_slice(&f.to_le_bytes());
                }
            }
            MapValue::List(items) => {
                self.buf.push(TAG_LIST);
                self.buf
                    .extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    self.put_value(item);
                }
            }
            MapValue::Map(entries) => {
                self.buf.push(TAG_MAP);
                self.buf
                    .extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for (key, val) in entries {
                    self.put_short_str(key);
                    self.put_value(val);
                }
            }
        }
    }

    fn put_short_str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.buf
            .extend_from_slice(&(s.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a top-level map.
pub fn encode_map(entries: &MapEntries) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_value(&MapValue::Map(entries.clone()));
    w.into_bytes()
}

// ---------------------------------------------------------------------------
// Parsing

pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() - self.pos < n {
            return Err(CodecError::Truncated {
                at: self.pos,
                needed: n,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, CodecError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn short_str(&mut self) -> Result<String, CodecError> {
        let at = self.pos;
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadUtf8 { at })
    }

    /// Validate a count prefix against a per-element floor so a bad prefix
    /// can't allocate unbounded memory.
    fn checked_count(&self, count: u32, min_elem_size: usize) -> Result<usize, CodecError> {
        let count = count as usize;
        if count.saturating_mul(min_elem_size) > self.remaining() {
            return Err(CodecError::Truncated {
                at: self.pos,
                needed: count * min_elem_size,
            });
        }
        Ok(count)
    }

    pub fn value(&mut self) -> Result<MapValue, CodecError> {
        self.value_at_depth(0)
    }

    fn value_at_depth(&mut self, depth: usize) -> Result<MapValue, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep { max: MAX_DEPTH });
        }
        let at = self.pos;
        let tag = self.u8()?;
        match tag {
            TAG_U32 => Ok(MapValue::U32(self.u32()?)),
            TAG_ID => {
                let raw = self.take(16)?;
                let mut id = [0u8; 16];
                id.copy_from_slice(raw);
                Ok(MapValue::Id(MeshId(id)))
            }
            TAG_STR => Ok(MapValue::Str(self.short_str()?)),
            TAG_BYTES => {
                let len = self.u32()?;
                let len = self.checked_count(len, 1)?;
                Ok(MapValue::Bytes(self.take(len)?.to_vec()))
            }
            TAG_F32_ARRAY => {
                let count = self.u32()?;
                let count = self.checked_count(count, 4)?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(self.f32()?);
                }
                Ok(MapValue::F32Array(out))
            }
            TAG_LIST => {
                let count = self.u32()?;
                let count = self.checked_count(count, 1)?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(self.value_at_depth(depth + 1)?);
                }
                Ok(MapValue::List(out))
            }
            TAG_MAP => {
                let count = self.u32()?;
                let count = self.checked_count(count, 3)?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.short_str()?;
                    let val = self.value_at_depth(depth + 1)?;
                    out.push((key, val));
                }
                Ok(MapValue::Map(out))
            }
            other => Err(CodecError::BadTag { at, tag: other }),
        }
    }
}

/// Parse a top-level map, returning the entries and the bytes consumed.
pub fn parse_map(data: &[u8]) -> Result<(MapEntries, usize), CodecError> {
    let mut r = Reader::new(data);
    match r.value()? {
        MapValue::Map(entries) => Ok((entries, r.consumed())),
        _ => Err(CodecError::BadTag { at: 0, tag: 0xff }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> MapEntries {
        vec![
            ("version".into(), MapValue::U32(1)),
            ("creator".into(), MapValue::Id(MeshId::from_u64(42))),
            (
                "skin".into(),
                MapValue::Map(vec![
                    ("offset".into(), MapValue::U32(0)),
                    ("size".into(), MapValue::U32(256)),
                ]),
            ),
            (
                "joint_names".into(),
                MapValue::List(vec![
                    MapValue::Str("mPelvis".into()),
                    MapValue::Str("mTorso".into()),
                ]),
            ),
            ("weights".into(), MapValue::F32Array(vec![0.25, 0.75])),
            ("raw".into(), MapValue::Bytes(vec![1, 2, 3])),
        ]
    }

    #[test]
    fn roundtrip() {
        let entries = sample_map();
        let encoded = encode_map(&entries);
        let (decoded, consumed) = parse_map(&encoded).expect("parse");
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, entries);
    }

    #[test]
    fn parse_leaves_trailing_bytes_alone() {
        let mut encoded = encode_map(&sample_map());
        let map_len = encoded.len();
        encoded.extend_from_slice(&[0xaa; 64]);
        let (_, consumed) = parse_map(&encoded).expect("parse");
        assert_eq!(consumed, map_len);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let encoded = encode_map(&sample_map());
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            assert!(parse_map(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn hostile_count_prefix_is_rejected() {
        // Map claiming 2^31 entries with 5 bytes of input.
        let mut data = vec![TAG_MAP];
        data.extend_from_slice(&(1u32 << 31).to_le_bytes());
        assert!(matches!(
            parse_map(&data),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let data = [0x7f, 0, 0, 0, 0];
        assert!(matches!(
            Reader::new(&data).value(),
            Err(CodecError::BadTag { tag: 0x7f, .. })
        ));
    }

    #[test]
    fn lookup_and_require() {
        let entries = sample_map();
        assert_eq!(require_u32(&entries, "version").unwrap(), 1);
        assert!(matches!(
            require_u32(&entries, "absent"),
            Err(CodecError::MissingKey { .. })
        ));
        assert!(matches!(
            require_u32(&entries, "creator"),
            Err(CodecError::WrongType { .. })
        ));
        assert!(lookup(&entries, "skin").unwrap().as_map().is_some());
    }
}
