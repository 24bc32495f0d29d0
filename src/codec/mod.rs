//! BinaryCodec: the self-describing header map, the asset/cache preamble,
//! and the length-framed zlib streams wrapping skin and decomposition
//! sub-blobs.
//!
//! The remote asset and the cache file share one byte layout, so a single
//! parser serves both the HTTP path and the disk read-through path.

pub mod asset;
pub mod value;

pub use asset::{
    compress_blob, decompress_blob, encode_asset_header, parse_asset_header, AssetPreamble,
};
pub use value::{MapEntries, MapValue};

/// Codec-level failure. Converted to [`MeshError::Parse`] at the pipeline
/// boundary.
///
/// [`MeshError::Parse`]: crate::error::MeshError::Parse
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes at offset {at}")]
    Truncated { at: usize, needed: usize },

    #[error("unknown value tag {tag} at offset {at}")]
    BadTag { at: usize, tag: u8 },

    #[error("invalid utf-8 in key or string at offset {at}")]
    BadUtf8 { at: usize },

    #[error("nesting deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("unsupported container version {found}")]
    BadContainerVersion { found: u32 },

    #[error("header map of {size} bytes exceeds the header region")]
    HeaderTooLarge { size: u64 },

    #[error("missing required key '{key}'")]
    MissingKey { key: &'static str },

    #[error("key '{key}' has the wrong value type")]
    WrongType { key: String },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("decompressed length {actual} does not match frame length {framed}")]
    LengthMismatch { framed: usize, actual: usize },
}

impl From<CodecError> for crate::error::MeshError {
    fn from(err: CodecError) -> Self {
        crate::error::MeshError::Parse(err.to_string())
    }
}
