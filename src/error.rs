//! Error taxonomy for the fetch/cache/dispatch pipeline.
//!
//! Handlers never propagate errors across threads; they record a status and
//! post ready/unavailable entries onto the result queues. These types cover
//! everything that can go wrong between a byte-range request and a parsed
//! sub-blob.

/// Result alias used throughout the repository.
pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Any non-2xx HTTP response, or a transport-level failure with no
    /// response at all. Retryable up to the download retry limit.
    #[error("transport failure (status {status}): {message}")]
    Transport { status: u16, message: String },

    /// The returned byte window does not cover the requested offset.
    /// Not retryable for this fetch.
    #[error(
        "content range mismatch: requested [{requested_offset}..+{requested_len}), got [{returned_offset}..+{returned_len})"
    )]
    ContentRangeMismatch {
        requested_offset: u64,
        requested_len: u64,
        returned_offset: u64,
        returned_len: u64,
    },

    /// Codec failure on a header or sub-blob.
    #[error("parse error: {0}")]
    Parse(String),

    /// A blob buffer would exceed the per-blob allocation cap.
    #[error("blob of {size} bytes exceeds allocation cap")]
    OutOfMemory { size: usize },

    /// A read-through parse failed although the presence flag was set;
    /// the cache flags have been invalidated and the request requeued.
    #[error("cache mismatch for {mesh_id}")]
    CacheMismatch { mesh_id: crate::mesh::MeshId },

    /// No mesh capability URL for the current region. Transient; the
    /// facade re-reads the capability source on region change.
    #[error("no mesh capability for current region")]
    NoCapability,

    /// A sub-blob fetch was serviced before the asset's header landed.
    /// Retried with backoff until it does.
    #[error("header not yet available")]
    HeaderUnavailable,

    #[error("cache i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The repository is shutting down; no new work is accepted.
    #[error("repository shutting down")]
    Shutdown,
}

impl MeshError {
    /// Whether the worker should put the request back on its queue with a
    /// backoff timer rather than declaring it unavailable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Transport { .. }
                | MeshError::NoCapability
                | MeshError::HeaderUnavailable
                | MeshError::Io(_)
        )
    }
}
