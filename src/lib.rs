//! Client-side mesh asset repository.
//!
//! Fetches, caches and dispatches polygonal mesh assets (headers, LOD
//! bodies, skin rigs, convex decompositions, physics shapes) for a
//! real-time viewer. Assets are addressed by opaque 128-bit ids and
//! pulled from an HTTP capability with byte-range requests; everything
//! lands in a per-asset disk cache with a preamble-and-flags layout so a
//! revisit costs a read instead of a round trip.
//!
//! The render thread talks to [`MeshRepository`] only: `load_mesh`,
//! `get_skin_info` and friends are non-blocking, and `tick()` pumps
//! completions back as subscriber callbacks once per frame. A single repo
//! worker thread owns the request queues and the HTTP engine; a small
//! processing pool absorbs parse and decode work.

pub mod cache;
pub mod codec;
pub mod constants;
pub mod error;
pub mod http;
pub mod mesh;
pub mod repository;
pub mod stats;
pub mod subscriber;

use std::path::PathBuf;

use serde::Deserialize;

use constants::water;

pub use error::{MeshError, MeshResult};
pub use mesh::{Decomposition, MeshHeader, MeshId, SkinInfo, Volume, VolumeDecoder};
pub use repository::decomposer::{ConvexDecomposer, HullRequest};
pub use repository::{CapabilitySource, CapabilityUrls, MeshRepository, RepoDependencies};
pub use stats::StatsSnapshot;
pub use subscriber::{ObjectView, RigView, SceneObject};

/// Repository configuration. Deserializable so hosts can load it from
/// their settings store; out-of-range concurrency values are clamped with
/// a warning rather than honored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Concurrent request target on the modern capability path.
    pub max_concurrent_requests: u32,
    /// Concurrent request target on the legacy path.
    pub legacy_max_concurrent_requests: u32,
    /// Use the legacy capability even when a modern one exists.
    pub prefer_legacy_transport: bool,
    /// Obey server Retry-After headers when backing off.
    pub use_retry_after: bool,
    /// Fetch whole assets instead of byte ranges (for broken middleboxes).
    pub disable_range_requests: bool,
    /// Denominator for streaming-cost computation; carried for the host's
    /// LOD metrics, unused by the pipeline itself.
    pub mesh_triangle_budget: u32,
    pub cache_dir: PathBuf,
    pub max_cache_asset_size: u64,
    pub transport_io_threads: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: water::DEFAULT_CONCURRENT_REQUESTS,
            legacy_max_concurrent_requests: water::DEFAULT_LEGACY_CONCURRENT_REQUESTS,
            prefer_legacy_transport: false,
            use_retry_after: true,
            disable_range_requests: false,
            mesh_triangle_budget: 250_000,
            cache_dir: PathBuf::from("mesh_cache"),
            max_cache_asset_size: constants::cache::DEFAULT_MAX_ASSET_SIZE,
            transport_io_threads: constants::http::DEFAULT_IO_THREADS,
        }
    }
}

impl RepoConfig {
    /// Apply the concurrency caps. Values over the limit are reset to the
    /// defaults, matching how the viewer treats runaway settings.
    pub fn sanitized(mut self) -> Self {
        if self.max_concurrent_requests > water::CONCURRENT_REQUEST_LIMIT {
            log::warn!(
                target: "mesh::config",
                "max_concurrent_requests {} over cap {}; resetting to {}",
                self.max_concurrent_requests,
                water::CONCURRENT_REQUEST_LIMIT,
                water::DEFAULT_CONCURRENT_REQUESTS
            );
            self.max_concurrent_requests = water::DEFAULT_CONCURRENT_REQUESTS;
        }
        if self.legacy_max_concurrent_requests > water::LEGACY_CONCURRENT_REQUEST_LIMIT {
            log::warn!(
                target: "mesh::config",
                "legacy_max_concurrent_requests {} over cap {}; resetting to {}",
                self.legacy_max_concurrent_requests,
                water::LEGACY_CONCURRENT_REQUEST_LIMIT,
                water::DEFAULT_LEGACY_CONCURRENT_REQUESTS
            );
            self.legacy_max_concurrent_requests = water::DEFAULT_LEGACY_CONCURRENT_REQUESTS;
        }
        self.transport_io_threads = self.transport_io_threads.max(1);
        self
    }

    /// Ceiling for queued-plus-in-flight requests.
    pub fn high_water_mark(&self) -> usize {
        if self.prefer_legacy_transport {
            (water::LEGACY_WATER_SCALE * self.legacy_max_concurrent_requests as usize)
                .clamp(water::REQUEST_HIGH_WATER_MIN, water::REQUEST_HIGH_WATER_MAX)
        } else {
            (water::MODERN_WATER_SCALE * self.max_concurrent_requests as usize)
                .clamp(water::REQUEST2_HIGH_WATER_MIN, water::REQUEST2_HIGH_WATER_MAX)
        }
    }

    /// Hysteresis floor paired with [`high_water_mark`](Self::high_water_mark).
    pub fn low_water_mark(&self) -> usize {
        if self.prefer_legacy_transport {
            (self.high_water_mark() / 2)
                .clamp(water::REQUEST_LOW_WATER_MIN, water::REQUEST_LOW_WATER_MAX)
        } else {
            (self.high_water_mark() / 2)
                .clamp(water::REQUEST2_LOW_WATER_MIN, water::REQUEST2_LOW_WATER_MAX)
        }
    }
}
