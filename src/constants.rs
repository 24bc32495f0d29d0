// Mesh repository constants - SINGLE SOURCE OF TRUTH
//
// Every tuning value used by the fetch/cache/dispatch pipeline lives here.
// Do NOT define pipeline constants anywhere else in the crate.

/// On-disk / on-wire asset framing.
pub mod cache {
    /// Version stamped into the 12-byte preamble. A mismatch invalidates
    /// the whole file.
    pub const CACHE_PREAMBLE_VERSION: u32 = 1;

    /// version | header_size | flags, little-endian u32 each.
    pub const CACHE_PREAMBLE_SIZE: u64 = 4 * 3;

    /// Headers are assumed to fit in this space; the initial byte-range
    /// request asks for exactly this much.
    pub const MESH_HEADER_SIZE: u64 = 4096;

    /// Largest serialized header map the codec will accept
    /// (preamble + header must fit in the initial read).
    pub const MAX_HEADER_MAP_SIZE: u64 = MESH_HEADER_SIZE - CACHE_PREAMBLE_SIZE;

    /// A region whose first kilobyte is all zeros is treated as
    /// reserved-but-unwritten.
    pub const ZERO_PROBE_BYTES: usize = 1024;

    /// Floor for the worker's reusable disk read buffer.
    pub const MIN_DISK_BUFFER_SIZE: usize = 8192;

    /// Per-asset cache file size cap.
    pub const DEFAULT_MAX_ASSET_SIZE: u64 = 256 * 1024 * 1024;
}

/// Concurrency water marks, shared by the worker and the facade.
pub mod water {
    /// Limits for the modern capability path.
    pub const REQUEST2_HIGH_WATER_MIN: usize = 32;
    pub const REQUEST2_HIGH_WATER_MAX: usize = 100;
    pub const REQUEST2_LOW_WATER_MIN: usize = 16;
    pub const REQUEST2_LOW_WATER_MAX: usize = 50;

    /// Limits for the legacy capability path. Should remain under 2x
    /// the transport throttle.
    pub const REQUEST_HIGH_WATER_MIN: usize = 32;
    pub const REQUEST_HIGH_WATER_MAX: usize = 150;
    pub const REQUEST_LOW_WATER_MIN: usize = 16;
    pub const REQUEST_LOW_WATER_MAX: usize = 75;

    /// Hard caps on the configured concurrent-request counts; anything
    /// higher is reset to the default with a warning.
    pub const CONCURRENT_REQUEST_LIMIT: u32 = 32;
    pub const LEGACY_CONCURRENT_REQUEST_LIMIT: u32 = 64;

    pub const DEFAULT_CONCURRENT_REQUESTS: u32 = 8;
    pub const DEFAULT_LEGACY_CONCURRENT_REQUESTS: u32 = 32;

    /// High water = scale * max_concurrent on the modern path (the
    /// transport keeps connections alive, so a deep queue pays off).
    pub const MODERN_WATER_SCALE: usize = 5;
    pub const LEGACY_WATER_SCALE: usize = 2;
}

/// Download retry policy.
pub mod retry {
    use std::time::Duration;

    /// Total retry budget per request.
    pub const DOWNLOAD_RETRY_LIMIT: u32 = 8;

    /// Base delay; the k-th retry waits base * 2^k (0.5s .. 64s).
    pub const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_millis(500);
}

/// HTTP transfer tuning.
pub mod http {
    use std::time::Duration;

    /// Requests at or above this size go to the narrow/slow large queue.
    pub const LARGE_MESH_FETCH_THRESHOLD: u64 = 1 << 21;

    pub const SMALL_MESH_XFER_TIMEOUT: Duration = Duration::from_secs(120);
    pub const LARGE_MESH_XFER_TIMEOUT: Duration = Duration::from_secs(600);

    pub const MESH_CONTENT_TYPE: &str = "application/vnd.ll.mesh";

    pub const DEFAULT_IO_THREADS: usize = 2;
}

/// Mesh asset format limits.
pub mod format {
    /// lowest, low, medium, high.
    pub const NUM_LODS: usize = 4;

    /// Three least significant digits are the minor version; integer 1 is
    /// version 0.001. Anything strictly greater than 999 (1.0 and up) is a
    /// format break we must not parse.
    pub const MAX_MESH_VERSION: u32 = 999;
}

/// Worker-loop scheduling.
pub mod worker {
    use std::time::Duration;

    /// Deferred-work budget per wake-up cycle.
    pub const DEFERRED_WORK_BUDGET: Duration = Duration::from_millis(8);

    /// Timed-wait ceiling so retry backoff progresses without a signal.
    pub const IDLE_WAIT: Duration = Duration::from_millis(100);

    /// Parse/decompress/optimize pool size.
    pub const PROCESSING_POOL_SIZE: usize = 2;

    /// Blob buffers above this size are refused outright; a failure to
    /// stay under it on a normal-sized blob triggers the soft-quit hook.
    pub const MAX_BLOB_ALLOC: usize = 30 * 1024 * 1024;
}

/// Facade timers.
pub mod facade {
    use std::time::Duration;

    /// Dead skin info is culled on this cadence.
    pub const SKIN_CULL_INTERVAL: Duration = Duration::from_secs(10);
}
