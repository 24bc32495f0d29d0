//! Pipeline counters. Plain atomics bumped from whichever thread is doing
//! the work; aggregation/reporting is the host application's concern.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RepoStats {
    pub bytes_received: AtomicU64,
    pub mesh_request_count: AtomicU32,
    pub http_request_count: AtomicU32,
    pub http_large_request_count: AtomicU32,
    pub http_retry_count: AtomicU32,
    pub http_error_count: AtomicU32,
    pub lod_processing: AtomicU32,
    pub lod_pending: AtomicU32,

    pub cache_bytes_read: AtomicU64,
    pub cache_bytes_written: AtomicU64,
    pub cache_bytes_headers: AtomicU64,
    pub cache_bytes_skins: AtomicU64,
    pub cache_bytes_decomps: AtomicU64,
    pub cache_reads: AtomicU32,
    pub cache_writes: AtomicU32,

    pub max_lock_holdoffs: AtomicU32,
}

/// Point-in-time copy for display or logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub mesh_request_count: u32,
    pub http_request_count: u32,
    pub http_large_request_count: u32,
    pub http_retry_count: u32,
    pub http_error_count: u32,
    pub lod_processing: u32,
    pub lod_pending: u32,
    pub cache_bytes_read: u64,
    pub cache_bytes_written: u64,
    pub cache_bytes_headers: u64,
    pub cache_bytes_skins: u64,
    pub cache_bytes_decomps: u64,
    pub cache_reads: u32,
    pub cache_writes: u32,
    pub max_lock_holdoffs: u32,
}

impl RepoStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            mesh_request_count: self.mesh_request_count.load(Ordering::Relaxed),
            http_request_count: self.http_request_count.load(Ordering::Relaxed),
            http_large_request_count: self.http_large_request_count.load(Ordering::Relaxed),
            http_retry_count: self.http_retry_count.load(Ordering::Relaxed),
            http_error_count: self.http_error_count.load(Ordering::Relaxed),
            lod_processing: self.lod_processing.load(Ordering::Relaxed),
            lod_pending: self.lod_pending.load(Ordering::Relaxed),
            cache_bytes_read: self.cache_bytes_read.load(Ordering::Relaxed),
            cache_bytes_written: self.cache_bytes_written.load(Ordering::Relaxed),
            cache_bytes_headers: self.cache_bytes_headers.load(Ordering::Relaxed),
            cache_bytes_skins: self.cache_bytes_skins.load(Ordering::Relaxed),
            cache_bytes_decomps: self.cache_bytes_decomps.load(Ordering::Relaxed),
            cache_reads: self.cache_reads.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            max_lock_holdoffs: self.max_lock_holdoffs.load(Ordering::Relaxed),
        }
    }

    pub fn add_u32(counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_u64(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Raise a high-water-mark style counter.
    pub fn raise_max(counter: &AtomicU32, value: u32) {
        counter.fetch_max(value, Ordering::Relaxed);
    }
}
