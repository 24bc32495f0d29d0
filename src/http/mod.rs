//! HTTP fetch layer: policy-classed byte-range GETs over a pluggable
//! transport.
//!
//! The transport itself (connection pooling, timeouts, redirects) is an
//! external concern behind the [`Transport`] trait; this module decides
//! which policy class a request belongs to, shapes the byte-range request,
//! and counts traffic. Production code uses [`ReqwestTransport`]; tests
//! script their own implementation.

pub mod reqwest_transport;

use std::sync::Arc;
use std::time::Duration;

use crate::constants::http::LARGE_MESH_FETCH_THRESHOLD;
use crate::error::MeshResult;
use crate::stats::RepoStats;

pub use reqwest_transport::ReqwestTransport;

/// Which transfer policy a request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyClass {
    /// Sub-blobs under 2 MiB; 120 s transfer timeout.
    Small,
    /// 2 MiB and up; narrow queue, 600 s transfer timeout.
    Large,
    /// Pre-capability regions only.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    /// Inclusive end for the Range header.
    pub fn last_byte(&self) -> u64 {
        self.offset + self.len - 1
    }
}

/// One GET, ready for a transport.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub url: String,
    /// None means fetch the whole asset (range requests disabled).
    pub range: Option<ByteRange>,
    pub policy: PolicyClass,
}

pub type FetchHandle = u64;

/// Completion of one GET, success or not.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub handle: FetchHandle,
    /// HTTP status; 0 when the transport never got a response.
    pub status: u16,
    /// Transport-level error text when status is 0.
    pub error: Option<String>,
    pub body: Vec<u8>,
    /// Start of the returned window per Content-Range; None when the
    /// header was absent or unparseable.
    pub returned_offset: Option<u64>,
    /// Server-requested backoff, if any.
    pub retry_after: Option<Duration>,
    /// Retries the transport performed internally.
    pub transport_retries: u32,
}

impl FetchEvent {
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }
}

/// Asynchronous request engine seam. `submit` must not block; completions
/// surface through non-blocking `poll` calls from the worker loop.
pub trait Transport: Send {
    fn submit(&mut self, spec: FetchSpec) -> MeshResult<FetchHandle>;
    fn poll(&mut self) -> Vec<FetchEvent>;
}

/// Policy selection and traffic accounting over a transport.
pub struct HttpFetcher {
    transport: Box<dyn Transport>,
    disable_range_requests: bool,
    stats: Arc<RepoStats>,
}

impl HttpFetcher {
    pub fn new(
        transport: Box<dyn Transport>,
        disable_range_requests: bool,
        stats: Arc<RepoStats>,
    ) -> Self {
        Self {
            transport,
            disable_range_requests,
            stats,
        }
    }

    /// Issue a byte-range GET with the right policy class. Large transfers
    /// go to the narrow queue regardless of capability generation.
    pub fn get_byte_range(
        &mut self,
        url: &str,
        legacy: bool,
        offset: u64,
        len: u64,
    ) -> MeshResult<FetchHandle> {
        let policy = if len >= LARGE_MESH_FETCH_THRESHOLD {
            PolicyClass::Large
        } else if legacy {
            PolicyClass::Legacy
        } else {
            PolicyClass::Small
        };

        let range = if self.disable_range_requests {
            None
        } else {
            Some(ByteRange { offset, len })
        };

        let handle = self.transport.submit(FetchSpec {
            url: url.to_owned(),
            range,
            policy,
        })?;

        match policy {
            PolicyClass::Large => RepoStats::bump(&self.stats.http_large_request_count),
            _ => RepoStats::bump(&self.stats.http_request_count),
        }
        Ok(handle)
    }

    pub fn poll(&mut self) -> Vec<FetchEvent> {
        self.transport.poll()
    }
}

/// Parse a `Content-Range: bytes 200-1000/67589` style value into the
/// start offset of the returned window.
pub fn parse_content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let dash = rest.find('-')?;
    rest[..dash].trim().parse().ok()
}
