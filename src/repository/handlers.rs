//! Per-request completion handlers.
//!
//! One handler value per in-flight HTTP request, discriminated by
//! [`HandlerKind`]. The shared `on_completed` path does retry accounting,
//! status checking, content-range validation and window slicing once;
//! per-kind logic only sees a clean owned buffer.

use log::{debug, info, warn};

use crate::constants::cache::CACHE_PREAMBLE_SIZE;
use crate::error::{MeshError, MeshResult};
use crate::http::FetchEvent;
use crate::mesh::{BlobKind, Decomposition, MeshId};
use crate::repository::pending::RequestStats;
use crate::repository::pool::PoolTask;
use crate::repository::worker::{LoadedMesh, MeshWorker, QueueKind, WorkerShared};
use crate::stats::RepoStats;

const LOG: &str = "mesh::handler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Header,
    Lod { lod: usize },
    Skin,
    Decomposition,
    PhysicsShape,
}

impl HandlerKind {
    fn queue_kind(self) -> QueueKind {
        match self {
            HandlerKind::Header => QueueKind::Header,
            HandlerKind::Lod { .. } => QueueKind::Lod,
            HandlerKind::Skin => QueueKind::Skin,
            HandlerKind::Decomposition => QueueKind::Decomposition,
            HandlerKind::PhysicsShape => QueueKind::PhysicsShape,
        }
    }
}

/// State for one in-flight byte-range GET.
#[derive(Clone)]
pub(crate) struct Handler {
    pub kind: HandlerKind,
    pub mesh_id: MeshId,
    /// Absolute requested offset (wire and disk agree).
    pub offset: u64,
    pub requested: u64,
    pub stats: RequestStats,
}

impl Handler {
    /// Common completion path. Runs on the worker thread; the handler is
    /// removed from the in-flight set only after this returns.
    pub(crate) fn on_completed(&self, ctx: &mut MeshWorker, event: &FetchEvent) {
        RepoStats::add_u32(
            &ctx.shared.stats.http_retry_count,
            event.transport_retries,
        );

        if !event.is_success() {
            RepoStats::bump(&ctx.shared.stats.http_error_count);
            let error = MeshError::Transport {
                status: event.status,
                message: event
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("http status {}", event.status)),
            };
            self.process_failure(ctx, &error, event);
            return;
        }

        let buffer = match self.slice_window(ctx, event) {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!(
                    target: LOG,
                    "{:?} response for {} rejected: {error}", self.kind, self.mesh_id
                );
                RepoStats::bump(&ctx.shared.stats.http_error_count);
                self.process_failure(ctx, &error, event);
                return;
            }
        };

        RepoStats::add_u64(&ctx.shared.stats.bytes_received, buffer.len() as u64);
        self.process_data(ctx, buffer);
    }

    /// Validate that the response window covers the requested offset and
    /// copy the requested slice into an owned buffer.
    ///
    /// Some services return 206 without a Content-Range header; the bytes
    /// are then assumed to be exactly the requested window. A 200 carries
    /// the whole asset and is sliced down.
    fn slice_window(&self, ctx: &MeshWorker, event: &FetchEvent) -> MeshResult<Vec<u8>> {
        let body = &event.body;
        if body.is_empty() {
            // Per-kind logic decides what an empty body means.
            return Ok(Vec::new());
        }

        let returned_offset = if event.status == 206 {
            event.returned_offset.unwrap_or(self.offset)
        } else {
            0
        };

        if returned_offset > self.offset
            || self.offset - returned_offset >= body.len() as u64
        {
            return Err(MeshError::ContentRangeMismatch {
                requested_offset: self.offset,
                requested_len: self.requested,
                returned_offset,
                returned_len: body.len() as u64,
            });
        }

        let body_offset = (self.offset - returned_offset) as usize;
        let take = (body.len() - body_offset).min(self.requested as usize);
        let mut buffer = ctx.shared.alloc_blob(take)?;
        buffer.copy_from_slice(&body[body_offset..body_offset + take]);
        Ok(buffer)
    }

    /// Failure path shared by transport errors, range mismatches and
    /// allocation failures. Retryable errors go back on the kind's queue
    /// with a backoff timer; everything else resolves unavailable.
    fn process_failure(&self, ctx: &mut MeshWorker, error: &MeshError, event: &FetchEvent) {
        let kind = self.kind.queue_kind();
        if error.is_retryable() && self.stats.can_retry() && !ctx.shared.is_shutting_down() {
            let mut stats = self.stats.clone();
            let retry_after = if ctx.shared.use_retry_after {
                event.retry_after
            } else {
                None
            };
            stats.update_time(retry_after);
            debug!(
                target: LOG,
                "{kind:?} for {} failed ({error}); retry {} armed",
                self.mesh_id,
                stats.retries()
            );

            let entry = crate::repository::worker::QueueEntry {
                mesh_id: self.mesh_id,
                lod: self.lod_or_zero(),
                stats,
            };
            let mut queues = ctx.shared.queues.lock();
            if ctx.shared.is_shutting_down() {
                return;
            }
            queues.deque(kind).push_back(entry);
            if kind == QueueKind::Lod {
                RepoStats::bump(&ctx.shared.stats.lod_processing);
            }
            return;
        }

        info!(
            target: LOG,
            "{kind:?} for {} failed permanently: {error}", self.mesh_id
        );
        let entry = crate::repository::worker::QueueEntry {
            mesh_id: self.mesh_id,
            lod: self.lod_or_zero(),
            stats: self.stats.clone(),
        };
        ctx.push_terminal_failure(kind, &entry);
    }

    fn lod_or_zero(&self) -> usize {
        match self.kind {
            HandlerKind::Lod { lod } => lod,
            _ => 0,
        }
    }

    fn process_data(&self, ctx: &mut MeshWorker, data: Vec<u8>) {
        match self.kind {
            HandlerKind::Header => self.process_header(ctx, data),
            HandlerKind::Lod { lod } => self.process_lod(ctx, data, lod),
            HandlerKind::Skin => self.process_skin(ctx, data),
            HandlerKind::Decomposition => self.process_decomposition(ctx, data),
            HandlerKind::PhysicsShape => self.process_physics_shape(ctx, data),
        }
    }

    /// Header bytes straight off the wire: parse, then lay down the cache
    /// file (header region plus a zeroed reservation for every declared
    /// payload, preamble written last).
    fn process_header(&self, ctx: &mut MeshWorker, data: Vec<u8>) {
        let mesh_id = self.mesh_id;
        if !ctx.header_received(mesh_id, &data, None) {
            // Not a parseable mesh asset; none of the LODs will ever load.
            warn!(
                target: LOG,
                "unable to parse mesh header for {mesh_id}; not retrying"
            );
            ctx.shared.mark_not_found(mesh_id);
            ctx.shared.pending_lods.lock().remove(&mesh_id);
            ctx.shared.push_unavailable_all_lods(mesh_id);
            return;
        }

        let Some(header) = ctx.shared.headers.read().get(&mesh_id).cloned() else {
            return;
        };
        if header.not_found || !header.supported_version() || header.header_size == 0 {
            return;
        }

        let total = CACHE_PREAMBLE_SIZE + header.header_size as u64 + header.payload_extent();
        if total > ctx.shared.cache.max_asset_size() {
            warn!(
                target: LOG,
                "asset {mesh_id} ({total} bytes) exceeds the cache file cap; not caching"
            );
            return;
        }

        let clipped = (data.len() as u64).min(total) as usize;
        match ctx.shared.cache.open(mesh_id, crate::cache::OpenMode::ReadWrite) {
            Ok(mut file) => {
                let write = (|| -> MeshResult<()> {
                    if clipped > CACHE_PREAMBLE_SIZE as usize {
                        file.write_at(
                            CACHE_PREAMBLE_SIZE,
                            &data[CACHE_PREAMBLE_SIZE as usize..clipped],
                        )?;
                    }
                    // Reserve the declared payload span; unwritten regions
                    // read back as zeros for the zero-probe.
                    file.reserve(total)?;
                    file.write_preamble(header.header_size, header.flags())?;
                    Ok(())
                })();
                match write {
                    Ok(()) => {
                        RepoStats::add_u64(&ctx.shared.stats.cache_bytes_written, clipped as u64);
                        RepoStats::bump(&ctx.shared.stats.cache_writes);
                    }
                    Err(e) => warn!(target: LOG, "header cache write failed for {mesh_id}: {e}"),
                }
            }
            Err(e) => warn!(target: LOG, "cache open failed for {mesh_id}: {e}"),
        }
    }

    fn process_lod(&self, ctx: &mut MeshWorker, data: Vec<u8>, lod: usize) {
        let mesh_id = self.mesh_id;
        let offset = self.offset;
        post_decode(
            ctx,
            data,
            move |shared, bytes| shared.decode_lod(mesh_id, lod, bytes),
            move |shared, volume, bytes| {
                shared.write_blob_to_cache(mesh_id, BlobKind::Lod(lod), offset, &bytes);
                shared.push_loaded(LoadedMesh {
                    mesh_id,
                    lod,
                    volume,
                });
            },
            move |shared, error| {
                info!(
                    target: LOG,
                    "LOD {lod} processing failed for {mesh_id}: {error}; not retrying"
                );
                shared.push_unavailable(mesh_id, lod);
            },
        );
    }

    fn process_skin(&self, ctx: &mut MeshWorker, data: Vec<u8>) {
        let mesh_id = self.mesh_id;
        let offset = self.offset;
        post_decode(
            ctx,
            data,
            move |shared, bytes| shared.parse_skin(mesh_id, bytes),
            move |shared, skin, bytes| {
                shared.write_blob_to_cache(mesh_id, BlobKind::Skin, offset, &bytes);
                shared.skin_parsed(skin);
            },
            move |shared, error| {
                info!(
                    target: LOG,
                    "skin processing failed for {mesh_id}: {error}; not retrying"
                );
                shared.push_skin_unavailable(mesh_id);
            },
        );
    }

    fn process_decomposition(&self, ctx: &mut MeshWorker, data: Vec<u8>) {
        let mesh_id = self.mesh_id;
        let offset = self.offset;
        post_decode(
            ctx,
            data,
            move |shared, bytes| shared.parse_decomposition(mesh_id, bytes),
            move |shared, decomposition, bytes| {
                shared.write_blob_to_cache(mesh_id, BlobKind::PhysicsConvex, offset, &bytes);
                shared.push_decomposition(decomposition);
            },
            move |shared, error| {
                info!(
                    target: LOG,
                    "decomposition processing failed for {mesh_id}: {error}"
                );
                shared.push_physics_unavailable(mesh_id);
            },
        );
    }

    fn process_physics_shape(&self, ctx: &mut MeshWorker, data: Vec<u8>) {
        let mesh_id = self.mesh_id;
        let offset = self.offset;
        if data.is_empty() {
            // No data means no physics shape exists; report the empty
            // shape so physics stops waiting.
            ctx.shared.push_decomposition(Decomposition::new(mesh_id));
            return;
        }
        post_decode(
            ctx,
            data,
            move |shared, bytes| shared.decode_lod(mesh_id, 0, bytes),
            move |shared, volume, bytes| {
                shared.write_blob_to_cache(mesh_id, BlobKind::PhysicsMesh, offset, &bytes);
                let mut decomposition = Decomposition::new(mesh_id);
                decomposition.physics_shape_mesh = volume.flatten_positions();
                shared.push_decomposition(decomposition);
            },
            move |shared, error| {
                info!(
                    target: LOG,
                    "physics shape processing failed for {mesh_id}: {error}"
                );
                shared.push_physics_unavailable(mesh_id);
            },
        );
    }
}

/// Ship a buffer to the processing pool for a pure parse, then apply the
/// outcome on the worker thread via the deferred queue. Buffer ownership
/// moves into the posted task; if the pool refuses (shutdown teardown),
/// the task runs inline and ownership never leaves this thread.
fn post_decode<T, P, S, F>(ctx: &MeshWorker, data: Vec<u8>, parse: P, on_ok: S, on_err: F)
where
    T: Send + 'static,
    P: FnOnce(&WorkerShared, &[u8]) -> MeshResult<T> + Send + 'static,
    S: FnOnce(&WorkerShared, T, Vec<u8>) + Send + 'static,
    F: FnOnce(&WorkerShared, MeshError) + Send + 'static,
{
    let shared = ctx.shared.clone();
    let task: PoolTask = Box::new(move || {
        if shared.is_shutting_down() {
            // Buffer freed without processing.
            return;
        }
        let outcome = parse(&shared, &data);
        let shared_apply = shared.clone();
        shared.post_deferred(Box::new(move || match outcome {
            Ok(value) => on_ok(&shared_apply, value, data),
            Err(error) => on_err(&shared_apply, error),
        }));
    });
    if let Err(task) = ctx.pool.post(task) {
        task();
    }
}
