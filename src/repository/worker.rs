//! The repo worker: a single thread that drains per-kind request queues,
//! talks to the HTTP fetcher, parses what comes back (on the processing
//! pool where it is expensive), and feeds the result queues the facade
//! drains on the main thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::cache::{region_is_unwritten, MeshCache, OpenMode};
use crate::codec;
use crate::constants::cache::{CACHE_PREAMBLE_SIZE, MESH_HEADER_SIZE, MIN_DISK_BUFFER_SIZE};
use crate::constants::format::NUM_LODS;
use crate::constants::worker::{DEFERRED_WORK_BUDGET, IDLE_WAIT, MAX_BLOB_ALLOC};
use crate::error::{MeshError, MeshResult};
use crate::http::HttpFetcher;
use crate::mesh::{
    BlobKind, Decomposition, MeshHeader, MeshId, SkinInfo, Volume, VolumeDecoder,
};
use crate::repository::handlers::{Handler, HandlerKind};
use crate::repository::pending::RequestStats;
use crate::repository::pool::{PoolTask, ProcessingPool};
use crate::stats::RepoStats;

const LOG: &str = "mesh::worker";

/// Region capability URLs for mesh download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityUrls {
    pub modern: Option<String>,
    pub legacy: Option<String>,
}

impl CapabilityUrls {
    /// Pick the base URL: modern capability wins unless the host prefers
    /// (or only has) the legacy one. Returns (url, is_legacy).
    fn resolve(&self, prefer_legacy: bool) -> Option<(&str, bool)> {
        let modern = self.modern.as_deref().map(|u| (u, false));
        let legacy = self.legacy.as_deref().map(|u| (u, true));
        if prefer_legacy {
            legacy.or(modern)
        } else {
            modern.or(legacy)
        }
    }
}

/// One queued fetch. `lod` only means something for the LOD queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub mesh_id: MeshId,
    pub lod: usize,
    pub stats: RequestStats,
}

impl QueueEntry {
    fn new(mesh_id: MeshId) -> Self {
        Self {
            mesh_id,
            lod: 0,
            stats: RequestStats::default(),
        }
    }

    fn with_lod(mesh_id: MeshId, lod: usize) -> Self {
        Self {
            mesh_id,
            lod,
            stats: RequestStats::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Skin,
    Lod,
    Header,
    Decomposition,
    PhysicsShape,
}

/// Skin data gates rendering of rigged meshes, LODs dominate perceived
/// quality, headers are small, physics only matters to queries.
pub(crate) const SERVICE_ORDER: [QueueKind; 5] = [
    QueueKind::Skin,
    QueueKind::Lod,
    QueueKind::Header,
    QueueKind::Decomposition,
    QueueKind::PhysicsShape,
];

#[derive(Default)]
pub(crate) struct Queues {
    pub skin: VecDeque<QueueEntry>,
    pub lod: VecDeque<QueueEntry>,
    pub header: VecDeque<QueueEntry>,
    pub decomposition: VecDeque<QueueEntry>,
    pub physics_shape: VecDeque<QueueEntry>,
}

impl Queues {
    pub(crate) fn deque(&mut self, kind: QueueKind) -> &mut VecDeque<QueueEntry> {
        match kind {
            QueueKind::Skin => &mut self.skin,
            QueueKind::Lod => &mut self.lod,
            QueueKind::Header => &mut self.header,
            QueueKind::Decomposition => &mut self.decomposition,
            QueueKind::PhysicsShape => &mut self.physics_shape,
        }
    }

    pub(crate) fn backlog(&self) -> usize {
        self.skin.len() + self.lod.len() + self.header.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.skin.is_empty()
            && self.lod.is_empty()
            && self.header.is_empty()
            && self.decomposition.is_empty()
            && self.physics_shape.is_empty()
    }
}

/// A decoded LOD ready for main-thread dispatch.
pub(crate) struct LoadedMesh {
    pub mesh_id: MeshId,
    pub lod: usize,
    pub volume: Volume,
}

/// Worker-to-main completion queues. FIFO per queue; no ordering between
/// queues.
#[derive(Default)]
pub(crate) struct ResultQueues {
    pub loaded: VecDeque<LoadedMesh>,
    pub unavailable: VecDeque<(MeshId, usize)>,
    pub skin_ready: VecDeque<Arc<SkinInfo>>,
    pub skin_unavailable: VecDeque<MeshId>,
    pub decomposition_ready: VecDeque<Decomposition>,
    pub physics_unavailable: VecDeque<MeshId>,
}

impl ResultQueues {
    pub(crate) fn take_all(&mut self) -> ResultQueues {
        std::mem::take(self)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.loaded.is_empty()
            && self.unavailable.is_empty()
            && self.skin_ready.is_empty()
            && self.skin_unavailable.is_empty()
            && self.decomposition_ready.is_empty()
            && self.physics_unavailable.is_empty()
    }
}

pub(crate) type PendingLodMap = HashMap<MeshId, [u32; NUM_LODS]>;
pub(crate) type InFlightMap = HashMap<crate::http::FetchHandle, Handler>;

/// State shared between the worker thread, the processing pool tasks, and
/// the facade. Lock order where nesting is unavoidable: queues before
/// in_flight; everything else is taken alone.
pub(crate) struct WorkerShared {
    pub queues: Mutex<Queues>,
    pub headers: RwLock<HashMap<MeshId, MeshHeader>>,
    pub pending_lods: Mutex<PendingLodMap>,
    pub results: Mutex<ResultQueues>,
    /// Worker-side skin copy, used for rig lookups off the main thread.
    pub skin_map: Mutex<HashMap<MeshId, Arc<SkinInfo>>>,
    pub deferred: Mutex<VecDeque<PoolTask>>,
    pub in_flight: Mutex<InFlightMap>,
    pub caps: Mutex<CapabilityUrls>,
    pub prefer_legacy: AtomicBool,
    pub high_water: AtomicUsize,
    signal: Mutex<bool>,
    signal_cv: Condvar,
    pub shutting_down: Arc<AtomicBool>,
    pub stats: Arc<RepoStats>,
    pub cache: MeshCache,
    pub decoder: Arc<dyn VolumeDecoder>,
    pub soft_quit: Option<Box<dyn Fn() + Send + Sync>>,
    /// Obey server Retry-After headers when arming backoff timers.
    pub use_retry_after: bool,
}

impl WorkerShared {
    pub(crate) fn new(
        cache: MeshCache,
        decoder: Arc<dyn VolumeDecoder>,
        stats: Arc<RepoStats>,
        shutting_down: Arc<AtomicBool>,
        soft_quit: Option<Box<dyn Fn() + Send + Sync>>,
        use_retry_after: bool,
    ) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            headers: RwLock::new(HashMap::new()),
            pending_lods: Mutex::new(HashMap::new()),
            results: Mutex::new(ResultQueues::default()),
            skin_map: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            caps: Mutex::new(CapabilityUrls::default()),
            prefer_legacy: AtomicBool::new(false),
            high_water: AtomicUsize::new(crate::constants::water::REQUEST2_HIGH_WATER_MIN),
            signal: Mutex::new(false),
            signal_cv: Condvar::new(),
            shutting_down,
            stats,
            cache,
            decoder,
            soft_quit,
            use_retry_after,
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        let mut pending = self.signal.lock();
        *pending = true;
        self.signal_cv.notify_one();
    }

    /// Block until signalled or the idle timeout elapses (so backoff
    /// timers make progress without main-thread ticks).
    fn wait_for_signal(&self) {
        let mut pending = self.signal.lock();
        if !*pending {
            self.signal_cv.wait_for(&mut pending, IDLE_WAIT);
        }
        *pending = false;
    }

    pub(crate) fn post_deferred(&self, task: PoolTask) {
        self.deferred.lock().push_back(task);
        self.signal();
    }

    pub(crate) fn has_header(&self, mesh_id: MeshId) -> bool {
        self.headers.read().contains_key(&mesh_id)
    }

    /// URL for one asset, and whether it came from the legacy capability.
    pub(crate) fn construct_url(&self, mesh_id: MeshId) -> MeshResult<(String, bool)> {
        let caps = self.caps.lock();
        let prefer_legacy = self.prefer_legacy.load(Ordering::Relaxed);
        match caps.resolve(prefer_legacy) {
            Some((base, legacy)) => Ok((format!("{base}/?mesh_id={}", mesh_id.to_hex()), legacy)),
            None => {
                debug!(target: LOG, "no mesh capability; cannot fetch {mesh_id}");
                Err(MeshError::NoCapability)
            }
        }
    }

    // -- enqueue paths ------------------------------------------------------

    /// Route a LOD request: straight to the LOD queue when the header is
    /// known, else fold it into the pending-LOD table and (at most once)
    /// queue a header fetch.
    pub(crate) fn load_lod_locked(
        &self,
        queues: &mut Queues,
        pending_lods: &mut PendingLodMap,
        headers: &HashMap<MeshId, MeshHeader>,
        mesh_id: MeshId,
        lod: usize,
    ) {
        if lod >= NUM_LODS {
            warn!(target: LOG, "invalid LOD request {lod} for mesh {mesh_id}");
            return;
        }
        RepoStats::bump(&self.stats.mesh_request_count);
        if headers.contains_key(&mesh_id) {
            queues.lod.push_back(QueueEntry::with_lod(mesh_id, lod));
            RepoStats::bump(&self.stats.lod_processing);
        } else {
            match pending_lods.get_mut(&mesh_id) {
                Some(counts) => {
                    // Header already requested; just remember the LOD.
                    counts[lod] += 1;
                }
                None => {
                    let mut counts = [0u32; NUM_LODS];
                    counts[lod] = 1;
                    pending_lods.insert(mesh_id, counts);
                    queues.header.push_back(QueueEntry::new(mesh_id));
                }
            }
        }
    }

    /// Queue a skin fetch unless one is already queued or in flight.
    pub(crate) fn enqueue_skin_locked(
        &self,
        queues: &mut Queues,
        in_flight: &InFlightMap,
        mesh_id: MeshId,
    ) {
        let queued = queues.skin.iter().any(|e| e.mesh_id == mesh_id);
        let flying = in_flight
            .values()
            .any(|h| h.mesh_id == mesh_id && matches!(h.kind, HandlerKind::Skin));
        if !queued && !flying {
            RepoStats::bump(&self.stats.mesh_request_count);
            queues.skin.push_back(QueueEntry::new(mesh_id));
        }
    }

    pub(crate) fn enqueue_skin(&self, mesh_id: MeshId) {
        let mut queues = self.queues.lock();
        let in_flight = self.in_flight.lock();
        self.enqueue_skin_locked(&mut queues, &in_flight, mesh_id);
    }

    /// Decomposition and physics-shape fetches dedupe the same way.
    pub(crate) fn enqueue_blob_locked(
        &self,
        queues: &mut Queues,
        in_flight: &InFlightMap,
        kind: QueueKind,
        mesh_id: MeshId,
    ) {
        debug_assert!(matches!(
            kind,
            QueueKind::Decomposition | QueueKind::PhysicsShape
        ));
        let deque = queues.deque(kind);
        if deque.iter().any(|e| e.mesh_id == mesh_id) {
            return;
        }
        let handler_kind = match kind {
            QueueKind::Decomposition => HandlerKind::Decomposition,
            _ => HandlerKind::PhysicsShape,
        };
        let flying = in_flight
            .values()
            .any(|h| h.mesh_id == mesh_id && h.kind == handler_kind);
        if !flying {
            RepoStats::bump(&self.stats.mesh_request_count);
            queues.deque(kind).push_back(QueueEntry::new(mesh_id));
        }
    }

    // -- result pushes ------------------------------------------------------

    pub(crate) fn push_loaded(&self, mesh: LoadedMesh) {
        self.results.lock().loaded.push_back(mesh);
    }

    pub(crate) fn push_unavailable(&self, mesh_id: MeshId, lod: usize) {
        self.results.lock().unavailable.push_back((mesh_id, lod));
    }

    pub(crate) fn push_unavailable_all_lods(&self, mesh_id: MeshId) {
        let mut results = self.results.lock();
        for lod in 0..NUM_LODS {
            results.unavailable.push_back((mesh_id, lod));
        }
    }

    pub(crate) fn push_skin_unavailable(&self, mesh_id: MeshId) {
        self.results.lock().skin_unavailable.push_back(mesh_id);
    }

    pub(crate) fn push_physics_unavailable(&self, mesh_id: MeshId) {
        self.results.lock().physics_unavailable.push_back(mesh_id);
    }

    pub(crate) fn push_decomposition(&self, decomposition: Decomposition) {
        self.results
            .lock()
            .decomposition_ready
            .push_back(decomposition);
    }

    /// Skin parse succeeded somewhere: mirror into the worker map and hand
    /// the main thread its copy.
    pub(crate) fn skin_parsed(&self, skin: SkinInfo) {
        let skin = Arc::new(skin);
        self.skin_map.lock().insert(skin.mesh_id, skin.clone());
        self.results.lock().skin_ready.push_back(skin);
    }

    // -- header bookkeeping -------------------------------------------------

    pub(crate) fn store_header(&self, mesh_id: MeshId, header: MeshHeader) {
        RepoStats::add_u64(
            &self.stats.cache_bytes_headers,
            header.header_size as u64,
        );
        self.headers.write().insert(mesh_id, header);
    }

    /// Remember a permanent miss so nothing refetches this session.
    pub(crate) fn mark_not_found(&self, mesh_id: MeshId) {
        let mut headers = self.headers.write();
        headers.entry(mesh_id).or_default().not_found = true;
    }

    /// Snapshot the fields a fetch path needs, without holding the lock
    /// across I/O.
    pub(crate) fn header_fields(&self, mesh_id: MeshId) -> Option<HeaderFields> {
        let headers = self.headers.read();
        let header = headers.get(&mesh_id)?;
        Some(HeaderFields {
            header_size: header.header_size,
            supported_version: header.supported_version(),
            not_found: header.not_found,
        })
    }

    pub(crate) fn blob_location(&self, mesh_id: MeshId, kind: BlobKind) -> Option<BlobLocation> {
        let headers = self.headers.read();
        let header = headers.get(&mesh_id)?;
        let range = header.blob(kind);
        Some(BlobLocation {
            // Wire and disk share the layout, so the byte-range request
            // and the cache offset are the same number.
            offset: CACHE_PREAMBLE_SIZE + header.header_size as u64 + range.offset as u64,
            size: range.size as u64,
            in_cache: header.blob_in_cache(kind),
        })
    }

    /// Mark a blob resident and persist the new flags. The payload must
    /// already be on disk (payload first, preamble second, so a crash in
    /// between leaves the flag clear and the read-through path refetches).
    pub(crate) fn commit_blob_flag(&self, mesh_id: MeshId, kind: BlobKind) {
        let (header_size, flags) = {
            let mut headers = self.headers.write();
            let Some(header) = headers.get_mut(&mesh_id) else {
                return;
            };
            if header.blob_in_cache(kind) {
                return;
            }
            header.set_blob_in_cache(kind, true);
            (header.header_size, header.flags())
        };
        match self.cache.open(mesh_id, OpenMode::ReadWrite) {
            Ok(mut file) => {
                if let Err(e) = file.write_preamble(header_size, flags) {
                    warn!(target: LOG, "preamble update failed for {mesh_id}: {e}");
                }
                RepoStats::add_u64(&self.stats.cache_bytes_written, CACHE_PREAMBLE_SIZE);
            }
            Err(e) => warn!(target: LOG, "cache open failed for {mesh_id}: {e}"),
        }
    }

    /// Write one fetched sub-blob into its reserved cache region and set
    /// its presence flag. Skipped when the reservation is missing.
    pub(crate) fn write_blob_to_cache(
        &self,
        mesh_id: MeshId,
        kind: BlobKind,
        offset: u64,
        data: &[u8],
    ) {
        let Ok(mut file) = self.cache.open(mesh_id, OpenMode::ReadWrite) else {
            return;
        };
        if file.size() < offset + data.len() as u64 {
            // Header handler never reserved this region; leave the flag
            // clear and the blob stays HTTP-only.
            return;
        }
        if let Err(e) = file.write_at(offset, data) {
            warn!(target: LOG, "cache write failed for {mesh_id}: {e}");
            return;
        }
        RepoStats::add_u64(&self.stats.cache_bytes_written, data.len() as u64);
        RepoStats::bump(&self.stats.cache_writes);
        drop(file);
        self.commit_blob_flag(mesh_id, kind);
    }

    /// Cache-mismatch recovery: a read-through parse failed although the
    /// presence flag was set. Mark every blob missing and rewrite the
    /// preamble so a tampered or truncated file cannot wedge rendering.
    pub(crate) fn invalidate_cache(&self, mesh_id: MeshId) {
        info!(target: LOG, "cache mismatch for {mesh_id}; invalidating flags");
        let fields = {
            let mut headers = self.headers.write();
            match headers.get_mut(&mesh_id) {
                Some(header) => {
                    header.clear_cache_flags();
                    Some((header.header_size, header.flags()))
                }
                None => None,
            }
        };
        if let Some((header_size, flags)) = fields {
            if header_size > 0 {
                if let Ok(mut file) = self.cache.open(mesh_id, OpenMode::ReadWrite) {
                    if let Err(e) = file.write_preamble(header_size, flags) {
                        warn!(target: LOG, "preamble rewrite failed for {mesh_id}: {e}");
                    }
                }
            }
        }
    }

    /// Requeue after cache invalidation, suppressed during shutdown so a
    /// recovery racing `shutdown()` cannot resurrect work.
    pub(crate) fn requeue_after_mismatch(&self, kind: QueueKind, mesh_id: MeshId, lod: usize) {
        let mut queues = self.queues.lock();
        if self.is_shutting_down() {
            return;
        }
        match kind {
            QueueKind::Lod => {
                queues.lod.push_back(QueueEntry::with_lod(mesh_id, lod));
                RepoStats::bump(&self.stats.lod_processing);
            }
            QueueKind::Skin => queues.skin.push_back(QueueEntry::new(mesh_id)),
            other => queues.deque(other).push_back(QueueEntry::new(mesh_id)),
        }
        drop(queues);
        self.signal();
    }

    /// Buffer allocation with the 30 MiB per-blob cap. Anomalously large
    /// blobs are refused; a failed reservation below the cap means real
    /// memory pressure, which raises the soft-quit hook.
    pub(crate) fn alloc_blob(&self, size: usize) -> MeshResult<Vec<u8>> {
        if size > MAX_BLOB_ALLOC {
            return Err(MeshError::OutOfMemory { size });
        }
        let mut buf: Vec<u8> = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            warn!(target: LOG, "failed to allocate {size} bytes for mesh data");
            if let Some(quit) = &self.soft_quit {
                quit();
            }
            return Err(MeshError::OutOfMemory { size });
        }
        buf.resize(size, 0);
        Ok(buf)
    }

    /// Pure parse of a skin sub-blob; safe to run on the pool.
    pub(crate) fn parse_skin(&self, mesh_id: MeshId, data: &[u8]) -> MeshResult<SkinInfo> {
        let raw = codec::decompress_blob(data)?;
        let (entries, _) = codec::value::parse_map(&raw)?;
        Ok(SkinInfo::from_map(mesh_id, &entries)?)
    }

    /// Pure parse of a physics_convex sub-blob.
    pub(crate) fn parse_decomposition(
        &self,
        mesh_id: MeshId,
        data: &[u8],
    ) -> MeshResult<Decomposition> {
        let raw = codec::decompress_blob(data)?;
        let (entries, _) = codec::value::parse_map(&raw)?;
        Ok(Decomposition::from_map(mesh_id, &entries)?)
    }

    /// Decode one LOD body; the heavy lifting happens in the injected
    /// volume decoder. An empty volume is an error so the caller reports
    /// the LOD unavailable.
    pub(crate) fn decode_lod(&self, mesh_id: MeshId, lod: usize, data: &[u8]) -> MeshResult<Volume> {
        if data.is_empty() {
            return Err(MeshError::Parse("empty LOD body".into()));
        }
        let volume = self.decoder.decode_volume(mesh_id, lod, data)?;
        if volume.is_empty() {
            return Err(MeshError::Parse("volume decoded with no faces".into()));
        }
        Ok(volume)
    }
}

/// Copy of the header fields a fetch path needs.
pub(crate) struct HeaderFields {
    pub header_size: u32,
    pub supported_version: bool,
    pub not_found: bool,
}

pub(crate) struct BlobLocation {
    /// Absolute offset, identical on the wire and on disk.
    pub offset: u64,
    pub size: u64,
    pub in_cache: bool,
}

// ---------------------------------------------------------------------------

/// The worker thread proper: owns the HTTP fetcher and a reusable disk
/// read buffer; everything else lives in [`WorkerShared`].
pub(crate) struct MeshWorker {
    pub shared: Arc<WorkerShared>,
    pub fetcher: HttpFetcher,
    pub pool: Arc<ProcessingPool>,
    disk_buffer: Vec<u8>,
}

impl MeshWorker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        fetcher: HttpFetcher,
        pool: Arc<ProcessingPool>,
    ) -> Self {
        Self {
            shared,
            fetcher,
            pool,
            disk_buffer: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        info!(target: LOG, "mesh repo worker up");
        loop {
            self.shared.wait_for_signal();
            if self.shared.is_shutting_down() {
                break;
            }
            self.run_cycle();
        }
        info!(
            target: LOG,
            "mesh repo worker down; small GETs {} large GETs {} max holdoffs {}",
            self.shared.stats.http_request_count.load(Ordering::Relaxed),
            self.shared
                .stats
                .http_large_request_count
                .load(Ordering::Relaxed),
            self.shared.stats.max_lock_holdoffs.load(Ordering::Relaxed)
        );
    }

    /// One wake-up cycle: deferred work, transport poll, queue service.
    pub(crate) fn run_cycle(&mut self) {
        self.run_deferred();
        self.poll_completions();

        for kind in SERVICE_ORDER {
            self.service_kind(kind);
        }
    }

    fn run_deferred(&mut self) {
        let deadline = Instant::now() + DEFERRED_WORK_BUDGET;
        loop {
            let Some(task) = self.shared.deferred.lock().pop_front() else {
                break;
            };
            task();
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    fn poll_completions(&mut self) {
        let events = self.fetcher.poll();
        for event in events {
            let handler = self.shared.in_flight.lock().get(&event.handle).cloned();
            match handler {
                Some(handler) => {
                    // process_data runs to completion before the handler
                    // leaves the in-flight set.
                    handler.on_completed(self, &event);
                    self.shared.in_flight.lock().remove(&event.handle);
                }
                None => {
                    debug!(target: LOG, "completion for unknown handle {}", event.handle)
                }
            }
        }
    }

    fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    fn high_water(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }

    /// Drain one queue while there is room under the high-water mark.
    /// Delayed entries park on an incomplete list spliced back afterwards.
    fn service_kind(&mut self, kind: QueueKind) {
        let mut incomplete: Vec<QueueEntry> = Vec::new();

        loop {
            if self.in_flight_len() >= self.high_water() {
                break;
            }
            let entry = {
                let mut queues = self.shared.queues.lock();
                let popped = queues.deque(kind).pop_front();
                if popped.is_some() && kind == QueueKind::Lod {
                    self.shared
                        .stats
                        .lod_processing
                        .fetch_sub(1, Ordering::Relaxed);
                }
                popped
            };
            let Some(mut entry) = entry else { break };

            if entry.stats.is_delayed() {
                incomplete.push(entry);
                continue;
            }

            match self.fetch_entry(kind, &entry) {
                Ok(()) => {}
                Err(err) if err.is_retryable() && entry.stats.can_retry() => {
                    entry.stats.update_time(None);
                    incomplete.push(entry);
                }
                Err(err) => {
                    debug!(
                        target: LOG,
                        "{kind:?} fetch for {} failed terminally: {err}", entry.mesh_id
                    );
                    self.push_terminal_failure(kind, &entry);
                }
            }
        }

        if !incomplete.is_empty() {
            let mut queues = self.shared.queues.lock();
            let deque = queues.deque(kind);
            for entry in incomplete.into_iter().rev() {
                deque.push_front(entry);
            }
            if kind == QueueKind::Lod {
                // Parked entries are back in the queue; keep the gauge honest.
                let len = deque.len() as u32;
                self.shared.stats.lod_processing.store(len, Ordering::Relaxed);
            }
        }
    }

    /// Final failure for a queue entry whose retries ran out.
    pub(crate) fn push_terminal_failure(&self, kind: QueueKind, entry: &QueueEntry) {
        match kind {
            QueueKind::Header => {
                self.shared.mark_not_found(entry.mesh_id);
                self.shared.pending_lods.lock().remove(&entry.mesh_id);
                self.shared.push_unavailable_all_lods(entry.mesh_id);
            }
            QueueKind::Lod => self.shared.push_unavailable(entry.mesh_id, entry.lod),
            QueueKind::Skin => self.shared.push_skin_unavailable(entry.mesh_id),
            QueueKind::Decomposition | QueueKind::PhysicsShape => {
                self.shared.push_physics_unavailable(entry.mesh_id)
            }
        }
    }

    fn fetch_entry(&mut self, kind: QueueKind, entry: &QueueEntry) -> MeshResult<()> {
        match kind {
            QueueKind::Header => self.fetch_header(entry),
            QueueKind::Lod => self.fetch_lod(entry),
            QueueKind::Skin => self.fetch_skin(entry),
            QueueKind::Decomposition => self.fetch_decomposition(entry),
            QueueKind::PhysicsShape => self.fetch_physics_shape(entry),
        }
    }

    // -- header -------------------------------------------------------------

    fn fetch_header(&mut self, entry: &QueueEntry) -> MeshResult<()> {
        let mesh_id = entry.mesh_id;

        // Look for the asset in the disk cache first.
        let cached_size = self.shared.cache.asset_size(mesh_id);
        if cached_size >= CACHE_PREAMBLE_SIZE {
            let want = cached_size.min(2 * MESH_HEADER_SIZE) as usize;
            let mut buf = vec![0u8; want];
            let read_ok = self
                .shared
                .cache
                .open(mesh_id, OpenMode::Read)
                .and_then(|mut file| file.read_at(0, &mut buf))
                .is_ok();
            if read_ok {
                RepoStats::add_u64(&self.shared.stats.cache_bytes_read, want as u64);
                RepoStats::bump(&self.shared.stats.cache_reads);
                if let Ok((preamble, _)) = codec::parse_asset_header(&buf) {
                    if self.header_received(mesh_id, &buf, Some(preamble.flags)) {
                        debug!(target: LOG, "header for {mesh_id} served from cache");
                        return Ok(());
                    }
                }
            }
        }

        // Cache entry missing or corrupt; ask the server for the first 4 KiB.
        let (url, legacy) = self.shared.construct_url(mesh_id)?;
        let handle = self
            .fetcher
            .get_byte_range(&url, legacy, 0, MESH_HEADER_SIZE)?;
        self.shared.in_flight.lock().insert(
            handle,
            Handler {
                kind: HandlerKind::Header,
                mesh_id,
                offset: 0,
                requested: MESH_HEADER_SIZE,
                stats: entry.stats.clone(),
            },
        );
        Ok(())
    }

    /// Common header ingestion for the cache path and the HTTP path.
    /// Returns false when the bytes do not parse into a usable header (the
    /// caller falls back to HTTP or reports failure).
    ///
    /// On success this also: stores the header, auto-issues the skin
    /// fetch, parses sub-blobs already inside `data`, and materialises
    /// pending LOD requests.
    pub(crate) fn header_received(
        &mut self,
        mesh_id: MeshId,
        data: &[u8],
        cached_flags: Option<u32>,
    ) -> bool {
        let (_preamble, mut header) = match codec::parse_asset_header(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(target: LOG, "header parse failed for {mesh_id}: {e}");
                return false;
            }
        };

        if !header.supported_version() {
            info!(
                target: LOG,
                "unsupported mesh version {} for {mesh_id}", header.version
            );
            header.not_found = true;
        } else if header.actual_lod(0).is_none() {
            info!(target: LOG, "header for {mesh_id} declares no usable LOD");
            // actual_lod already set not_found.
        }

        if header.not_found {
            self.shared.store_header(mesh_id, header);
            self.shared.pending_lods.lock().remove(&mesh_id);
            self.shared.push_unavailable_all_lods(mesh_id);
            // Parsed, permanently absent: the request itself is done.
            return true;
        }

        match cached_flags {
            Some(flags) => header.apply_flags(flags),
            None => {
                // Fresh from the wire: whatever sits entirely inside this
                // response is about to be written to disk by the header
                // handler, so it counts as cached.
                let body_start = CACHE_PREAMBLE_SIZE + header.header_size as u64;
                let data_len = data.len() as u64;
                let contained = move |range: crate::mesh::BlobRange| {
                    range.is_declared() && body_start + range.end() <= data_len
                };
                header.skin_in_cache = contained(header.skin);
                header.physics_convex_in_cache = contained(header.physics_convex);
                header.physics_mesh_in_cache = contained(header.physics_mesh);
                for i in 0..NUM_LODS {
                    header.lod_in_cache[i] = contained(header.lods[i]);
                }
            }
        }

        let skin = header.skin;
        let lods = header.lods;
        let header_size = header.header_size;
        self.shared.store_header(mesh_id, header);

        let window = |range: crate::mesh::BlobRange| -> Option<&[u8]> {
            let start = (CACHE_PREAMBLE_SIZE + header_size as u64 + range.offset as u64) as usize;
            let end = start + range.size as usize;
            data.get(start..end)
        };

        // Skin is a prerequisite for rendering any LOD of a rigged mesh;
        // request it immediately, straight from this window if possible.
        if skin.is_declared() {
            let inline_ok = window(skin)
                .map(|bytes| match self.shared.parse_skin(mesh_id, bytes) {
                    Ok(skin_info) => {
                        self.shared.skin_parsed(skin_info);
                        true
                    }
                    Err(_) => false,
                })
                .unwrap_or(false);
            if !inline_ok {
                self.shared.enqueue_skin(mesh_id);
            }
        }

        // LOD requests that piled up while the header was in flight.
        let pending = self.shared.pending_lods.lock().remove(&mesh_id);
        if let Some(counts) = pending {
            for (lod, count) in counts.into_iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let inline_ok = lods[lod].is_declared()
                    && window(lods[lod])
                        .map(|bytes| match self.shared.decode_lod(mesh_id, lod, bytes) {
                            Ok(volume) => {
                                self.shared.push_loaded(LoadedMesh {
                                    mesh_id,
                                    lod,
                                    volume,
                                });
                                true
                            }
                            Err(_) => false,
                        })
                        .unwrap_or(false);
                if !inline_ok {
                    let mut queues = self.shared.queues.lock();
                    queues.lod.push_back(QueueEntry::with_lod(mesh_id, lod));
                    RepoStats::bump(&self.shared.stats.lod_processing);
                }
            }
        }

        true
    }

    // -- sub-blob fetch paths ----------------------------------------------

    /// Shared front half of every sub-blob fetch: resolve the blob range,
    /// bail out early when the asset can't carry it.
    fn locate_blob(
        &self,
        mesh_id: MeshId,
        kind: BlobKind,
    ) -> MeshResult<Option<BlobLocation>> {
        let Some(fields) = self.shared.header_fields(mesh_id) else {
            // No header yet; worker-level retry until it lands.
            return Err(MeshError::HeaderUnavailable);
        };
        if fields.header_size == 0 || fields.not_found || !fields.supported_version {
            return Ok(None);
        }
        let location = self
            .shared
            .blob_location(mesh_id, kind)
            .filter(|loc| loc.size > 0);
        Ok(location)
    }

    fn read_cached_region(&mut self, mesh_id: MeshId, location: &BlobLocation) -> Option<Vec<u8>> {
        if !location.in_cache {
            return None;
        }
        if self.shared.cache.asset_size(mesh_id) < location.offset + location.size {
            return None;
        }
        let mut buf = self.shared.alloc_blob(location.size as usize).ok()?;
        let mut file = self.shared.cache.open(mesh_id, OpenMode::Read).ok()?;
        file.read_at(location.offset, &mut buf).ok()?;
        RepoStats::add_u64(&self.shared.stats.cache_bytes_read, location.size);
        RepoStats::bump(&self.shared.stats.cache_reads);
        if region_is_unwritten(&buf) {
            // Flag promised data but the region was never written (crash
            // between payload and preamble, or external tampering).
            self.shared.invalidate_cache(mesh_id);
            return None;
        }
        Some(buf)
    }

    /// Reusable scratch for the synchronous decomposition/physics cache
    /// reads. Leading bytes are poisoned on reuse so stale content can't
    /// parse if a read comes up short.
    fn disk_scratch(&mut self, size: usize) -> &mut [u8] {
        let want = size.max(MIN_DISK_BUFFER_SIZE);
        if self.disk_buffer.len() < want {
            self.disk_buffer = vec![0u8; want];
        } else {
            for b in self.disk_buffer.iter_mut().take(16) {
                *b = 0;
            }
        }
        &mut self.disk_buffer[..size]
    }

    fn issue_blob_request(
        &mut self,
        handler_kind: HandlerKind,
        mesh_id: MeshId,
        location: &BlobLocation,
        stats: &RequestStats,
    ) -> MeshResult<()> {
        let (url, legacy) = self.shared.construct_url(mesh_id)?;
        let handle =
            self.fetcher
                .get_byte_range(&url, legacy, location.offset, location.size)?;
        self.shared.in_flight.lock().insert(
            handle,
            Handler {
                kind: handler_kind,
                mesh_id,
                offset: location.offset,
                requested: location.size,
                stats: stats.clone(),
            },
        );
        Ok(())
    }

    fn fetch_skin(&mut self, entry: &QueueEntry) -> MeshResult<()> {
        let mesh_id = entry.mesh_id;
        let Some(location) = self.locate_blob(mesh_id, BlobKind::Skin)? else {
            self.shared.push_skin_unavailable(mesh_id);
            return Ok(());
        };

        if let Some(buffer) = self.read_cached_region(mesh_id, &location) {
            let shared = self.shared.clone();
            let task: PoolTask = Box::new(move || {
                if shared.is_shutting_down() {
                    return;
                }
                let parsed = shared.parse_skin(mesh_id, &buffer);
                let shared2 = shared.clone();
                shared.post_deferred(Box::new(move || match parsed {
                    Ok(skin) => shared2.skin_parsed(skin),
                    Err(_) => {
                        // Flag said resident but the bytes don't parse.
                        shared2.invalidate_cache(mesh_id);
                        shared2.requeue_after_mismatch(QueueKind::Skin, mesh_id, 0);
                    }
                }));
            });
            if let Err(task) = self.pool.post(task) {
                // Pool is gone (shutdown path); decode inline.
                task();
            }
            return Ok(());
        }

        self.issue_blob_request(HandlerKind::Skin, mesh_id, &location, &entry.stats)
    }

    fn fetch_lod(&mut self, entry: &QueueEntry) -> MeshResult<()> {
        let mesh_id = entry.mesh_id;
        let lod = entry.lod;
        let Some(location) = self.locate_blob(mesh_id, BlobKind::Lod(lod))? else {
            self.shared.push_unavailable(mesh_id, lod);
            return Ok(());
        };

        if let Some(buffer) = self.read_cached_region(mesh_id, &location) {
            let shared = self.shared.clone();
            let task: PoolTask = Box::new(move || {
                if shared.is_shutting_down() {
                    return;
                }
                let decoded = shared.decode_lod(mesh_id, lod, &buffer);
                let shared2 = shared.clone();
                shared.post_deferred(Box::new(move || match decoded {
                    Ok(volume) => {
                        debug!(target: LOG, "LOD {lod} for {mesh_id} served from cache");
                        shared2.push_loaded(LoadedMesh {
                            mesh_id,
                            lod,
                            volume,
                        });
                    }
                    Err(_) => {
                        shared2.invalidate_cache(mesh_id);
                        shared2.requeue_after_mismatch(QueueKind::Lod, mesh_id, lod);
                    }
                }));
            });
            if let Err(task) = self.pool.post(task) {
                task();
            }
            return Ok(());
        }

        self.issue_blob_request(HandlerKind::Lod { lod }, mesh_id, &location, &entry.stats)
    }

    fn fetch_decomposition(&mut self, entry: &QueueEntry) -> MeshResult<()> {
        let mesh_id = entry.mesh_id;
        let Some(location) = self.locate_blob(mesh_id, BlobKind::PhysicsConvex)? else {
            self.shared.push_physics_unavailable(mesh_id);
            return Ok(());
        };

        if location.in_cache
            && self.shared.cache.asset_size(mesh_id) >= location.offset + location.size
        {
            let size = location.size as usize;
            let offset = location.offset;
            let read_ok = {
                let shared = self.shared.clone();
                let scratch = self.disk_scratch(size);
                shared
                    .cache
                    .open(mesh_id, OpenMode::Read)
                    .and_then(|mut f| f.read_at(offset, scratch))
                    .is_ok()
            };
            if read_ok {
                RepoStats::add_u64(&self.shared.stats.cache_bytes_read, location.size);
                RepoStats::bump(&self.shared.stats.cache_reads);
                if region_is_unwritten(&self.disk_buffer[..size]) {
                    self.shared.invalidate_cache(mesh_id);
                } else {
                    match self
                        .shared
                        .parse_decomposition(mesh_id, &self.disk_buffer[..size])
                    {
                        Ok(decomp) => {
                            self.shared.push_decomposition(decomp);
                            return Ok(());
                        }
                        Err(_) => self.shared.invalidate_cache(mesh_id),
                    }
                }
            }
        }

        self.issue_blob_request(
            HandlerKind::Decomposition,
            mesh_id,
            &location,
            &entry.stats,
        )
    }

    fn fetch_physics_shape(&mut self, entry: &QueueEntry) -> MeshResult<()> {
        let mesh_id = entry.mesh_id;
        let Some(location) = self.locate_blob(mesh_id, BlobKind::PhysicsMesh)? else {
            // No physics mesh in the asset at all: report an empty shape
            // so physics stops waiting.
            self.shared.push_decomposition(Decomposition::new(mesh_id));
            return Ok(());
        };

        if location.in_cache
            && self.shared.cache.asset_size(mesh_id) >= location.offset + location.size
        {
            let size = location.size as usize;
            let offset = location.offset;
            let read_ok = {
                let shared = self.shared.clone();
                let scratch = self.disk_scratch(size);
                shared
                    .cache
                    .open(mesh_id, OpenMode::Read)
                    .and_then(|mut f| f.read_at(offset, scratch))
                    .is_ok()
            };
            if read_ok {
                RepoStats::add_u64(&self.shared.stats.cache_bytes_read, location.size);
                RepoStats::bump(&self.shared.stats.cache_reads);
                if region_is_unwritten(&self.disk_buffer[..size]) {
                    self.shared.invalidate_cache(mesh_id);
                } else {
                    match self.shared.decode_lod(mesh_id, 0, &self.disk_buffer[..size]) {
                        Ok(volume) => {
                            let mut decomp = Decomposition::new(mesh_id);
                            decomp.physics_shape_mesh = volume.flatten_positions();
                            self.shared.push_decomposition(decomp);
                            return Ok(());
                        }
                        Err(_) => self.shared.invalidate_cache(mesh_id),
                    }
                }
            }
        }

        self.issue_blob_request(HandlerKind::PhysicsShape, mesh_id, &location, &entry.stats)
    }
}
