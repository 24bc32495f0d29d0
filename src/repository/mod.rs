//! The repository facade: the main-thread API over the fetch/cache/
//! dispatch pipeline.
//!
//! Everything here is called from the render/UI thread and must never
//! stall it: `tick()` takes every worker-shared lock with a try-lock and
//! simply comes back next frame when the worker is busy. Subscriber
//! callbacks fire from `tick()` only, in result-queue order.

pub mod decomposer;
pub(crate) mod handlers;
pub mod pending;
pub(crate) mod pool;
pub(crate) mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use log::{info, warn};

use crate::cache::MeshCache;
use crate::constants::facade::SKIN_CULL_INTERVAL;
use crate::constants::format::NUM_LODS;
use crate::constants::worker::PROCESSING_POOL_SIZE;
use crate::error::MeshResult;
use crate::http::{HttpFetcher, Transport};
use crate::mesh::{Decomposition, MeshId, SkinInfo, VolumeDecoder};
use crate::stats::{RepoStats, StatsSnapshot};
use crate::subscriber::SceneObject;
use crate::RepoConfig;

use decomposer::{ConvexDecomposer, DecompositionService, HullRequest};
use pending::{tracked_from, PendingKind, PendingRequest, TrackedObjects};
use pool::ProcessingPool;
use worker::{MeshWorker, QueueKind, ResultQueues, WorkerShared};

pub use worker::CapabilityUrls;

const LOG: &str = "mesh::repo";

/// Where the facade learns the region's mesh download URLs. Re-read on
/// tick whenever `revision` changes (a region crossing, typically).
pub trait CapabilitySource {
    fn revision(&self) -> u64;
    fn mesh_capability(&self) -> Option<CapabilityUrls>;
}

/// External collaborators handed to [`MeshRepository::new`].
pub struct RepoDependencies {
    pub transport: Box<dyn Transport>,
    pub decoder: Arc<dyn VolumeDecoder>,
    pub capability_source: Box<dyn CapabilitySource>,
    /// Optional hull-building worker; without one, `build_hull` is a no-op.
    pub decomposer: Option<Box<dyn ConvexDecomposer>>,
    /// Raised when a normal-sized allocation fails (real memory pressure).
    pub soft_quit: Option<Box<dyn Fn() + Send + Sync>>,
}

struct LoadingEntry {
    subscribers: TrackedObjects,
}

impl LoadingEntry {
    fn new(subscribers: TrackedObjects) -> Self {
        Self { subscribers }
    }

    fn add(&self, obj: &Arc<dyn SceneObject>) {
        let mut subs = self.subscribers.borrow_mut();
        let new = Arc::downgrade(obj);
        if !subs.iter().any(|w| Weak::ptr_eq(w, &new)) {
            subs.push(new);
        }
    }

    fn notify<F: Fn(&Arc<dyn SceneObject>)>(&self, f: F) {
        for weak in self.subscribers.borrow().iter() {
            if let Some(obj) = weak.upgrade() {
                f(&obj);
            }
        }
    }
}

/// Client-side mesh asset repository. One long-lived value per app,
/// constructed at startup and shut down at exit.
pub struct MeshRepository {
    config: RepoConfig,
    shared: Arc<WorkerShared>,
    pool: Arc<ProcessingPool>,
    stats: Arc<RepoStats>,
    shutting_down: Arc<AtomicBool>,
    worker_thread: Option<thread::JoinHandle<()>>,

    capability_source: Box<dyn CapabilitySource>,
    capability_revision: Option<u64>,
    decomposition_service: Option<DecompositionService>,

    // Main-thread state. Loading-table invariant: an id is present iff a
    // fetch of that kind is pending or in flight, and at most one pending
    // request references it.
    loading_meshes: [HashMap<MeshId, LoadingEntry>; NUM_LODS],
    loading_skins: HashMap<MeshId, LoadingEntry>,
    loading_decompositions: HashMap<MeshId, LoadingEntry>,
    loading_physics: HashMap<MeshId, LoadingEntry>,
    pending_requests: Vec<PendingRequest>,
    pending_decomposition_fifo: VecDeque<MeshId>,
    pending_physics_fifo: VecDeque<MeshId>,

    skin_map: HashMap<MeshId, Arc<SkinInfo>>,
    decomposition_map: HashMap<MeshId, Arc<Decomposition>>,
    /// LODs this repository has delivered this session, per mesh; the
    /// "best currently displayable" answer in `load_mesh` comes from here.
    delivered_lods: HashMap<MeshId, [bool; NUM_LODS]>,

    skin_cull_at: Instant,
    holdoffs: u32,
    shut_down: bool,
}

impl MeshRepository {
    pub fn new(config: RepoConfig, deps: RepoDependencies) -> MeshResult<Self> {
        let config = config.sanitized();
        let stats = Arc::new(RepoStats::default());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let cache = MeshCache::new(&config.cache_dir, config.max_cache_asset_size)?;
        let shared = Arc::new(WorkerShared::new(
            cache,
            deps.decoder,
            stats.clone(),
            shutting_down.clone(),
            deps.soft_quit,
            config.use_retry_after,
        ));
        shared
            .prefer_legacy
            .store(config.prefer_legacy_transport, Ordering::Relaxed);

        let pool = Arc::new(ProcessingPool::new(
            PROCESSING_POOL_SIZE,
            shutting_down.clone(),
        ));
        let fetcher = HttpFetcher::new(
            deps.transport,
            config.disable_range_requests,
            stats.clone(),
        );

        let worker = MeshWorker::new(shared.clone(), fetcher, pool.clone());
        let worker_thread = thread::Builder::new()
            .name("mesh-repo".into())
            .spawn(move || worker.run())?;

        let decomposition_service = deps.decomposer.map(DecompositionService::spawn);

        Ok(Self {
            config,
            shared,
            pool,
            stats,
            shutting_down,
            worker_thread: Some(worker_thread),
            capability_source: deps.capability_source,
            capability_revision: None,
            decomposition_service,
            loading_meshes: Default::default(),
            loading_skins: HashMap::new(),
            loading_decompositions: HashMap::new(),
            loading_physics: HashMap::new(),
            pending_requests: Vec::new(),
            pending_decomposition_fifo: VecDeque::new(),
            pending_physics_fifo: VecDeque::new(),
            skin_map: HashMap::new(),
            decomposition_map: HashMap::new(),
            delivered_lods: HashMap::new(),
            skin_cull_at: Instant::now() + SKIN_CULL_INTERVAL,
            holdoffs: 0,
            shut_down: false,
        })
    }

    // -- registration API ---------------------------------------------------

    /// Register interest in one LOD of a mesh. Returns the best LOD this
    /// repository can already display for it: `last_lod` if that was
    /// delivered (avoids downward pops), else the nearest delivered lower
    /// level, else the nearest delivered higher one, else `new_lod`.
    pub fn load_mesh(
        &mut self,
        obj: &Arc<dyn SceneObject>,
        mesh_id: MeshId,
        new_lod: usize,
        last_lod: Option<usize>,
    ) -> usize {
        if self.shut_down || new_lod >= NUM_LODS {
            return new_lod;
        }

        match self.loading_meshes[new_lod].get(&mesh_id) {
            Some(entry) => entry.add(obj),
            None => {
                let tracked = tracked_from(obj);
                self.loading_meshes[new_lod]
                    .insert(mesh_id, LoadingEntry::new(tracked.clone()));
                self.pending_requests.push(PendingRequest::new(
                    PendingKind::Lod {
                        mesh_id,
                        lod: new_lod,
                    },
                    tracked,
                ));
                RepoStats::bump(&self.stats.lod_pending);
            }
        }

        let marks = self
            .delivered_lods
            .get(&mesh_id)
            .copied()
            .unwrap_or([false; NUM_LODS]);
        if let Some(last) = last_lod {
            if last < NUM_LODS && marks[last] {
                return last;
            }
        }
        for lod in (0..new_lod).rev() {
            if marks[lod] {
                return lod;
            }
        }
        for lod in new_lod + 1..NUM_LODS {
            if marks[lod] {
                return lod;
            }
        }
        new_lod
    }

    /// Cached skin info, or None. With a requester, a miss also queues a
    /// skin fetch and the requester gets `on_skin_loaded`/`_unavailable`.
    pub fn get_skin_info(
        &mut self,
        mesh_id: MeshId,
        requester: Option<&Arc<dyn SceneObject>>,
    ) -> Option<Arc<SkinInfo>> {
        if mesh_id.is_null() {
            return None;
        }
        if let Some(skin) = self.skin_map.get(&mesh_id) {
            return Some(skin.clone());
        }
        if self.shut_down {
            return None;
        }

        if let Some(obj) = requester {
            match self.loading_skins.get(&mesh_id) {
                Some(entry) => entry.add(obj),
                None => {
                    let tracked = tracked_from(obj);
                    self.loading_skins
                        .insert(mesh_id, LoadingEntry::new(tracked.clone()));
                    self.pending_requests
                        .push(PendingRequest::new(PendingKind::Skin { mesh_id }, tracked));
                }
            }
        }
        None
    }

    /// Cached decomposition, or None. A miss (or a hull-less entry)
    /// queues a decomposition fetch.
    pub fn get_decomposition(&mut self, mesh_id: MeshId) -> Option<Arc<Decomposition>> {
        if mesh_id.is_null() {
            return None;
        }
        let ret = self.decomposition_map.get(&mesh_id).cloned();

        let wanted = match &ret {
            Some(d) => !d.has_base_hull(),
            None => true,
        };
        if wanted && !self.shut_down && !self.loading_decompositions.contains_key(&mesh_id) {
            self.loading_decompositions
                .insert(mesh_id, LoadingEntry::new(tracked_from_empty()));
            self.pending_decomposition_fifo.push_back(mesh_id);
        }
        ret
    }

    /// Idempotent physics-shape fetch. The optional requester receives
    /// `on_physics_unavailable` if the fetch permanently fails.
    pub fn fetch_physics_shape(
        &mut self,
        mesh_id: MeshId,
        requester: Option<&Arc<dyn SceneObject>>,
    ) {
        if mesh_id.is_null() || self.shut_down {
            return;
        }
        if let Some(d) = self.decomposition_map.get(&mesh_id) {
            if d.has_physics_shape() {
                return;
            }
        }
        match self.loading_physics.get(&mesh_id) {
            Some(entry) => {
                if let Some(obj) = requester {
                    entry.add(obj);
                }
            }
            None => {
                let tracked = match requester {
                    Some(obj) => tracked_from(obj),
                    None => tracked_from_empty(),
                };
                self.loading_physics
                    .insert(mesh_id, LoadingEntry::new(tracked));
                self.pending_physics_fifo.push_back(mesh_id);
            }
        }
    }

    /// Submit a hull-build job to the decomposition worker, if one was
    /// provided. Results surface through `get_decomposition` after a tick.
    pub fn build_hull(&self, request: HullRequest) {
        match &self.decomposition_service {
            Some(service) => service.submit(request),
            None => warn!(target: LOG, "build_hull with no decomposition worker configured"),
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn has_header(&self, mesh_id: MeshId) -> bool {
        !mesh_id.is_null() && self.shared.has_header(mesh_id)
    }

    pub fn has_skin_info(&self, mesh_id: MeshId) -> bool {
        if mesh_id.is_null() {
            return false;
        }
        if self.skin_map.contains_key(&mesh_id) {
            return true;
        }
        let headers = self.shared.headers.read();
        headers
            .get(&mesh_id)
            .is_some_and(|h| h.header_size > 0 && h.skin.is_declared())
    }

    pub fn has_physics_shape(&self, mesh_id: MeshId) -> bool {
        if mesh_id.is_null() {
            return false;
        }
        {
            let headers = self.shared.headers.read();
            if headers
                .get(&mesh_id)
                .is_some_and(|h| h.header_size > 0 && h.physics_mesh.is_declared())
            {
                return true;
            }
        }
        self.decomposition_map
            .get(&mesh_id)
            .is_some_and(|d| d.has_hulls() || d.has_base_hull() || d.has_physics_shape())
    }

    /// Byte size of one LOD, or -1 when unknown or the mesh is a 404.
    pub fn get_mesh_size(&self, mesh_id: MeshId, lod: usize) -> i32 {
        if mesh_id.is_null() || lod >= NUM_LODS {
            return -1;
        }
        let headers = self.shared.headers.read();
        match headers.get(&mesh_id) {
            Some(h) if h.header_size > 0 && !h.not_found => {
                let range = h.lods[lod];
                if range.is_declared() {
                    range.size as i32
                } else {
                    -1
                }
            }
            _ => -1,
        }
    }

    pub fn get_creator(&self, mesh_id: MeshId) -> Option<MeshId> {
        let headers = self.shared.headers.read();
        headers.get(&mesh_id).and_then(|h| h.creator)
    }

    /// All queues drained and nothing in flight. The metrics subsystem
    /// uses this to mark "scene loaded".
    pub fn is_quiescent(&self) -> bool {
        if !self.pending_requests.is_empty()
            || !self.pending_decomposition_fifo.is_empty()
            || !self.pending_physics_fifo.is_empty()
        {
            return false;
        }
        let Some(queues) = self.shared.queues.try_lock() else {
            return false;
        };
        let Some(in_flight) = self.shared.in_flight.try_lock() else {
            return false;
        };
        let Some(results) = self.shared.results.try_lock() else {
            return false;
        };
        queues.is_empty() && in_flight.is_empty() && results.is_empty()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop a scene object from every subscriber list. Pending requests
    /// whose tracked set empties out are discarded on the next tick.
    pub fn unregister_mesh(&mut self, obj: &Arc<dyn SceneObject>) {
        let target = Arc::downgrade(obj);
        let strip = |entry: &LoadingEntry| {
            entry
                .subscribers
                .borrow_mut()
                .retain(|w| !Weak::ptr_eq(w, &target));
        };
        for table in &self.loading_meshes {
            table.values().for_each(strip);
        }
        self.loading_skins.values().for_each(strip);
        self.loading_decompositions.values().for_each(strip);
        self.loading_physics.values().for_each(strip);
    }

    // -- per-frame pump ------------------------------------------------------

    /// Main-thread frame tick: drain completions, refresh capabilities,
    /// forward the best-scored pending requests, and wake the worker.
    /// Never blocks; when any worker lock is contended it counts a
    /// holdoff and retries next frame.
    pub fn tick(&mut self) {
        if self.shut_down {
            return;
        }

        // Try-lock discipline for every worker-shared structure we need.
        let shared = self.shared.clone();
        let drained = {
            let Some(mut results) = shared.results.try_lock() else {
                return self.holdoff();
            };
            let Some(mut queues) = shared.queues.try_lock() else {
                return self.holdoff();
            };
            let Some(in_flight) = shared.in_flight.try_lock() else {
                return self.holdoff();
            };
            let Some(headers) = shared.headers.try_read() else {
                return self.holdoff();
            };
            let Some(mut pending_lods) = shared.pending_lods.try_lock() else {
                return self.holdoff();
            };
            self.holdoffs = 0;

            let drained = results.take_all();
            drop(results);

            self.refresh_capabilities();

            let high_water = self.config.high_water_mark();
            self.shared
                .high_water
                .store(high_water, Ordering::Relaxed);

            // Score, sort and forward into the worker queues, keeping the
            // total of queued + in-flight under the high-water mark.
            let active = in_flight.len() + queues.backlog();
            if active < high_water {
                let mut push_count = high_water - active;

                let mut dead: Vec<PendingKind> = Vec::new();
                self.pending_requests.retain_mut(|req| {
                    if req.update_score() {
                        true
                    } else {
                        dead.push(req.kind);
                        false
                    }
                });
                for kind in dead {
                    self.drop_loading_entry(kind);
                }

                if self.pending_requests.len() > 1 {
                    // Stable sort keeps insertion order among equal scores.
                    self.pending_requests.sort_by(|a, b| {
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                }

                while push_count > 0 && !self.pending_requests.is_empty() {
                    let req = self.pending_requests.remove(0);
                    match req.kind {
                        PendingKind::Lod { mesh_id, lod } => {
                            self.shared.load_lod_locked(
                                &mut queues,
                                &mut pending_lods,
                                &headers,
                                mesh_id,
                                lod,
                            );
                            self.stats.lod_pending.fetch_sub(1, Ordering::Relaxed);
                        }
                        PendingKind::Skin { mesh_id } => {
                            self.shared
                                .enqueue_skin_locked(&mut queues, &in_flight, mesh_id);
                        }
                    }
                    push_count -= 1;
                }
            }

            // Physics FIFOs are small and unscored; forward everything.
            while let Some(mesh_id) = self.pending_decomposition_fifo.pop_front() {
                self.shared.enqueue_blob_locked(
                    &mut queues,
                    &in_flight,
                    QueueKind::Decomposition,
                    mesh_id,
                );
            }
            while let Some(mesh_id) = self.pending_physics_fifo.pop_front() {
                self.shared.enqueue_blob_locked(
                    &mut queues,
                    &in_flight,
                    QueueKind::PhysicsShape,
                    mesh_id,
                );
            }

            drained
        };

        // Locks are released; deliver callbacks and run timers.
        if let Some(service) = &self.decomposition_service {
            for decomposition in service.poll() {
                self.integrate_decomposition(decomposition);
            }
        }
        self.dispatch(drained);

        if Instant::now() >= self.skin_cull_at {
            self.cull_skins();
            self.skin_cull_at = Instant::now() + SKIN_CULL_INTERVAL;
        }

        self.shared.signal();
    }

    fn holdoff(&mut self) {
        self.holdoffs += 1;
        RepoStats::raise_max(&self.stats.max_lock_holdoffs, self.holdoffs);
        if self.holdoffs == 5 {
            warn!(target: LOG, "high mesh thread holdoff");
        }
    }

    fn refresh_capabilities(&mut self) {
        let revision = self.capability_source.revision();
        if self.capability_revision == Some(revision) {
            return;
        }
        // The caps mutex is worker-shared: try-lock like everything else.
        let Some(mut caps) = self.shared.caps.try_lock() else {
            return;
        };
        let urls = self.capability_source.mesh_capability().unwrap_or_default();
        if urls.modern.is_none() && urls.legacy.is_none() {
            info!(target: LOG, "region has no mesh capability; cannot load meshes");
        }
        *caps = urls;
        self.capability_revision = Some(revision);
    }

    fn drop_loading_entry(&mut self, kind: PendingKind) {
        match kind {
            PendingKind::Lod { mesh_id, lod } => {
                self.loading_meshes[lod].remove(&mesh_id);
                self.stats.lod_pending.fetch_sub(1, Ordering::Relaxed);
            }
            PendingKind::Skin { mesh_id } => {
                self.loading_skins.remove(&mesh_id);
            }
        }
    }

    fn dispatch(&mut self, drained: ResultQueues) {
        for loaded in drained.loaded {
            let marks = self
                .delivered_lods
                .entry(loaded.mesh_id)
                .or_insert([false; NUM_LODS]);
            marks[loaded.lod] = true;

            if let Some(entry) = self.loading_meshes[loaded.lod].remove(&loaded.mesh_id) {
                entry.notify(|obj| obj.on_mesh_loaded(loaded.mesh_id, &loaded.volume, loaded.lod));
            }
        }

        for (mesh_id, lod) in drained.unavailable {
            let substitute = self
                .shared
                .headers
                .try_read()
                .and_then(|headers| headers.get(&mesh_id).and_then(|h| h.substitute_lod(lod)));
            if let Some(entry) = self.loading_meshes[lod].remove(&mesh_id) {
                entry.notify(|obj| obj.on_mesh_unavailable(mesh_id, lod, substitute));
            }
        }

        for skin in drained.skin_ready {
            RepoStats::add_u64(&self.stats.cache_bytes_skins, skin.size_bytes() as u64);
            self.skin_map.insert(skin.mesh_id, skin.clone());
            if let Some(entry) = self.loading_skins.remove(&skin.mesh_id) {
                entry.notify(|obj| obj.on_skin_loaded(&skin));
            }
        }

        for mesh_id in drained.skin_unavailable {
            if let Some(entry) = self.loading_skins.remove(&mesh_id) {
                entry.notify(|obj| obj.on_skin_unavailable(mesh_id));
            }
        }

        for decomposition in drained.decomposition_ready {
            self.integrate_decomposition(decomposition);
        }

        for mesh_id in drained.physics_unavailable {
            if let Some(entry) = self.loading_decompositions.remove(&mesh_id) {
                entry.notify(|obj| obj.on_physics_unavailable(mesh_id));
            }
            if let Some(entry) = self.loading_physics.remove(&mesh_id) {
                entry.notify(|obj| obj.on_physics_unavailable(mesh_id));
            }
        }
    }

    /// Fold an arriving decomposition half into the cached entry and
    /// settle the matching loading-table entries.
    fn integrate_decomposition(&mut self, decomposition: Decomposition) {
        let mesh_id = decomposition.mesh_id;
        let convex_half = decomposition.has_hulls() || decomposition.has_base_hull();
        let shape_half = !convex_half || decomposition.has_physics_shape();

        let stats = self.stats.clone();
        match self.decomposition_map.get_mut(&mesh_id) {
            Some(existing) => {
                let before = existing.size_bytes() as u64;
                let merged = Arc::make_mut(existing);
                merged.merge(decomposition);
                RepoStats::add_u64(
                    &stats.cache_bytes_decomps,
                    (merged.size_bytes() as u64).saturating_sub(before),
                );
            }
            None => {
                RepoStats::add_u64(
                    &stats.cache_bytes_decomps,
                    decomposition.size_bytes() as u64,
                );
                self.decomposition_map
                    .insert(mesh_id, Arc::new(decomposition));
            }
        }

        if convex_half {
            self.loading_decompositions.remove(&mesh_id);
        }
        if shape_half {
            self.loading_physics.remove(&mesh_id);
        }
    }

    /// Drop skin entries nobody references any more, and trim the worker
    /// copy through a posted closure so the render path never contends.
    fn cull_skins(&mut self) {
        let shared = self.shared.clone();
        self.skin_map.retain(|mesh_id, skin| {
            if Arc::strong_count(skin) > 1 {
                return true;
            }
            let mesh_id = *mesh_id;
            let worker_shared = shared.clone();
            shared.post_deferred(Box::new(move || {
                worker_shared.skin_map.lock().remove(&mesh_id);
            }));
            false
        });
    }

    /// Cooperative shutdown: stop the worker, drain the pool (tasks free
    /// their buffers unprocessed), and stop delivering callbacks.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(target: LOG, "shutting down mesh repository");

        self.shutting_down.store(true, Ordering::Release);
        self.shared.signal();
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                warn!(target: LOG, "mesh repo worker panicked during shutdown");
            }
        }
        self.pool.close();
        self.decomposition_service = None;
    }
}

impl Drop for MeshRepository {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tracked_from_empty() -> TrackedObjects {
    std::rc::Rc::new(std::cell::RefCell::new(Vec::new()))
}
