//! Shared fixtures for the pipeline integration tests: a scripted
//! transport, a stub volume decoder, canned capability sources, a
//! recording scene object, and asset-building helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mesh_repo::codec::{compress_blob, encode_asset_header};
use mesh_repo::codec::value::encode_map;
use mesh_repo::error::MeshResult;
use mesh_repo::http::{FetchEvent, FetchHandle, FetchSpec, Transport};
use mesh_repo::mesh::{BlobRange, MeshHeader, MeshId, SkinInfo, Volume, VolumeFace};
use mesh_repo::repository::{CapabilitySource, CapabilityUrls, MeshRepository, RepoDependencies};
use mesh_repo::subscriber::{ObjectView, SceneObject};
use mesh_repo::{MeshError, RepoConfig, VolumeDecoder};
use tempfile::TempDir;

pub const CAP_URL: &str = "http://testgrid.example/cap/mesh";

// ---------------------------------------------------------------------------
// Scripted transport

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// 206 with a Content-Range header.
    Normal,
    /// 206 but the Content-Range header is scrubbed.
    NoContentRange,
    /// Always answer with this status and no body.
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub mesh_hex: String,
    pub offset: Option<u64>,
    pub len: Option<u64>,
    pub at: Instant,
}

#[derive(Default)]
pub struct FakeState {
    assets: HashMap<String, Vec<u8>>,
    modes: HashMap<String, ServeMode>,
    pub requests: Vec<RequestRecord>,
    pending: Vec<FetchEvent>,
    next_handle: FetchHandle,
}

/// In-memory mesh server. Responses are produced at submit time and
/// surfaced on the next poll, like a very fast network.
#[derive(Clone, Default)]
pub struct FakeTransport {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn serve(&self, mesh_id: MeshId, asset: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .assets
            .insert(mesh_id.to_hex(), asset);
    }

    pub fn set_mode(&self, mesh_id: MeshId, mode: ServeMode) {
        self.state
            .lock()
            .unwrap()
            .modes
            .insert(mesh_id.to_hex(), mode);
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_for(&self, mesh_id: MeshId) -> Vec<RequestRecord> {
        let hex = mesh_id.to_hex();
        self.requests()
            .into_iter()
            .filter(|r| r.mesh_hex == hex)
            .collect()
    }
}

fn hex_from_url(url: &str) -> String {
    url.rsplit("mesh_id=").next().unwrap_or_default().to_owned()
}

impl Transport for FakeTransport {
    fn submit(&mut self, spec: FetchSpec) -> MeshResult<FetchHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = state.next_handle;

        let hex = hex_from_url(&spec.url);
        let (offset, len) = match spec.range {
            Some(range) => (Some(range.offset), Some(range.len)),
            None => (None, None),
        };
        state.requests.push(RequestRecord {
            mesh_hex: hex.clone(),
            offset,
            len,
            at: Instant::now(),
        });

        let mode = state.modes.get(&hex).copied().unwrap_or(ServeMode::Normal);
        let event = match (mode, state.assets.get(&hex)) {
            (ServeMode::Status(status), _) => FetchEvent {
                handle,
                status,
                error: None,
                body: Vec::new(),
                returned_offset: None,
                retry_after: None,
                transport_retries: 0,
            },
            (_, None) => FetchEvent {
                handle,
                status: 404,
                error: None,
                body: Vec::new(),
                returned_offset: None,
                retry_after: None,
                transport_retries: 0,
            },
            (mode, Some(asset)) => match spec.range {
                Some(range) => {
                    let start = (range.offset as usize).min(asset.len());
                    let end = ((range.offset + range.len) as usize).min(asset.len());
                    FetchEvent {
                        handle,
                        status: 206,
                        error: None,
                        body: asset[start..end].to_vec(),
                        returned_offset: match mode {
                            ServeMode::NoContentRange => None,
                            _ => Some(range.offset),
                        },
                        retry_after: None,
                        transport_retries: 0,
                    }
                }
                None => FetchEvent {
                    handle,
                    status: 200,
                    error: None,
                    body: asset.clone(),
                    returned_offset: None,
                    retry_after: None,
                    transport_retries: 0,
                },
            },
        };
        state.pending.push(event);
        Ok(handle)
    }

    fn poll(&mut self) -> Vec<FetchEvent> {
        std::mem::take(&mut self.state.lock().unwrap().pending)
    }
}

// ---------------------------------------------------------------------------
// Stub geometry decoder

/// LOD body format for tests: first byte is the face count, the rest is
/// padding. A zero or missing count is a decode failure.
pub struct StubVolumeDecoder;

impl VolumeDecoder for StubVolumeDecoder {
    fn decode_volume(&self, mesh_id: MeshId, lod: usize, data: &[u8]) -> MeshResult<Volume> {
        let faces = *data.first().ok_or_else(|| MeshError::Parse("empty".into()))?;
        if faces == 0 {
            return Err(MeshError::Parse("zero face count".into()));
        }
        Ok(Volume {
            mesh_id,
            lod,
            faces: (0..faces)
                .map(|_| VolumeFace {
                    positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                })
                .collect(),
        })
    }
}

pub fn lod_payload(face_count: u8, size: usize) -> Vec<u8> {
    let mut payload = vec![0xabu8; size.max(1)];
    payload[0] = face_count;
    payload
}

pub fn skin_payload(mesh_id: MeshId) -> Vec<u8> {
    let skin = SkinInfo {
        mesh_id,
        joint_names: vec!["mPelvis".into(), "mTorso".into()],
        inverse_bind_matrices: vec![[0.0; 16], [0.0; 16]],
        bind_shape_matrix: None,
        pelvis_offset: 0.0,
    };
    compress_blob(&encode_map(&skin.to_map()))
}

// ---------------------------------------------------------------------------
// Asset assembly

/// Lay a header plus payloads out in the shared wire/disk format. Blob
/// offsets in `header` are header-relative; payloads land accordingly.
pub fn build_asset(header: &MeshHeader, payloads: &[(BlobRange, Vec<u8>)]) -> Vec<u8> {
    let prefix = encode_asset_header(header).expect("encode header");
    let extent = header.payload_extent() as usize;
    let mut asset = prefix;
    let body_start = asset.len();
    asset.resize(body_start + extent, 0);
    for (range, payload) in payloads {
        let start = body_start + range.offset as usize;
        asset[start..start + payload.len()].copy_from_slice(payload);
    }
    asset
}

/// Byte length of the serialized header map for this header.
pub fn header_map_len(header: &MeshHeader) -> u64 {
    encode_asset_header(header).expect("encode header").len() as u64 - 12
}

// ---------------------------------------------------------------------------
// Capability sources and scene objects

pub struct StaticCaps;

impl CapabilitySource for StaticCaps {
    fn revision(&self) -> u64 {
        1
    }
    fn mesh_capability(&self) -> Option<CapabilityUrls> {
        Some(CapabilityUrls {
            modern: Some(CAP_URL.to_owned()),
            legacy: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Loaded { mesh_id: MeshId, lod: usize, faces: usize },
    Unavailable { mesh_id: MeshId, lod: usize, substitute: Option<usize> },
    SkinLoaded(MeshId),
    SkinUnavailable(MeshId),
    PhysicsUnavailable(MeshId),
}

/// Scene object that records every callback and reports a fixed view.
pub struct TestObject {
    pub events: Mutex<Vec<Observed>>,
    pub view: Option<ObjectView>,
}

impl TestObject {
    pub fn with_score(radius: f32, camera_distance: f32) -> Arc<TestObject> {
        Arc::new(TestObject {
            events: Mutex::new(Vec::new()),
            view: Some(ObjectView {
                radius,
                camera_distance,
                rig: None,
            }),
        })
    }

    pub fn new() -> Arc<TestObject> {
        Self::with_score(1.0, 1.0)
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw(&self, wanted: &Observed) -> bool {
        self.events().iter().any(|e| e == wanted)
    }
}

impl SceneObject for TestObject {
    fn on_mesh_loaded(&self, mesh_id: MeshId, volume: &Volume, lod: usize) {
        self.events.lock().unwrap().push(Observed::Loaded {
            mesh_id,
            lod,
            faces: volume.face_count(),
        });
    }

    fn on_mesh_unavailable(&self, mesh_id: MeshId, lod: usize, substitute: Option<usize>) {
        self.events.lock().unwrap().push(Observed::Unavailable {
            mesh_id,
            lod,
            substitute,
        });
    }

    fn on_skin_loaded(&self, skin: &Arc<SkinInfo>) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::SkinLoaded(skin.mesh_id));
    }

    fn on_skin_unavailable(&self, mesh_id: MeshId) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::SkinUnavailable(mesh_id));
    }

    fn on_physics_unavailable(&self, mesh_id: MeshId) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::PhysicsUnavailable(mesh_id));
    }

    fn view(&self) -> Option<ObjectView> {
        self.view
    }
}

pub fn as_scene(obj: &Arc<TestObject>) -> Arc<dyn SceneObject> {
    obj.clone()
}

// ---------------------------------------------------------------------------
// Repository harness

pub fn make_repo(dir: &TempDir, transport: FakeTransport) -> MeshRepository {
    make_repo_with_config(
        dir,
        transport,
        RepoConfig {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        },
    )
}

pub fn make_repo_with_config(
    _dir: &TempDir,
    transport: FakeTransport,
    config: RepoConfig,
) -> MeshRepository {
    MeshRepository::new(
        config,
        RepoDependencies {
            transport: Box::new(transport),
            decoder: Arc::new(StubVolumeDecoder),
            capability_source: Box::new(StaticCaps),
            decomposer: None,
            soft_quit: None,
        },
    )
    .expect("construct repository")
}

/// Tick-and-wait loop: pump the repository until the predicate holds or
/// the timeout expires.
pub fn pump_until(
    repo: &mut MeshRepository,
    timeout: Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        repo.tick();
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Keep pumping for a fixed window (used to assert that something does
/// NOT happen).
pub fn pump_for(repo: &mut MeshRepository, window: Duration) {
    let _ = pump_until(repo, window, || false);
}

/// The cache file path the repository uses for an asset.
pub fn cache_path(dir: &TempDir, mesh_id: MeshId) -> std::path::PathBuf {
    dir.path().join("cache").join(format!("{}.mesh", mesh_id.to_hex()))
}

/// Read the preamble flags word straight off a cache file.
pub fn read_cache_flags(dir: &TempDir, mesh_id: MeshId) -> u32 {
    let bytes = std::fs::read(cache_path(dir, mesh_id)).expect("cache file");
    u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])
}
