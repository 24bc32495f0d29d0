//! End-to-end pipeline tests over a scripted transport, a stub geometry
//! decoder and a real temp-dir cache: header + LOD fetch, inline skins,
//! degenerate range responses, cache corruption recovery, permanent
//! misses, priority ordering and shutdown behavior.

mod common;

use std::time::Duration;

use common::*;
use mesh_repo::constants::cache::{CACHE_PREAMBLE_SIZE, MESH_HEADER_SIZE};
use mesh_repo::mesh::{BlobRange, MeshHeader, MeshId};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

/// Header with one big high LOD (too big for the initial window) and a
/// small medium LOD behind it.
fn two_lod_header() -> MeshHeader {
    let mut header = MeshHeader {
        version: 1,
        ..Default::default()
    };
    header.lods[3] = BlobRange::new(0, 4096);
    header.lods[2] = BlobRange::new(4096, 512);
    header
}

#[test]
fn fresh_header_then_one_lod() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x01);

    let header = two_lod_header();
    let map_len = header_map_len(&header);
    transport.serve(
        id,
        build_asset(
            &header,
            &[
                (header.lods[3], lod_payload(3, 4096)),
                (header.lods[2], lod_payload(5, 512)),
            ],
        ),
    );

    let mut repo = make_repo(&dir, transport.clone());
    let obj = TestObject::new();
    assert_eq!(repo.load_mesh(&as_scene(&obj), id, 2, None), 2);

    assert!(
        pump_until(&mut repo, WAIT, || obj.saw(&Observed::Loaded {
            mesh_id: id,
            lod: 2,
            faces: 5
        })),
        "medium LOD never arrived: {:?}",
        obj.events()
    );

    // First request grabs the standard 4 KiB header window; the second is
    // the byte range for the medium LOD, addressed past preamble+header.
    let requests = transport.requests_for(id);
    assert_eq!(requests[0].offset, Some(0));
    assert_eq!(requests[0].len, Some(MESH_HEADER_SIZE));
    let medium_offset = CACHE_PREAMBLE_SIZE + map_len + 4096;
    assert_eq!(requests[1].offset, Some(medium_offset));
    assert_eq!(requests[1].len, Some(512));

    // The cache file covers the whole reservation and the medium LOD's
    // presence bit (lod[2] -> flag bit 5) is set.
    let file_len = std::fs::metadata(cache_path(&dir, id)).expect("cache file").len();
    assert!(file_len >= medium_offset + 512);
    assert_eq!(read_cache_flags(&dir, id), 1 << 5);

    // With everything delivered the pipeline settles into quiescence.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        repo.tick();
        if repo.is_quiescent() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "pipeline never went quiescent");
        std::thread::sleep(Duration::from_millis(5));
    }

    // A fresh repository over the same cache dir serves the LOD with no
    // further network traffic.
    drop(repo);
    let before = transport.requests().len();
    let mut warm = make_repo(&dir, transport.clone());
    let again = TestObject::new();
    warm.load_mesh(&as_scene(&again), id, 2, None);
    assert!(pump_until(&mut warm, WAIT, || again.saw(&Observed::Loaded {
        mesh_id: id,
        lod: 2,
        faces: 5
    })));
    assert_eq!(transport.requests().len(), before);
}

#[test]
fn skin_inside_initial_window_needs_no_extra_fetch() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x02);

    let skin_bytes = skin_payload(id);
    let mut header = MeshHeader {
        version: 1,
        skin: BlobRange::new(0, skin_bytes.len() as u32),
        ..Default::default()
    };
    header.lods[3] = BlobRange::new(skin_bytes.len() as u32, 600);

    transport.serve(
        id,
        build_asset(
            &header,
            &[
                (header.skin, skin_bytes),
                (header.lods[3], lod_payload(2, 600)),
            ],
        ),
    );

    let mut repo = make_repo(&dir, transport.clone());
    let obj = TestObject::new();
    assert!(repo.get_skin_info(id, Some(&as_scene(&obj))).is_none());
    repo.load_mesh(&as_scene(&obj), id, 3, None);

    assert!(pump_until(&mut repo, WAIT, || {
        obj.saw(&Observed::SkinLoaded(id))
            && obj.saw(&Observed::Loaded {
                mesh_id: id,
                lod: 3,
                faces: 2,
            })
    }));

    // Whole asset fits in the first 4 KiB: exactly one GET, and the skin
    // presence bit is already down on disk.
    let requests = transport.requests_for(id);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].offset, Some(0));
    assert_ne!(read_cache_flags(&dir, id) & 1, 0);

    // Skin now answers synchronously from the main-thread map.
    assert!(repo.get_skin_info(id, None).is_some());
    assert!(repo.has_skin_info(id));
}

#[test]
fn missing_content_range_header_is_tolerated() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x03);

    let header = two_lod_header();
    transport.serve(
        id,
        build_asset(
            &header,
            &[
                (header.lods[3], lod_payload(3, 4096)),
                (header.lods[2], lod_payload(5, 512)),
            ],
        ),
    );
    transport.set_mode(id, ServeMode::NoContentRange);

    let mut repo = make_repo(&dir, transport);
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 2, None);

    // The returned bytes are assumed to be exactly the requested window.
    assert!(pump_until(&mut repo, WAIT, || obj.saw(&Observed::Loaded {
        mesh_id: id,
        lod: 2,
        faces: 5
    })));
}

#[test]
fn corrupted_cache_region_triggers_refetch() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x04);

    let mut header = MeshHeader {
        version: 1,
        ..Default::default()
    };
    header.lods[1] = BlobRange::new(0, 512);
    let map_len = header_map_len(&header);

    // The server has the real asset for the recovery fetch.
    transport.serve(id, build_asset(&header, &[(header.lods[1], lod_payload(4, 512))]));

    // Seed the cache with a file whose preamble claims lod[1] is resident
    // while its region is still all zeros (crashed between writes).
    let mut poisoned = header.clone();
    poisoned.lod_in_cache[1] = true;
    let seeded = build_asset(&poisoned, &[]);
    std::fs::create_dir_all(dir.path().join("cache")).expect("cache dir");
    std::fs::write(cache_path(&dir, id), &seeded).expect("seed cache");
    assert_eq!(read_cache_flags(&dir, id), 1 << 4);

    let mut repo = make_repo(&dir, transport.clone());
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 1, None);

    assert!(pump_until(&mut repo, WAIT, || obj.saw(&Observed::Loaded {
        mesh_id: id,
        lod: 1,
        faces: 4
    })));

    // The header came from the cache; the only network traffic is the
    // refetched LOD region.
    let requests = transport.requests_for(id);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].offset, Some(CACHE_PREAMBLE_SIZE + map_len));

    // Flags were wiped and only the genuinely rewritten blob came back.
    assert_eq!(read_cache_flags(&dir, id), 1 << 4);
    let bytes = std::fs::read(cache_path(&dir, id)).expect("cache file");
    let region = (CACHE_PREAMBLE_SIZE + map_len) as usize;
    assert_eq!(bytes[region], 4);
}

#[test]
fn header_404_retries_on_a_doubling_schedule() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x05);
    transport.set_mode(id, ServeMode::Status(404));

    let mut repo = make_repo(&dir, transport.clone());
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 2, None);

    // Attempts land at roughly t=0, 0.5s, 1.5s; watch the first three.
    pump_for(&mut repo, Duration::from_millis(2400));
    let requests = transport.requests_for(id);
    assert!(
        (2..=4).contains(&requests.len()),
        "unexpected retry count {}",
        requests.len()
    );
    let gap1 = requests[1].at - requests[0].at;
    assert!(gap1 >= Duration::from_millis(450), "first retry came at {gap1:?}");
    if let Some(third) = requests.get(2) {
        let gap2 = third.at - requests[1].at;
        assert!(gap2 >= Duration::from_millis(950), "second retry came at {gap2:?}");
    }

    // Retries are still in flight: no unavailable verdict yet.
    assert!(obj.events().is_empty());
}

#[test]
fn unparseable_header_is_a_permanent_miss() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x06);

    // Served bytes that are not a mesh asset at all.
    transport.serve(id, vec![0x5a; 2048]);

    let mut repo = make_repo(&dir, transport.clone());
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 2, None);

    assert!(pump_until(&mut repo, WAIT, || obj.saw(&Observed::Unavailable {
        mesh_id: id,
        lod: 2,
        substitute: None
    })));
    assert!(repo.has_header(id));
    assert_eq!(repo.get_mesh_size(id, 2), -1);

    // The miss is sticky: a new interest resolves unavailable without
    // another fetch.
    let fetches_so_far = transport.requests_for(id).len();
    let again = TestObject::new();
    repo.load_mesh(&as_scene(&again), id, 1, None);
    assert!(pump_until(&mut repo, WAIT, || again.saw(&Observed::Unavailable {
        mesh_id: id,
        lod: 1,
        substitute: None
    })));
    assert_eq!(transport.requests_for(id).len(), fetches_so_far);
}

#[test]
fn higher_scored_requests_are_forwarded_first() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id_bg = MeshId::from_u64(0x10);
    let id_fg = MeshId::from_u64(0x11);

    for id in [id_bg, id_fg] {
        let mut header = MeshHeader {
            version: 1,
            ..Default::default()
        };
        header.lods[2] = BlobRange::new(0, 256);
        transport.serve(id, build_asset(&header, &[(header.lods[2], lod_payload(1, 256))]));
    }

    let mut repo = make_repo(&dir, transport.clone());
    // Register the far background mesh first; the close-up one must still
    // reach the wire first.
    let bg = TestObject::with_score(1.0, 100.0);
    let fg = TestObject::with_score(0.9, 1.0);
    repo.load_mesh(&as_scene(&bg), id_bg, 2, None);
    repo.load_mesh(&as_scene(&fg), id_fg, 2, None);

    assert!(pump_until(&mut repo, WAIT, || {
        fg.saw(&Observed::Loaded { mesh_id: id_fg, lod: 2, faces: 1 })
            && bg.saw(&Observed::Loaded { mesh_id: id_bg, lod: 2, faces: 1 })
    }));

    let order: Vec<String> = transport
        .requests()
        .iter()
        .map(|r| r.mesh_hex.clone())
        .collect();
    let first_fg = order.iter().position(|h| *h == id_fg.to_hex()).expect("fg fetched");
    let first_bg = order.iter().position(|h| *h == id_bg.to_hex()).expect("bg fetched");
    assert!(
        first_fg < first_bg,
        "foreground mesh was not fetched first: {order:?}"
    );
}

#[test]
fn dropped_subscribers_cancel_pending_requests() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id_dead = MeshId::from_u64(0x12);
    let id_live = MeshId::from_u64(0x13);

    for id in [id_dead, id_live] {
        let mut header = MeshHeader {
            version: 1,
            ..Default::default()
        };
        header.lods[0] = BlobRange::new(0, 128);
        transport.serve(id, build_asset(&header, &[(header.lods[0], lod_payload(1, 128))]));
    }

    let mut repo = make_repo(&dir, transport.clone());
    let doomed = TestObject::new();
    let live = TestObject::new();
    repo.load_mesh(&as_scene(&doomed), id_dead, 0, None);
    repo.load_mesh(&as_scene(&live), id_live, 0, None);
    drop(doomed);

    assert!(pump_until(&mut repo, WAIT, || live.saw(&Observed::Loaded {
        mesh_id: id_live,
        lod: 0,
        faces: 1
    })));

    // The dead request was dropped before it reached the wire and no
    // unavailable result was fabricated for it.
    assert!(transport.requests_for(id_dead).is_empty());
}

#[test]
fn whole_asset_fetch_when_range_requests_disabled() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x14);

    let header = two_lod_header();
    transport.serve(
        id,
        build_asset(
            &header,
            &[
                (header.lods[3], lod_payload(3, 4096)),
                (header.lods[2], lod_payload(5, 512)),
            ],
        ),
    );

    let mut repo = make_repo_with_config(
        &dir,
        transport.clone(),
        mesh_repo::RepoConfig {
            cache_dir: dir.path().join("cache"),
            disable_range_requests: true,
            ..Default::default()
        },
    );
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 2, None);

    assert!(pump_until(&mut repo, WAIT, || obj.saw(&Observed::Loaded {
        mesh_id: id,
        lod: 2,
        faces: 5
    })));
    // Every request went out rangeless and the handlers sliced locally.
    assert!(transport.requests_for(id).iter().all(|r| r.offset.is_none()));
}

#[test]
fn physics_shape_unavailable_reaches_subscribers() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x15);

    // Asset declares a physics mesh region full of zero-count garbage the
    // decoder rejects.
    let mut header = MeshHeader {
        version: 1,
        physics_mesh: BlobRange::new(0, 256),
        ..Default::default()
    };
    header.lods[0] = BlobRange::new(256, 128);
    transport.serve(
        id,
        build_asset(
            &header,
            &[
                (header.physics_mesh, lod_payload(0, 256)),
                (header.lods[0], lod_payload(1, 128)),
            ],
        ),
    );

    let mut repo = make_repo(&dir, transport);
    let obj = TestObject::new();
    // Header comes in via the LOD path, then the physics fetch can run.
    repo.load_mesh(&as_scene(&obj), id, 0, None);
    repo.fetch_physics_shape(id, Some(&as_scene(&obj)));

    assert!(pump_until(&mut repo, WAIT, || obj
        .saw(&Observed::PhysicsUnavailable(id))));
}

#[test]
fn shutdown_stops_all_callbacks() {
    let dir = TempDir::new().expect("tempdir");
    let transport = FakeTransport::default();
    let id = MeshId::from_u64(0x16);

    let mut header = MeshHeader {
        version: 1,
        ..Default::default()
    };
    header.lods[0] = BlobRange::new(0, 128);
    transport.serve(id, build_asset(&header, &[(header.lods[0], lod_payload(1, 128))]));

    let mut repo = make_repo(&dir, transport);
    let obj = TestObject::new();
    repo.load_mesh(&as_scene(&obj), id, 0, None);
    repo.tick();
    repo.shutdown();

    // Whatever the worker managed to complete stays queued; nothing is
    // delivered once the repository is down.
    std::thread::sleep(Duration::from_millis(200));
    for _ in 0..10 {
        repo.tick();
    }
    assert!(obj.events().is_empty());
}
