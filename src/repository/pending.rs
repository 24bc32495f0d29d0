//! Main-thread pending-request list entries, scoring, and per-request
//! retry bookkeeping shared with the worker queues.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Weak;
use std::time::{Duration, Instant};

use crate::constants::retry::{DOWNLOAD_RETRY_DELAY, DOWNLOAD_RETRY_LIMIT};
use crate::mesh::MeshId;
use crate::subscriber::{calculate_score, SceneObject};

/// Retry/backoff state carried by every queued fetch. The k-th retry waits
/// at least `DOWNLOAD_RETRY_DELAY * 2^k`; a server-supplied Retry-After can
/// only push the deadline further out.
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    retries: u32,
    next_attempt: Option<Instant>,
}

impl RequestStats {
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn can_retry(&self) -> bool {
        self.retries < DOWNLOAD_RETRY_LIMIT
    }

    /// Still inside the backoff window?
    pub fn is_delayed(&self) -> bool {
        self.next_attempt.is_some_and(|at| Instant::now() < at)
    }

    /// Record a failure: bump the retry count and arm the timer.
    pub fn update_time(&mut self, retry_after: Option<Duration>) {
        let backoff = DOWNLOAD_RETRY_DELAY * (1u32 << self.retries);
        let delay = match retry_after {
            Some(server) => server.max(backoff),
            None => backoff,
        };
        self.retries += 1;
        self.next_attempt = Some(Instant::now() + delay);
    }

    /// The currently armed deadline, for tests and diagnostics.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }
}

/// Subscriber list shared between a loading-table entry and the pending
/// request that covers it; `unregister_mesh` edits the one list both see.
pub type TrackedObjects = Rc<RefCell<Vec<Weak<dyn SceneObject>>>>;

pub fn tracked_from(obj: &std::sync::Arc<dyn SceneObject>) -> TrackedObjects {
    Rc::new(RefCell::new(vec![std::sync::Arc::downgrade(obj)]))
}

/// What a pending main-thread request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    Lod { mesh_id: MeshId, lod: usize },
    Skin { mesh_id: MeshId },
}

impl PendingKind {
    pub fn mesh_id(&self) -> MeshId {
        match self {
            PendingKind::Lod { mesh_id, .. } | PendingKind::Skin { mesh_id } => *mesh_id,
        }
    }
}

/// One entry in the facade's score-ordered pending list. Tracked objects
/// are weak; whoever is gone at scoring time contributes zero.
pub struct PendingRequest {
    pub kind: PendingKind,
    pub tracked: TrackedObjects,
    pub score: f32,
}

impl PendingRequest {
    pub fn new(kind: PendingKind, tracked: TrackedObjects) -> Self {
        Self {
            kind,
            tracked,
            score: 0.0,
        }
    }

    /// Recompute the score as the max over live tracked objects. Returns
    /// false when every tracked object is gone, which drops the request
    /// without an unavailable result.
    pub fn update_score(&mut self) -> bool {
        self.score = 0.0;
        let mut any_alive = false;
        self.tracked.borrow_mut().retain(|weak| {
            let Some(obj) = weak.upgrade() else {
                return false;
            };
            any_alive = true;
            if let Some(view) = obj.view() {
                let score = calculate_score(&view);
                if score > 0.0 {
                    self.score = self.score.max(score);
                }
            }
            true
        });
        any_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{SkinInfo, Volume};
    use crate::subscriber::ObjectView;
    use std::sync::Arc;

    struct FixedView(Option<ObjectView>);

    impl SceneObject for FixedView {
        fn on_mesh_loaded(&self, _: MeshId, _: &Volume, _: usize) {}
        fn on_mesh_unavailable(&self, _: MeshId, _: usize, _: Option<usize>) {}
        fn on_skin_loaded(&self, _: &Arc<SkinInfo>) {}
        fn on_skin_unavailable(&self, _: MeshId) {}
        fn on_physics_unavailable(&self, _: MeshId) {}
        fn view(&self) -> Option<ObjectView> {
            self.0
        }
    }

    fn obj(radius: f32, distance: f32) -> Arc<dyn SceneObject> {
        Arc::new(FixedView(Some(ObjectView {
            radius,
            camera_distance: distance,
            rig: None,
        })))
    }

    #[test]
    fn backoff_schedule_doubles() {
        let mut stats = RequestStats::default();
        let mut expected = DOWNLOAD_RETRY_DELAY;
        for k in 0..DOWNLOAD_RETRY_LIMIT {
            assert!(stats.can_retry(), "retry {k} should be allowed");
            let before = Instant::now();
            stats.update_time(None);
            let deadline = stats.next_attempt().expect("armed");
            assert!(deadline >= before + expected);
            // Next round waits twice as long.
            expected *= 2;
        }
        assert!(!stats.can_retry());
    }

    #[test]
    fn retry_after_only_extends_the_wait() {
        let mut stats = RequestStats::default();
        stats.update_time(Some(Duration::from_secs(30)));
        let deadline = stats.next_attempt().expect("armed");
        assert!(deadline >= Instant::now() + Duration::from_secs(29));

        let mut short = RequestStats::default();
        short.update_time(Some(Duration::from_millis(1)));
        // Shorter than the backoff floor: the floor wins.
        assert!(short.next_attempt().expect("armed") >= Instant::now() + Duration::from_millis(400));
    }

    #[test]
    fn score_is_max_over_live_objects() {
        let near = obj(1.0, 1.0);
        let far = obj(1.0, 100.0);
        let mut req = PendingRequest::new(
            PendingKind::Skin {
                mesh_id: MeshId::from_u64(1),
            },
            tracked_from(&near),
        );
        req.tracked.borrow_mut().push(Arc::downgrade(&far));

        assert!(req.update_score());
        assert_eq!(req.score, 1.0);

        drop(near);
        assert!(req.update_score());
        assert_eq!(req.score, 0.01);
    }

    #[test]
    fn dead_tracked_set_drops_the_request() {
        let only = obj(1.0, 1.0);
        let mut req = PendingRequest::new(
            PendingKind::Lod {
                mesh_id: MeshId::from_u64(2),
                lod: 1,
            },
            tracked_from(&only),
        );
        drop(only);
        assert!(!req.update_score());
        assert!(req.tracked.borrow().is_empty());
    }

    #[test]
    fn undrawable_objects_keep_request_alive_with_zero_score() {
        let hidden: Arc<dyn SceneObject> = Arc::new(FixedView(None));
        let mut req = PendingRequest::new(
            PendingKind::Skin {
                mesh_id: MeshId::from_u64(3),
            },
            tracked_from(&hidden),
        );
        assert!(req.update_score());
        assert_eq!(req.score, 0.0);
    }

    #[test]
    fn shared_tracked_list_sees_external_removal() {
        let a = obj(1.0, 1.0);
        let tracked = tracked_from(&a);
        let mut req = PendingRequest::new(
            PendingKind::Skin {
                mesh_id: MeshId::from_u64(4),
            },
            tracked.clone(),
        );

        // An unregister on the loading-table side empties the shared list.
        tracked.borrow_mut().clear();
        assert!(!req.update_score());
    }
}
