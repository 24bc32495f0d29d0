//! Seam to the convex-decomposition worker.
//!
//! Hull computation itself is an external concern (an injected
//! [`ConvexDecomposer`]); this module only owns the submit/collect
//! plumbing: requests go in on one queue, finished decompositions come
//! back on another, and the facade drains completions on tick.

use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::mesh::{Decomposition, MeshId, Point3};

/// A hull-build request: the triangle soup to approximate.
#[derive(Debug, Clone)]
pub struct HullRequest {
    pub mesh_id: MeshId,
    pub positions: Vec<Point3>,
}

/// External hull builder, run on its own worker thread.
pub trait ConvexDecomposer: Send {
    fn decompose(&self, request: &HullRequest) -> Decomposition;
}

pub(crate) struct DecompositionService {
    request_tx: Option<Sender<HullRequest>>,
    result_rx: Receiver<Decomposition>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DecompositionService {
    pub(crate) fn spawn(decomposer: Box<dyn ConvexDecomposer>) -> Self {
        let (request_tx, request_rx) = unbounded::<HullRequest>();
        let (result_tx, result_rx) = unbounded::<Decomposition>();
        let thread = thread::Builder::new()
            .name("mesh-decomp".into())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let result = decomposer.decompose(&request);
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            })
            .expect("spawn decomposition worker");

        Self {
            request_tx: Some(request_tx),
            result_rx,
            thread: Some(thread),
        }
    }

    pub(crate) fn submit(&self, request: HullRequest) {
        if let Some(tx) = &self.request_tx {
            if tx.send(request).is_err() {
                debug!(target: "mesh::decomp", "decomposition worker gone; request dropped");
            }
        }
    }

    /// Non-blocking drain, called from the facade's tick.
    pub(crate) fn poll(&self) -> Vec<Decomposition> {
        self.result_rx.try_iter().collect()
    }
}

impl Drop for DecompositionService {
    fn drop(&mut self) {
        self.request_tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
