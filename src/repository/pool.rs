//! Processing pool: a small set of threads for CPU-heavy parse,
//! decompress and decode work, kept off both the main thread and the
//! network-facing worker loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;

pub type PoolTask = Box<dyn FnOnce() + Send>;

struct PoolInner {
    task_tx: Option<Sender<PoolTask>>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// Cooperative closure pool, shared by the worker loop and the facade.
/// Tasks own their buffers; once shutdown is flagged, queued tasks are
/// expected to observe it and free their buffers without processing.
pub struct ProcessingPool {
    inner: Mutex<PoolInner>,
    shutting_down: Arc<AtomicBool>,
}

impl ProcessingPool {
    pub fn new(size: usize, shutting_down: Arc<AtomicBool>) -> Self {
        let (task_tx, task_rx) = unbounded::<PoolTask>();
        let threads = (0..size.max(1))
            .map(|i| {
                let task_rx: Receiver<PoolTask> = task_rx.clone();
                thread::Builder::new()
                    .name(format!("mesh-process-{i}"))
                    .spawn(move || {
                        while let Ok(task) = task_rx.recv() {
                            task();
                        }
                    })
                    .expect("spawn processing pool thread")
            })
            .collect();

        Self {
            inner: Mutex::new(PoolInner {
                task_tx: Some(task_tx),
                threads,
            }),
            shutting_down,
        }
    }

    /// Post a task. On failure the closure comes back so the caller can
    /// run it inline (keeping buffer ownership with the caller).
    pub fn post(&self, task: PoolTask) -> Result<(), PoolTask> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(task);
        }
        match &self.inner.lock().task_tx {
            Some(tx) => tx.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Stop accepting work and join the threads. Queued tasks drain first;
    /// with the shutdown flag up they only free their buffers.
    pub fn close(&self) {
        let (tx, threads) = {
            let mut inner = self.inner.lock();
            (inner.task_tx.take(), std::mem::take(&mut inner.threads))
        };
        drop(tx);
        for handle in threads {
            if handle.join().is_err() {
                debug!(target: "mesh::pool", "processing pool thread panicked during close");
            }
        }
    }
}

impl Drop for ProcessingPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn tasks_run_on_pool_threads() {
        let flag = Arc::new(AtomicBool::new(false));
        let pool = ProcessingPool::new(2, flag);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let ran = ran.clone();
            pool.post(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .ok()
            .expect("post");
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 8 {
            assert!(std::time::Instant::now() < deadline, "pool tasks stalled");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn post_after_shutdown_returns_the_task() {
        let flag = Arc::new(AtomicBool::new(false));
        let pool = ProcessingPool::new(1, flag.clone());
        flag.store(true, Ordering::Release);

        let returned = pool.post(Box::new(|| panic!("must not run")));
        assert!(returned.is_err());
    }

    #[test]
    fn close_drains_queued_tasks() {
        let flag = Arc::new(AtomicBool::new(false));
        let pool = ProcessingPool::new(1, flag);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            pool.post(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .ok()
            .expect("post");
        }
        pool.close();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
