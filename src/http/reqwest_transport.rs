//! Production transport: blocking reqwest clients on a small I/O thread
//! pool, completions drained through a channel.
//!
//! Each I/O thread owns one client per timeout class; the worker loop
//! never blocks on the network, it only drains the completion channel.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header;

use crate::constants::http::{
    DEFAULT_IO_THREADS, LARGE_MESH_XFER_TIMEOUT, MESH_CONTENT_TYPE, SMALL_MESH_XFER_TIMEOUT,
};
use crate::error::{MeshError, MeshResult};
use crate::http::{parse_content_range_start, FetchEvent, FetchHandle, FetchSpec, PolicyClass, Transport};

struct Job {
    handle: FetchHandle,
    spec: FetchSpec,
}

pub struct ReqwestTransport {
    job_tx: Option<Sender<Job>>,
    event_rx: Receiver<FetchEvent>,
    next_handle: FetchHandle,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ReqwestTransport {
    pub fn new(io_threads: usize) -> MeshResult<Self> {
        let io_threads = io_threads.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (event_tx, event_rx) = unbounded::<FetchEvent>();

        let mut threads = Vec::with_capacity(io_threads);
        for i in 0..io_threads {
            let job_rx = job_rx.clone();
            let event_tx = event_tx.clone();
            let small = build_client(SMALL_MESH_XFER_TIMEOUT)?;
            let large = build_client(LARGE_MESH_XFER_TIMEOUT)?;
            threads.push(
                thread::Builder::new()
                    .name(format!("mesh-http-{i}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            let event = execute(&small, &large, job.handle, &job.spec);
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(MeshError::Io)?,
            );
        }

        Ok(Self {
            job_tx: Some(job_tx),
            event_rx,
            next_handle: 1,
            threads,
        })
    }

    pub fn with_default_threads() -> MeshResult<Self> {
        Self::new(DEFAULT_IO_THREADS)
    }
}

impl Transport for ReqwestTransport {
    fn submit(&mut self, spec: FetchSpec) -> MeshResult<FetchHandle> {
        let handle = self.next_handle;
        self.next_handle += 1;
        let tx = self.job_tx.as_ref().ok_or(MeshError::Shutdown)?;
        match tx.try_send(Job { handle, spec }) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Disconnected(_)) => Err(MeshError::Shutdown),
            Err(TrySendError::Full(_)) => unreachable!("unbounded channel"),
        }
    }

    fn poll(&mut self) -> Vec<FetchEvent> {
        self.event_rx.try_iter().collect()
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        // Closing the job channel lets the I/O threads drain and exit; a
        // thread mid-transfer finishes (or times out) on its own.
        self.job_tx = None;
        for handle in self.threads.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn build_client(timeout: Duration) -> MeshResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| MeshError::Transport {
            status: 0,
            message: format!("client build failed: {e}"),
        })
}

fn execute(small: &Client, large: &Client, handle: FetchHandle, spec: &FetchSpec) -> FetchEvent {
    let client = match spec.policy {
        PolicyClass::Large => large,
        PolicyClass::Small | PolicyClass::Legacy => small,
    };

    let mut request = client
        .get(&spec.url)
        .header(header::ACCEPT, MESH_CONTENT_TYPE);
    if let Some(range) = spec.range {
        request = request.header(
            header::RANGE,
            format!("bytes={}-{}", range.offset, range.last_byte()),
        );
    }

    match request.send() {
        Ok(response) => {
            let status = response.status().as_u16();
            let returned_offset = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_start);
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);

            let body = match response.bytes() {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    warn!(target: "mesh::http", "body read failed for {}: {e}", spec.url);
                    return FetchEvent {
                        handle,
                        status: 0,
                        error: Some(e.to_string()),
                        body: Vec::new(),
                        returned_offset: None,
                        retry_after,
                        transport_retries: 0,
                    };
                }
            };

            debug!(
                target: "mesh::http",
                "GET {} -> {} ({} bytes)",
                spec.url,
                status,
                body.len()
            );

            FetchEvent {
                handle,
                status,
                error: None,
                body,
                returned_offset,
                retry_after,
                transport_retries: 0,
            }
        }
        Err(e) => FetchEvent {
            handle,
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            error: Some(e.to_string()),
            body: Vec::new(),
            returned_offset: None,
            retry_after: None,
            transport_retries: 0,
        },
    }
}
