//! Background mesh generation on a fixed worker pool.
//!
//! Sections are queued with a completion callback that runs on the worker
//! thread once the mesh is built. The engine's callback forwards the result
//! into a channel drained by the render thread, so nothing GPU-related ever
//! happens on a worker. Sections can also be loaded on the worker, and
//! plain storage jobs share the same threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use voxlod_voxel::{SectionKey, VoxelizedSection};

use crate::greedy::greedy_mesh;
use crate::quad::{Quad, QuadBounds};

/// How long an idle worker blocks before re-checking the stop flag.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A finished mesh, handed to the completion callback.
#[derive(Debug)]
pub struct GeneratedMesh {
    /// Section the mesh was built from.
    pub key: SectionKey,
    /// Exposed-face quads. Empty for air-only sections.
    pub quads: Vec<Quad>,
    /// Tight bounds of `quads`, `None` when there are none.
    pub bounds: Option<QuadBounds>,
    /// Meshing time in microseconds.
    pub elapsed_us: u64,
}

type Completion = Box<dyn FnOnce(GeneratedMesh) + Send + 'static>;
type Failure = Box<dyn FnOnce(SectionKey) + Send + 'static>;
type Loader = Box<dyn FnOnce() -> VoxelizedSection + Send + 'static>;
type Job = Box<dyn FnOnce() + Send + 'static>;

enum SectionSource {
    Ready(Arc<VoxelizedSection>),
    Load(Loader),
}

enum GenerationTask {
    Mesh {
        key: SectionKey,
        source: SectionSource,
        on_complete: Completion,
        on_failed: Option<Failure>,
    },
    Work(Job),
}

impl GenerationTask {
    /// Report a task that will never run.
    fn discard(self) {
        if let GenerationTask::Mesh {
            key,
            on_failed: Some(on_failed),
            ..
        } = self
        {
            on_failed(key);
        }
    }
}

#[derive(Default)]
struct Counters {
    stopped: AtomicBool,
    /// Queued plus running.
    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed-size meshing worker pool.
pub struct RenderGenerationService {
    task_sender: Sender<GenerationTask>,
    /// Kept so [`stop`](Self::stop) can discard tasks no worker has taken.
    task_receiver: Receiver<GenerationTask>,
    /// Held while submitting and while stopping, so no task slips in
    /// between the stop flag and the drain.
    submit_gate: Mutex<()>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl RenderGenerationService {
    /// Spawn `worker_count` (at least one) named worker threads.
    pub fn start(worker_count: usize) -> std::io::Result<Self> {
        let (task_sender, task_receiver) = unbounded::<GenerationTask>();
        let mut service = Self {
            task_sender,
            task_receiver,
            submit_gate: Mutex::new(()),
            workers: Vec::new(),
            counters: Arc::new(Counters::default()),
        };

        for i in 0..worker_count.max(1) {
            let receiver = service.task_receiver.clone();
            let counters = Arc::clone(&service.counters);
            // On failure `service` drops here, which stops and joins the
            // workers spawned so far.
            let handle = std::thread::Builder::new()
                .name(format!("lod-mesh-{i}"))
                .spawn(move || worker_loop(&receiver, &counters))?;
            service.workers.push(handle);
        }

        tracing::info!(workers = service.workers.len(), "render generation service started");
        Ok(service)
    }

    /// Queue `section` for meshing. Never blocks.
    ///
    /// `on_complete` runs on a worker thread. Returns `false`, and drops the
    /// callback without running it, once the service has been stopped.
    pub fn queue_generation<F>(&self, section: Arc<VoxelizedSection>, on_complete: F) -> bool
    where
        F: FnOnce(GeneratedMesh) + Send + 'static,
    {
        self.submit(GenerationTask::Mesh {
            key: section.key(),
            source: SectionSource::Ready(section),
            on_complete: Box::new(on_complete),
            on_failed: None,
        })
    }

    /// Queue a section that `load` produces on the worker, then mesh it.
    ///
    /// Exactly one of the callbacks runs for an accepted task:
    /// `on_complete` with the mesh, or `on_failed` with `key` when loading,
    /// meshing or `on_complete` panicked, or when [`Self::stop`] discarded
    /// the task before a worker took it.
    pub fn queue_load_generation<L, F, E>(&self, key: SectionKey, load: L, on_complete: F, on_failed: E) -> bool
    where
        L: FnOnce() -> VoxelizedSection + Send + 'static,
        F: FnOnce(GeneratedMesh) + Send + 'static,
        E: FnOnce(SectionKey) + Send + 'static,
    {
        self.submit(GenerationTask::Mesh {
            key,
            source: SectionSource::Load(Box::new(load)),
            on_complete: Box::new(on_complete),
            on_failed: Some(Box::new(on_failed)),
        })
    }

    /// Run `job` on a worker, e.g. storage writes that must stay off the
    /// render thread. A panicking job is counted as failed.
    pub fn queue_work<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(GenerationTask::Work(Box::new(job)))
    }

    fn submit(&self, task: GenerationTask) -> bool {
        let _gate = self.submit_gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.counters.stopped.load(Ordering::Acquire) {
            tracing::trace!("generation queued after stop, ignored");
            return false;
        }
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if self.task_sender.send(task).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Stop accepting work and discard everything not yet picked up.
    ///
    /// Tasks already running finish and run their callbacks. Discarded load
    /// tasks report through their failure callback.
    pub fn stop(&self) {
        let discarded: Vec<GenerationTask> = {
            let _gate = self.submit_gate.lock().unwrap_or_else(PoisonError::into_inner);
            if self.counters.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            let discarded: Vec<_> = self.task_receiver.try_iter().collect();
            self.counters.pending.fetch_sub(discarded.len(), Ordering::AcqRel);
            discarded
        };
        tracing::info!(dropped = discarded.len(), "render generation service stopping");
        for task in discarded {
            task.discard();
        }
    }

    /// Stop, then wait for every worker to exit.
    pub fn shutdown(&mut self) {
        self.stop();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("mesh worker exited by panic");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.counters.stopped.load(Ordering::Acquire)
    }

    /// Tasks queued or currently being meshed.
    pub fn pending_count(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    /// Tasks whose callback ran to completion.
    pub fn completed_count(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked in loading, meshing or their callback.
    pub fn failed_count(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for RenderGenerationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Receiver<GenerationTask>, counters: &Counters) {
    while !counters.stopped.load(Ordering::Acquire) {
        let task = match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if counters.stopped.load(Ordering::Acquire) {
            counters.pending.fetch_sub(1, Ordering::AcqRel);
            task.discard();
            break;
        }
        run_task(task, counters);
        counters.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn run_task(task: GenerationTask, counters: &Counters) {
    let (key, source, on_complete, on_failed) = match task {
        GenerationTask::Mesh {
            key,
            source,
            on_complete,
            on_failed,
        } => (key, source, on_complete, on_failed),
        GenerationTask::Work(job) => {
            match catch_unwind(AssertUnwindSafe(job)) {
                Ok(()) => counters.completed.fetch_add(1, Ordering::Relaxed),
                Err(panic) => {
                    tracing::error!(reason = %panic_reason(panic.as_ref()), "generation job failed");
                    counters.failed.fetch_add(1, Ordering::Relaxed)
                }
            };
            return;
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(move || {
        let start = Instant::now();
        let section = match source {
            SectionSource::Ready(section) => section,
            SectionSource::Load(load) => Arc::new(load()),
        };
        let quads = greedy_mesh(&section);
        let bounds = QuadBounds::from_quads(&quads);
        let elapsed_us = start.elapsed().as_micros() as u64;
        tracing::trace!(%key, quads = quads.len(), elapsed_us, "section meshed");
        on_complete(GeneratedMesh {
            key,
            quads,
            bounds,
            elapsed_us,
        });
    }));

    match outcome {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%key, reason = %panic_reason(panic.as_ref()), "mesh generation task failed");
            if let Some(on_failed) = on_failed {
                if catch_unwind(AssertUnwindSafe(move || on_failed(key))).is_err() {
                    tracing::error!(%key, "failure callback panicked");
                }
            }
        }
    }
}
