// src/engine/queue.rs
//
// The job dispatcher: six FIFO lanes drained by a single worker thread.
//
// The worker re-scans the lanes in priority order every time it goes idle,
// so a newly submitted load overtakes older background work that has not
// started yet. Jobs never run concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::engine::common::EngineResult;
use crate::engine::config::EngineConfig;
use crate::engine::decoder::{DecoderFactory, StandardDecoders};
use crate::engine::job::{Job, JobContext, JobState, Lane};
use crate::engine::notify::{channel, MainContext, Notifier};
use crate::error::ViewerError;

const WORKER_THREAD_NAME: &str = "lazy-viewer-worker";

struct Lanes {
    queues: [VecDeque<Arc<Job>>; 6],
    shutdown: bool,
}

impl Lanes {
    fn new() -> Self {
        Self {
            queues: Default::default(),
            shutdown: false,
        }
    }

    /// Take the next job in priority order and mark it running.
    fn pop(&mut self) -> Option<Arc<Job>> {
        for lane in Lane::PRIORITY {
            if let Some(job) = self.queues[lane.index()].pop_front() {
                *job.state_mut() = JobState::Running;
                tracing::debug!(job_id = %job.id(), lane = lane.as_str(), "job dispatched");
                return Some(job);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

struct Shared {
    lanes: Mutex<Lanes>,
    cvar: Condvar,
    config: EngineConfig,
    decoders: Arc<dyn DecoderFactory>,
    notifier: Notifier,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn run(&self, job: &Arc<Job>) {
        let ctx = JobContext::new(&self.config, self.decoders.as_ref(), &self.notifier);
        job.execute(&ctx);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::debug!("worker thread started");
    loop {
        let job = {
            let mut lanes = shared.lanes.lock();
            loop {
                if lanes.shutdown {
                    tracing::debug!(left_unrun = lanes.len(), "worker thread stopping");
                    return;
                }
                if let Some(job) = lanes.pop() {
                    break job;
                }
                shared.cvar.wait(&mut lanes);
            }
        };
        shared.run(&job);
    }
}

/// Handle to the dispatcher. Clones share the same lanes and worker.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// A stopped queue. Call [`JobQueue::start`] to launch the worker, or
    /// drive it by hand with [`JobQueue::run_one`].
    pub fn new(
        config: EngineConfig,
        decoders: Arc<dyn DecoderFactory>,
        notifier: Notifier,
    ) -> JobQueue {
        JobQueue {
            shared: Arc::new(Shared {
                lanes: Mutex::new(Lanes::new()),
                cvar: Condvar::new(),
                config,
                decoders,
                notifier,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Queue with the standard decoders, a fresh notification channel and a
    /// running worker.
    pub fn spawn(config: EngineConfig) -> EngineResult<(JobQueue, MainContext)> {
        let (notifier, main) = channel(config.notification_capacity);
        let decoders = Arc::new(StandardDecoders::from_config(&config));
        let queue = JobQueue::new(config, decoders, notifier);
        queue.start()?;
        Ok((queue, main))
    }

    /// Launch the worker thread. Starting a running queue does nothing;
    /// a queue that was shut down cannot be restarted.
    pub fn start(&self) -> EngineResult<()> {
        let mut worker = self.shared.worker.lock();
        if self.shared.lanes.lock().shutdown {
            return Err(ViewerError::generic("job queue was shut down"));
        }
        if worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker_loop(shared))
            .map_err(|e| ViewerError::generic(format!("failed to spawn worker thread: {e}")))?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Append `job` to its lane. Only a freshly created job is accepted.
    pub fn submit(&self, job: &Arc<Job>) -> bool {
        let lane = job.kind().lane();
        let mut lanes = self.shared.lanes.lock();
        if lanes.shutdown {
            tracing::warn!(job_id = %job.id(), kind = job.kind().as_str(), "queue shut down, job rejected");
            return false;
        }
        {
            let mut state = job.state_mut();
            if *state != JobState::Created {
                tracing::warn!(
                    job_id = %job.id(),
                    kind = job.kind().as_str(),
                    state = ?*state,
                    "job already submitted"
                );
                return false;
            }
            *state = JobState::Queued;
        }
        lanes.queues[lane.index()].push_back(Arc::clone(job));
        tracing::debug!(
            job_id = %job.id(),
            kind = job.kind().as_str(),
            lane = lane.as_str(),
            "job queued"
        );
        drop(lanes);
        self.shared.cvar.notify_one();
        true
    }

    /// Remove `job` if it has not been picked up yet. A running job cannot
    /// be cancelled here; see [`Image::cancel_load`](crate::Image::cancel_load).
    pub fn cancel(&self, job: &Arc<Job>) -> bool {
        let lane = job.kind().lane();
        let mut lanes = self.shared.lanes.lock();
        let queue = &mut lanes.queues[lane.index()];
        match queue.iter().position(|queued| Arc::ptr_eq(queued, job)) {
            Some(position) => {
                queue.remove(position);
                *job.state_mut() = JobState::Cancelled;
                tracing::debug!(job_id = %job.id(), lane = lane.as_str(), "job cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of queued jobs across all lanes.
    pub fn pending(&self) -> usize {
        self.shared.lanes.lock().len()
    }

    pub fn pending_in(&self, lane: Lane) -> usize {
        self.shared.lanes.lock().queues[lane.index()].len()
    }

    /// Pop the next job and run it on the calling thread. Refused while the
    /// worker thread is running.
    ///
    /// The worker slot stays locked for the whole run, so `start` and other
    /// `run_one` callers wait until the job has finished.
    pub fn run_one(&self) -> Option<Arc<Job>> {
        let worker = self.shared.worker.lock();
        if worker.is_some() {
            tracing::warn!("run_one called while the worker thread is running");
            return None;
        }
        let job = self.shared.lanes.lock().pop()?;
        self.shared.run(&job);
        drop(worker);
        Some(job)
    }

    /// Stop the worker after its current job and join it. Queued jobs stay
    /// unrun; later submissions are rejected.
    pub fn shutdown(&self) {
        {
            let mut lanes = self.shared.lanes.lock();
            lanes.shutdown = true;
        }
        self.shared.cvar.notify_all();

        let handle = self.shared.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
