// src/engine/job.rs
//
// Jobs: single-shot units of deferred work run by the queue's worker.
//
// A job is created on the UI thread, submitted once, executed exactly once
// and then only read. Its kind is a closed enum; the per-kind bodies live in
// `tasks.rs`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::engine::common::panic_message;
use crate::engine::config::EngineConfig;
use crate::engine::converter::UriConverter;
use crate::engine::decoder::DecoderFactory;
use crate::engine::image::Image;
use crate::engine::notify::{Notification, Notifier};
use crate::engine::tasks;
use crate::error::ViewerError;
use crate::ops::{DataMask, Transform};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Load,
    Thumbnail,
    Model,
    Transform,
    Save,
    SaveAs,
    Copy,
}

impl JobKind {
    pub fn lane(self) -> Lane {
        match self {
            JobKind::Load => Lane::Load,
            JobKind::Thumbnail => Lane::Thumbnail,
            JobKind::Model => Lane::Model,
            JobKind::Transform => Lane::Transform,
            JobKind::Save | JobKind::SaveAs => Lane::Save,
            JobKind::Copy => Lane::Copy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Load => "load",
            JobKind::Thumbnail => "thumbnail",
            JobKind::Model => "model",
            JobKind::Transform => "transform",
            JobKind::Save => "save",
            JobKind::SaveAs => "save-as",
            JobKind::Copy => "copy",
        }
    }
}

/// One FIFO of pending jobs inside the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Load,
    Transform,
    Thumbnail,
    Model,
    Save,
    Copy,
}

impl Lane {
    /// Pop order of the worker: interactive work first.
    pub const PRIORITY: [Lane; 6] = [
        Lane::Load,
        Lane::Transform,
        Lane::Thumbnail,
        Lane::Model,
        Lane::Save,
        Lane::Copy,
    ];

    pub fn index(self) -> usize {
        match self {
            Lane::Load => 0,
            Lane::Transform => 1,
            Lane::Thumbnail => 2,
            Lane::Model => 3,
            Lane::Save => 4,
            Lane::Copy => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Load => "load",
            Lane::Transform => "transform",
            Lane::Thumbnail => "thumbnail",
            Lane::Model => "model",
            Lane::Save => "save",
            Lane::Copy => "copy",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Queued,
    Running,
    Finished,
    /// Removed from its lane before it started. Never finishes.
    Cancelled,
}

/// Where a save-as job writes.
#[derive(Clone, Debug)]
pub enum SaveAsTarget {
    /// One explicit destination; the job must hold exactly one image.
    File(PathBuf),
    /// Destinations derived per image from a naming pattern.
    Converter(UriConverter),
}

pub(crate) enum JobPayload {
    Load {
        image: Arc<Image>,
        mask: DataMask,
    },
    Thumbnail {
        image: Arc<Image>,
    },
    Model {
        paths: Vec<PathBuf>,
    },
    Transform {
        images: Vec<Arc<Image>>,
        /// `None` undoes the last transform of every image.
        transform: Option<Transform>,
    },
    Save {
        images: Vec<Arc<Image>>,
    },
    SaveAs {
        images: Vec<Arc<Image>>,
        target: SaveAsTarget,
        overwrite: bool,
    },
    Copy {
        files: Vec<PathBuf>,
        dest_dir: PathBuf,
    },
}

/// Position of a running save within its image list.
#[derive(Clone, Debug)]
pub struct SaveCursor {
    pub position: usize,
    pub image: Arc<Image>,
}

/// What a model job discovered.
#[derive(Clone, Debug, Default)]
pub struct ModelOutput {
    pub images: Vec<Arc<Image>>,
    /// Paths that do not exist, cannot be read or are not a supported image.
    pub errors: Vec<PathBuf>,
}

/// Everything a job body may touch besides its own payload.
pub struct JobContext<'a> {
    pub config: &'a EngineConfig,
    pub decoders: &'a dyn DecoderFactory,
    pub notifier: &'a Notifier,
    job: Option<&'a Arc<Job>>,
}

impl<'a> JobContext<'a> {
    /// A context outside any job, for direct calls like `Image::load`.
    pub fn new(
        config: &'a EngineConfig,
        decoders: &'a dyn DecoderFactory,
        notifier: &'a Notifier,
    ) -> Self {
        Self {
            config,
            decoders,
            notifier,
            job: None,
        }
    }

    pub(crate) fn for_job(mut self, job: &'a Arc<Job>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn job(&self) -> Option<&'a Arc<Job>> {
        self.job
    }

    pub(crate) fn job_kind(&self) -> Option<JobKind> {
        self.job.map(|job| job.kind())
    }

    /// Advance the running job's progress. Posts a progress notification
    /// when the value actually moved.
    pub fn progress(&self, progress: f32) {
        let Some(job) = self.job else {
            return;
        };
        if let Some(progress) = job.advance(progress) {
            self.notifier.post(Notification::Progress {
                job: Arc::clone(job),
                kind: job.kind(),
                progress,
            });
        }
    }
}

pub struct Job {
    id: JobId,
    kind: JobKind,
    payload: JobPayload,
    state: Mutex<JobState>,
    progress: Mutex<f32>,
    error: Mutex<Option<ViewerError>>,
    finished: Mutex<bool>,
    finished_cvar: Condvar,
    save_cursor: Mutex<Option<SaveCursor>>,
    model_output: Mutex<Option<ModelOutput>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

impl Job {
    fn with_payload(kind: JobKind, payload: JobPayload) -> Arc<Job> {
        Arc::new(Job {
            id: JobId::next(),
            kind,
            payload,
            state: Mutex::new(JobState::Created),
            progress: Mutex::new(0.0),
            error: Mutex::new(None),
            finished: Mutex::new(false),
            finished_cvar: Condvar::new(),
            save_cursor: Mutex::new(None),
            model_output: Mutex::new(None),
        })
    }

    pub fn load(image: Arc<Image>, mask: DataMask) -> Arc<Job> {
        Self::with_payload(JobKind::Load, JobPayload::Load { image, mask })
    }

    pub fn thumbnail(image: Arc<Image>) -> Arc<Job> {
        Self::with_payload(JobKind::Thumbnail, JobPayload::Thumbnail { image })
    }

    /// Expand files and directories into image entities.
    pub fn model(paths: Vec<PathBuf>) -> Arc<Job> {
        Self::with_payload(JobKind::Model, JobPayload::Model { paths })
    }

    pub fn transform(images: Vec<Arc<Image>>, transform: Transform) -> Arc<Job> {
        Self::with_payload(
            JobKind::Transform,
            JobPayload::Transform {
                images,
                transform: Some(transform),
            },
        )
    }

    /// A transform job that reverts the last transform of each image.
    pub fn undo(images: Vec<Arc<Image>>) -> Arc<Job> {
        Self::with_payload(
            JobKind::Transform,
            JobPayload::Transform {
                images,
                transform: None,
            },
        )
    }

    pub fn save(images: Vec<Arc<Image>>) -> Arc<Job> {
        Self::with_payload(JobKind::Save, JobPayload::Save { images })
    }

    pub fn save_as(images: Vec<Arc<Image>>, target: SaveAsTarget, overwrite: bool) -> Arc<Job> {
        Self::with_payload(
            JobKind::SaveAs,
            JobPayload::SaveAs {
                images,
                target,
                overwrite,
            },
        )
    }

    pub fn copy(files: Vec<PathBuf>, dest_dir: impl Into<PathBuf>) -> Arc<Job> {
        Self::with_payload(
            JobKind::Copy,
            JobPayload::Copy {
                files,
                dest_dir: dest_dir.into(),
            },
        )
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub(crate) fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub(crate) fn state_mut(&self) -> parking_lot::MutexGuard<'_, JobState> {
        self.state.lock()
    }

    pub fn progress(&self) -> f32 {
        *self.progress.lock()
    }

    /// Raise progress to `value`. Returns the new value when it increased.
    fn advance(&self, value: f32) -> Option<f32> {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        let mut progress = self.progress.lock();
        if value > *progress {
            *progress = value;
            Some(value)
        } else {
            None
        }
    }

    pub fn error(&self) -> Option<ViewerError> {
        self.error.lock().clone()
    }

    /// The first error wins.
    fn set_error(&self, error: ViewerError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Block until the job finished. Never returns for a cancelled job.
    pub fn wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.finished_cvar.wait(&mut finished);
        }
    }

    /// Block until the job finished or `timeout` elapsed. Returns whether
    /// it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock();
        while !*finished {
            if self
                .finished_cvar
                .wait_until(&mut finished, deadline)
                .timed_out()
            {
                return *finished;
            }
        }
        true
    }

    /// Current position of a running save or save-as.
    pub fn save_cursor(&self) -> Option<SaveCursor> {
        self.save_cursor.lock().clone()
    }

    pub(crate) fn set_save_cursor(&self, position: usize, image: &Arc<Image>) {
        *self.save_cursor.lock() = Some(SaveCursor {
            position,
            image: Arc::clone(image),
        });
    }

    /// Result of a finished model job.
    pub fn model_output(&self) -> Option<ModelOutput> {
        self.model_output.lock().clone()
    }

    pub(crate) fn set_model_output(&self, output: ModelOutput) {
        *self.model_output.lock() = Some(output);
    }

    /// The single target image of a load or thumbnail job.
    pub fn image(&self) -> Option<&Arc<Image>> {
        match &self.payload {
            JobPayload::Load { image, .. } | JobPayload::Thumbnail { image } => Some(image),
            _ => None,
        }
    }

    /// Run the body on the calling thread, then mark the job finished and
    /// post `Finished`. A panicking body counts as a failure.
    pub(crate) fn execute(self: &Arc<Self>, ctx: &JobContext<'_>) {
        *self.error.lock() = None;
        let started = Instant::now();
        let ctx = JobContext::new(ctx.config, ctx.decoders, ctx.notifier).for_job(self);

        let result = catch_unwind(AssertUnwindSafe(|| tasks::run(self, &ctx)))
            .unwrap_or_else(|payload| {
                Err(ViewerError::internal_panic(format!(
                    "{} job panicked: {}",
                    self.kind.as_str(),
                    panic_message(payload.as_ref())
                )))
            });

        match result {
            Ok(()) => {
                *self.progress.lock() = 1.0;
                tracing::info!(
                    job_id = %self.id,
                    kind = self.kind.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job finished"
                );
            }
            Err(error) => {
                tracing::error!(
                    job_id = %self.id,
                    kind = self.kind.as_str(),
                    error = %error,
                    "job failed"
                );
                self.set_error(error);
            }
        }

        {
            let mut finished = self.finished.lock();
            *finished = true;
            *self.state.lock() = JobState::Finished;
            self.finished_cvar.notify_all();
        }
        ctx.notifier.post(Notification::Finished(Arc::clone(self)));
    }
}
