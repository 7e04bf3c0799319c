// src/engine/notify.rs
//
// Worker -> UI thread marshaling.
//
// The worker thread never touches UI state. Everything it wants the UI to
// know travels as a `Notification` over a bounded channel whose single
// consumer is the UI event loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::image::Image;
use super::job::{Job, JobKind};

/// A message posted from the worker to the UI thread.
pub enum Notification {
    /// A job advanced. Lossy: dropped when the channel is full.
    Progress {
        job: Arc<Job>,
        kind: JobKind,
        progress: f32,
    },
    /// The job's `finished` flag is set; its error (if any) is final.
    Finished(Arc<Job>),
    /// A load learned the displayed size of an image.
    SizePrepared {
        image: Arc<Image>,
        width: u32,
        height: u32,
    },
    /// A transform or undo changed the image.
    ImageChanged(Arc<Image>),
    ThumbnailChanged(Arc<Image>),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Progress { .. } => "progress",
            Notification::Finished(_) => "finished",
            Notification::SizePrepared { .. } => "size-prepared",
            Notification::ImageChanged(_) => "image-changed",
            Notification::ThumbnailChanged(_) => "thumbnail-changed",
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Progress {
                job,
                kind,
                progress,
            } => f
                .debug_struct("Progress")
                .field("job", &job.id())
                .field("kind", kind)
                .field("progress", progress)
                .finish(),
            Notification::Finished(job) => f.debug_tuple("Finished").field(&job.id()).finish(),
            Notification::SizePrepared {
                image,
                width,
                height,
            } => f
                .debug_struct("SizePrepared")
                .field("image", &image.path())
                .field("width", width)
                .field("height", height)
                .finish(),
            Notification::ImageChanged(image) => {
                f.debug_tuple("ImageChanged").field(&image.path()).finish()
            }
            Notification::ThumbnailChanged(image) => f
                .debug_tuple("ThumbnailChanged")
                .field(&image.path())
                .finish(),
        }
    }
}

/// Sending half, held by the worker thread.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    /// Post a notification to the UI thread.
    ///
    /// Progress is best effort. Everything else waits for room in the
    /// channel. With the consumer gone, notifications are discarded.
    pub fn post(&self, notification: Notification) {
        if let Notification::Progress { .. } = notification {
            match self.tx.try_send(notification) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(dropped)) => {
                    tracing::warn!(notification = ?dropped, "notification channel full, dropping progress");
                }
            }
            return;
        }
        let name = notification.name();
        if self.tx.send(notification).is_err() {
            tracing::debug!(notification = name, "main context gone, discarding notification");
        }
    }
}

/// Receiving half, drained by the UI event loop.
pub struct MainContext {
    rx: Receiver<Notification>,
}

impl MainContext {
    pub fn try_recv(&self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Block for at most `timeout` waiting for the next notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        match self.rx.recv_timeout(timeout) {
            Ok(n) => Some(n),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Run `handler` on every notification queued right now.
    /// Returns how many were handled.
    pub fn dispatch_pending(&self, mut handler: impl FnMut(Notification)) -> usize {
        let mut handled = 0;
        while let Ok(notification) = self.rx.try_recv() {
            handler(notification);
            handled += 1;
        }
        handled
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Create a connected notifier/main-context pair.
pub fn channel(capacity: usize) -> (Notifier, MainContext) {
    let (tx, rx) = bounded(capacity.max(1));
    (Notifier { tx }, MainContext { rx })
}
