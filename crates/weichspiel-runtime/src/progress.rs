use std::{fmt, sync::Arc};

use serde::Serialize;

pub const TASK_LOCATE: &str = "Looking for installed dependencies.";
pub const TASK_FEED_QUERY: &str = "Asking GitHub for the newest fernspielapparat release.";
pub const TASK_DOWNLOAD: &str = "Downloading fernspielapparat from GitHub.";
pub const TASK_INSTALL: &str = "Installing fernspielapparat.";
pub const TASK_START: &str = "Starting fernspielapparat.";

/// A stage label and how far along that stage is, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub task: String,
    pub ratio: f64,
}

type SinkFn = dyn Fn(ProgressEvent) + Send + Sync;

/// Optional progress sink shared by every stage of a launch.
///
/// Cloning is cheap. A `Progress::none()` swallows every event, so callers never
/// have to branch on whether anybody is listening.
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<SinkFn>>,
}

impl Progress {
    pub fn none() -> Self {
        Self { sink: None }
    }

    pub fn new(sink: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    pub fn report(&self, task: &str, ratio: f64) {
        let Some(sink) = &self.sink else {
            return;
        };
        let ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        sink(ProgressEvent {
            task: task.to_string(),
            ratio,
        });
    }

    /// Announces a new stage, which restarts the ratio at zero.
    pub fn stage(&self, task: &str) {
        self.report(task, 0.0);
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("attached", &self.is_attached())
            .finish()
    }
}
