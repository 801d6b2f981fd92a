use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;
use weichspiel_observability::{trace, Span};

/// Identity of one launch attempt, threaded through every trace line it produces.
#[derive(Debug, Clone)]
pub struct Attempt {
    log_dir: PathBuf,
    launch_id: String,
}

impl Attempt {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            launch_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn span(&self, stage: &str, step_id: &str, ctx: Option<Value>) -> Span {
        Span::start(&self.log_dir, Some(&self.launch_id), stage, step_id, ctx)
    }

    pub fn event(&self, stage: &str, step_id: &str, status: &'static str, ctx: Option<Value>) {
        trace::event(
            &self.log_dir,
            Some(&self.launch_id),
            stage,
            step_id,
            status,
            ctx,
        );
    }
}
