//! Gets the fernspielapparat runtime onto the machine and running.
//!
//! The launcher finds espeak and VLC, finds or downloads the runtime, merges
//! the environment those dependencies need and then starts the runtime in
//! server mode, waiting until its control port accepts connections.

pub mod attempt;
pub mod config;
pub mod deps;
pub mod download;
pub mod environment;
pub mod error;
pub mod feed;
pub mod install;
pub mod platform;
pub mod probe;
pub mod progress;
pub mod releases;
pub mod supervisor;

use serde_json::json;

pub use attempt::Attempt;
pub use config::LauncherConfig;
pub use deps::{locate_dependencies, Dependencies, Dependency};
pub use environment::Environment;
pub use error::{LaunchError, Result};
pub use platform::{Arch, Platform};
pub use progress::{Progress, ProgressEvent};
pub use supervisor::RuntimeHandle;

use environment::aggregate_onto;
use progress::TASK_START;

/// Locates every dependency, then starts the runtime with their merged environment.
///
/// The returned handle owns the running process; nothing here stops it later.
pub async fn launch_runtime(config: &LauncherConfig, progress: &Progress) -> Result<RuntimeHandle> {
    let attempt = Attempt::new(&config.data_dir);
    let deps = locate_dependencies(config, progress, &attempt).await?;

    progress.stage(TASK_START);
    let span = attempt.span("Env", "ENV.aggregate", None);
    let deps_env = deps.environment();
    let env = aggregate_onto(Environment::from_process(), [&deps_env]);
    span.ok(Some(json!({ "keys": deps_env.keys().collect::<Vec<_>>() })));

    let handle = supervisor::supervise(
        deps.runtime.binary(),
        &env,
        &config.supervisor,
        &attempt,
    )
    .await?;
    progress.report(TASK_START, 1.0);
    attempt.event(
        "Launch",
        "LAUNCH.ready",
        "ok",
        Some(json!({
            "pid": handle.pid(),
            "control_url": handle.control_url(),
            "runtime_version": deps.runtime.version(),
        })),
    );
    Ok(handle)
}
