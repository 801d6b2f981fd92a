//! Locating espeak, VLC and the fernspielapparat runtime.

pub mod media;
pub mod runtime;
pub mod speech;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    attempt::Attempt,
    config::LauncherConfig,
    environment::{aggregate, aggregate_onto, Environment},
    error::Result,
    platform::{Arch, Platform},
    probe::{CommandProbe, VersionProbe},
    progress::{Progress, TASK_LOCATE},
};

use runtime::{DownloadPipeline, RuntimeFetch, RuntimeSearch, RuntimeStrategy};

pub(crate) const STAGE: &str = "Deps";

/// One located component. Built once per launch attempt and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    version: String,
    directory: Option<PathBuf>,
    binary: PathBuf,
    environment: Environment,
}

impl Dependency {
    /// `directory` is `None` when the component resolves purely via `PATH`.
    pub fn new(
        version: impl Into<String>,
        directory: Option<PathBuf>,
        binary: impl Into<PathBuf>,
        environment: Environment,
    ) -> Self {
        Self {
            version: version.into(),
            directory,
            binary: binary.into(),
            environment,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Absolute path, or a bare name resolved through `PATH` at spawn time.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Variables the runtime needs set to use this component.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependencies {
    /// `None` where the OS brings its own speech synthesis and espeak is missing.
    pub speech: Option<Dependency>,
    pub media: Dependency,
    pub runtime: Dependency,
}

impl Dependencies {
    /// Merged environment in `[speech, media, runtime]` order.
    pub fn environment(&self) -> Environment {
        let ordered = self
            .speech
            .iter()
            .chain([&self.media, &self.runtime])
            .map(Dependency::environment);
        aggregate(ordered)
    }
}

/// Collaborators used while locating; swapped out in tests.
pub struct Locator<'a> {
    pub config: &'a LauncherConfig,
    pub platform: Platform,
    pub probe: &'a dyn VersionProbe,
    pub fetch: &'a dyn RuntimeFetch,
}

impl Locator<'_> {
    pub async fn locate(&self, progress: &Progress, attempt: &Attempt) -> Result<Dependencies> {
        progress.stage(TASK_LOCATE);

        let (speech, media) = tokio::try_join!(
            speech::locate_speech(&self.platform, self.probe, attempt),
            media::locate_media(&self.platform, self.probe, attempt),
        )?;
        progress.report(TASK_LOCATE, 0.5);

        // Probe under the same merged variables the runtime will be launched with.
        let probe_env = aggregate_onto(Environment::from_process(), [media.environment()]);
        let search = RuntimeSearch {
            platform: &self.platform,
            stem: &self.config.runtime_executable,
            install_dir: &self.config.data_dir,
            env: &probe_env,
        };
        let runtime = runtime::locate_runtime(
            &search,
            &RuntimeStrategy::ORDER,
            self.probe,
            self.fetch,
            progress,
            attempt,
        )
        .await?;

        Ok(Dependencies {
            speech,
            media,
            runtime,
        })
    }
}

/// Locates every dependency on this host, downloading the runtime if needed.
pub async fn locate_dependencies(
    config: &LauncherConfig,
    progress: &Progress,
    attempt: &Attempt,
) -> Result<Dependencies> {
    let platform = Platform::current();
    let fetch = DownloadPipeline::from_config(config, platform.clone(), Arch::current())?;
    let locator = Locator {
        config,
        platform,
        probe: &CommandProbe,
        fetch: &fetch,
    };
    locator.locate(progress, attempt).await
}
