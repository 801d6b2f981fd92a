use std::{
    fs::File,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use weichspiel_observability::safe_eprintln;

use super::{Dependency, STAGE};
use crate::{
    attempt::Attempt,
    config::{DownloadConfig, FeedConfig, LauncherConfig},
    download::Downloader,
    environment::Environment,
    error::{LaunchError, Result},
    feed::{GithubFeed, ReleaseFeed},
    install::install_executable,
    platform::{Arch, Platform},
    probe::{parse_version_banner, VersionProbe},
    progress::{Progress, TASK_FEED_QUERY, TASK_INSTALL},
    releases::{resolve_asset, Release},
};

/// Where to look for the runtime, tried in order until one yields a working binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStrategy {
    /// A system-provided binary on `PATH`.
    Path,
    /// A copy installed earlier into the user data directory.
    UserDir,
    /// Download the newest release and install it into the user data directory.
    Download,
}

impl RuntimeStrategy {
    pub const ORDER: [RuntimeStrategy; 3] = [Self::Path, Self::UserDir, Self::Download];

    pub fn label(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::UserDir => "user_dir",
            Self::Download => "download",
        }
    }
}

/// Obtains a fresh runtime binary in `install_dir`.
#[async_trait]
pub trait RuntimeFetch: Send + Sync {
    async fn fetch(
        &self,
        install_dir: &Path,
        progress: &Progress,
        attempt: &Attempt,
    ) -> Result<PathBuf>;
}

/// What the runtime locator needs to know about this host.
#[derive(Debug, Clone)]
pub struct RuntimeSearch<'a> {
    pub platform: &'a Platform,
    pub stem: &'a str,
    pub install_dir: &'a Path,
    /// Environment the version probe runs with: the process environment plus media hints.
    pub env: &'a Environment,
}

impl RuntimeSearch<'_> {
    fn executable_name(&self) -> String {
        self.platform.executable_name(self.stem)
    }

    fn installed_path(&self) -> PathBuf {
        self.install_dir.join(self.executable_name())
    }
}

/// Tries each strategy in turn. A failing strategy only moves on to the next
/// one; the error of the last strategy tried is what the caller sees.
pub async fn locate_runtime(
    search: &RuntimeSearch<'_>,
    strategies: &[RuntimeStrategy],
    probe: &dyn VersionProbe,
    fetch: &dyn RuntimeFetch,
    progress: &Progress,
    attempt: &Attempt,
) -> Result<Dependency> {
    let span = attempt.span(
        STAGE,
        "DEP.runtime",
        Some(json!({ "strategies": strategies })),
    );

    let mut last_err = None;
    for &strategy in strategies {
        let step_id = format!("DEP.runtime.{}", strategy.label());
        let step = attempt.span(STAGE, &step_id, None);
        match try_strategy(strategy, search, probe, fetch, progress, attempt).await {
            Ok(dep) => {
                step.ok(Some(json!({
                    "version": dep.version(),
                    "binary": dep.binary().display().to_string(),
                })));
                span.ok(Some(json!({ "strategy": strategy })));
                return Ok(dep);
            }
            Err(e) => {
                safe_eprintln!("deps: runtime via {} unavailable: {e}", strategy.label());
                step.fail(&e, None);
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| LaunchError::ExecutableNotFound {
        archive: search.install_dir.to_path_buf(),
        executable: search.executable_name(),
    });
    span.fail(&err, None);
    Err(err)
}

async fn try_strategy(
    strategy: RuntimeStrategy,
    search: &RuntimeSearch<'_>,
    probe: &dyn VersionProbe,
    fetch: &dyn RuntimeFetch,
    progress: &Progress,
    attempt: &Attempt,
) -> Result<Dependency> {
    let (binary, directory) = match strategy {
        RuntimeStrategy::Path => (PathBuf::from(search.executable_name()), None),
        RuntimeStrategy::UserDir => {
            let path = search.installed_path();
            check_runnable(&path)?;
            (path, Some(search.install_dir.to_path_buf()))
        }
        RuntimeStrategy::Download => {
            let path = fetch.fetch(search.install_dir, progress, attempt).await?;
            (path, Some(search.install_dir.to_path_buf()))
        }
    };

    let out = probe.run(&binary, search.env).await?;
    let version = parse_version_banner(&binary.display().to_string(), &out.combined())?;
    Ok(Dependency::new(version, directory, binary, Environment::new()))
}

/// A previous install counts only if it can be read and executed.
fn check_runnable(path: &Path) -> Result<()> {
    let denied = |message: String| LaunchError::PermissionError {
        path: path.to_path_buf(),
        message,
    };
    let meta = std::fs::metadata(path).map_err(|e| denied(e.to_string()))?;
    if !meta.is_file() {
        return Err(denied("not a regular file".to_string()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(denied("not executable".to_string()));
        }
    }
    File::open(path).map_err(|e| denied(e.to_string()))?;
    Ok(())
}

/// Feed lookup, download into a scratch directory, then extraction.
#[derive(Debug, Clone)]
pub struct DownloadPipeline {
    platform: Platform,
    arch: Arch,
    stem: String,
    feed: FeedConfig,
    downloader: Downloader,
    client: Client,
}

impl DownloadPipeline {
    pub fn new(
        platform: Platform,
        arch: Arch,
        stem: &str,
        feed: FeedConfig,
        download: DownloadConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| LaunchError::network(feed.releases_url(), e))?;
        let downloader = Downloader::new(&feed.user_agent, download)?;
        Ok(Self {
            platform,
            arch,
            stem: stem.to_string(),
            feed,
            downloader,
            client,
        })
    }

    pub fn from_config(cfg: &LauncherConfig, platform: Platform, arch: Arch) -> Result<Self> {
        Self::new(
            platform,
            arch,
            &cfg.runtime_executable,
            cfg.feed.clone(),
            cfg.download.clone(),
        )
    }
}

/// Records each feed query in the trace.
struct TracedFeed<'a> {
    inner: GithubFeed,
    attempt: &'a Attempt,
}

#[async_trait]
impl ReleaseFeed for TracedFeed<'_> {
    async fn releases(&self) -> Result<Vec<Release>> {
        let span = self.attempt.span("Feed", "FEED.releases", None);
        match self.inner.releases().await {
            Ok(releases) => {
                span.ok(Some(json!({ "count": releases.len() })));
                Ok(releases)
            }
            Err(e) => {
                span.fail(&e, None);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RuntimeFetch for DownloadPipeline {
    async fn fetch(
        &self,
        install_dir: &Path,
        progress: &Progress,
        attempt: &Attempt,
    ) -> Result<PathBuf> {
        progress.stage(TASK_FEED_QUERY);
        let feed = TracedFeed {
            inner: GithubFeed::new(self.client.clone(), self.feed.clone()),
            attempt,
        };
        let span = attempt.span(
            "Feed",
            "FEED.select_asset",
            Some(json!({ "platform": self.platform, "arch": self.arch })),
        );
        let asset = match resolve_asset(&feed, &self.platform, &self.arch).await {
            Ok(asset) => {
                span.ok(Some(json!({ "asset": asset.name })));
                asset
            }
            Err(e) => {
                span.fail(&e, None);
                return Err(e);
            }
        };
        progress.report(TASK_FEED_QUERY, 1.0);

        let scratch = tempfile::Builder::new()
            .prefix("download-fernspielapparat-")
            .tempdir()
            .map_err(|e| LaunchError::file(std::env::temp_dir(), e))?;
        let archive = scratch.path().join(format!("{}.tar.gz", self.stem));

        let span = attempt.span("Download", "DL.download", Some(json!({ "url": asset.url })));
        match self.downloader.download(&asset.url, &archive, progress).await {
            Ok(_) => span.ok(None),
            Err(e) => {
                span.fail(&e, None);
                return Err(e);
            }
        }

        progress.stage(TASK_INSTALL);
        let span = attempt.span("Install", "INST.extract", None);
        let installed =
            match install_executable(&archive, install_dir, &self.platform, &self.stem).await {
                Ok(installed) => {
                    span.ok(Some(json!({
                        "path": installed.path.display().to_string(),
                        "sha256": installed.sha256,
                    })));
                    installed
                }
                Err(e) => {
                    span.fail(&e, None);
                    return Err(e);
                }
            };
        progress.report(TASK_INSTALL, 1.0);
        safe_eprintln!(
            "deps: installed {} from {}",
            installed.path.display(),
            asset.name
        );
        Ok(installed.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{probe::ProbeOutput, progress::TASK_DOWNLOAD};
    use std::sync::Mutex;

    /// Records every binary it is asked to run and answers from a script.
    struct ScriptedProbe {
        calls: Mutex<Vec<PathBuf>>,
        answers: Mutex<Vec<Result<ProbeOutput>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<ProbeOutput>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                answers: Mutex::new(answers),
            }
        }

        fn calls(&self) -> Vec<PathBuf> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VersionProbe for ScriptedProbe {
        async fn run(&self, binary: &Path, _env: &Environment) -> Result<ProbeOutput> {
            self.calls.lock().unwrap().push(binary.to_path_buf());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                panic!("unexpected probe of {}", binary.display());
            }
            answers.remove(0)
        }
    }

    struct FakeFetch {
        calls: Mutex<usize>,
        result: fn(&Path) -> Result<PathBuf>,
    }

    #[async_trait]
    impl RuntimeFetch for FakeFetch {
        async fn fetch(&self, dir: &Path, _: &Progress, _: &Attempt) -> Result<PathBuf> {
            *self.calls.lock().unwrap() += 1;
            (self.result)(dir)
        }
    }

    fn banner(s: &str) -> Result<ProbeOutput> {
        Ok(ProbeOutput {
            stdout: s.to_string(),
            stderr: String::new(),
        })
    }

    fn parse_failure(tag: &str) -> Result<ProbeOutput> {
        Err(LaunchError::VersionParseError {
            binary: tag.to_string(),
            output: String::new(),
        })
    }

    #[cfg(unix)]
    fn installed_copy(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join("fernspielapparat");
        std::fs::write(&p, b"#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        p
    }

    fn search<'a>(dir: &'a Path, env: &'a Environment) -> RuntimeSearch<'a> {
        RuntimeSearch {
            platform: &Platform::Linux,
            stem: "fernspielapparat",
            install_dir: dir,
            env,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn last_stage_error_surfaces_after_one_probe_per_stage() {
        let td = tempfile::tempdir().expect("tempdir");
        let installed = installed_copy(td.path());
        let env = Environment::new();
        let probe = ScriptedProbe::new(vec![
            parse_failure("path"),
            parse_failure("user_dir"),
            parse_failure("download"),
        ]);
        let fetch = FakeFetch {
            calls: Mutex::new(0),
            result: |dir| Ok(dir.join("fernspielapparat")),
        };

        let err = locate_runtime(
            &search(td.path(), &env),
            &RuntimeStrategy::ORDER,
            &probe,
            &fetch,
            &Progress::none(),
            &Attempt::new(td.path()),
        )
        .await
        .unwrap_err();

        match err {
            LaunchError::VersionParseError { binary, .. } => assert_eq!(binary, "download"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            probe.calls(),
            vec![PathBuf::from("fernspielapparat"), installed.clone(), installed]
        );
        assert_eq!(*fetch.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_the_surfaced_error() {
        let td = tempfile::tempdir().expect("tempdir");
        let env = Environment::new();
        let probe = ScriptedProbe::new(vec![parse_failure("path")]);
        let fetch = FakeFetch {
            calls: Mutex::new(0),
            result: |_| {
                Err(LaunchError::NoMatchingAsset {
                    platform: "linux".to_string(),
                })
            },
        };

        let err = locate_runtime(
            &search(td.path(), &env),
            &RuntimeStrategy::ORDER,
            &probe,
            &fetch,
            &Progress::none(),
            &Attempt::new(td.path()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LaunchError::NoMatchingAsset { .. }), "{err:?}");
        // The user dir holds no copy, so only the PATH probe ever spawned.
        assert_eq!(probe.calls().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn previous_install_is_used_without_downloading() {
        let td = tempfile::tempdir().expect("tempdir");
        let installed = installed_copy(td.path());
        let env = Environment::new();
        let probe = ScriptedProbe::new(vec![
            Err(LaunchError::ProcessSpawnError {
                binary: "fernspielapparat".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            banner("fernspielapparat 0.3.1\n"),
        ]);
        let fetch = FakeFetch {
            calls: Mutex::new(0),
            result: |_| panic!("must not download"),
        };

        let dep = locate_runtime(
            &search(td.path(), &env),
            &RuntimeStrategy::ORDER,
            &probe,
            &fetch,
            &Progress::none(),
            &Attempt::new(td.path()),
        )
        .await
        .expect("locate");

        assert_eq!(dep.version(), "0.3.1");
        assert_eq!(dep.binary(), installed.as_path());
        assert_eq!(dep.directory(), Some(td.path()));
        assert_eq!(*fetch.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn path_hit_has_no_directory() {
        let td = tempfile::tempdir().expect("tempdir");
        let env = Environment::new();
        let probe = ScriptedProbe::new(vec![banner("fernspielapparat 0.2.0")]);
        let fetch = FakeFetch {
            calls: Mutex::new(0),
            result: |_| panic!("must not download"),
        };

        let dep = locate_runtime(
            &search(td.path(), &env),
            &RuntimeStrategy::ORDER,
            &probe,
            &fetch,
            &Progress::none(),
            &Attempt::new(td.path()),
        )
        .await
        .expect("locate");

        assert_eq!(dep.directory(), None);
        assert_eq!(dep.binary(), Path::new("fernspielapparat"));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_install_is_a_permission_error() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = td.path().join("fernspielapparat");
        std::fs::write(&p, b"data").expect("write");
        let err = check_runnable(&p).unwrap_err();
        assert!(matches!(err, LaunchError::PermissionError { .. }), "{err:?}");
        assert!(matches!(
            check_runnable(&td.path().join("missing")),
            Err(LaunchError::PermissionError { .. })
        ));
    }

    #[tokio::test]
    async fn pipeline_downloads_and_installs_newest_asset() {
        use crate::install::testing::write_tarball;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let td = tempfile::tempdir().expect("tempdir");
        let tarball = td.path().join("asset.tar.gz");
        write_tarball(&tarball, &[("dist/fernspielapparat", b"runtime"), ("README.md", b"doc")]);
        let body = std::fs::read(&tarball).expect("read tarball");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/krachzack/fernspielapparat/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "published_at": "2021-06-01T00:00:00Z",
                "assets": [{
                    "name": "fernspielapparat-linux-x64.tar.gz",
                    "url": format!("{}/assets/1", server.uri())
                }]
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/assets/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let feed = FeedConfig {
            api_base: server.uri(),
            ..FeedConfig::default()
        };
        let pipeline = DownloadPipeline::new(
            Platform::Linux,
            Arch::X86_64,
            "fernspielapparat",
            feed,
            DownloadConfig::default(),
        )
        .expect("pipeline");

        let install_dir = td.path().join("user");
        let (progress, events) = crate::progress::testing::recording();
        let got = pipeline
            .fetch(&install_dir, &progress, &Attempt::new(td.path()))
            .await
            .expect("fetch");

        assert_eq!(got, install_dir.join("fernspielapparat"));
        assert_eq!(std::fs::read(&got).expect("read"), b"runtime");

        let tasks: Vec<String> = events.lock().unwrap().iter().map(|e| e.task.clone()).collect();
        assert_eq!(tasks.first().map(String::as_str), Some(TASK_FEED_QUERY));
        assert!(tasks.iter().any(|t| t == TASK_DOWNLOAD));
        assert_eq!(tasks.last().map(String::as_str), Some(TASK_INSTALL));
    }
}
