use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_REPO: &str = "krachzack/fernspielapparat";
pub const DEFAULT_USER_AGENT: &str = "Krachzack-Weichspielapparat";
pub const DEFAULT_CONTROL_PORT: u16 = 38397;
pub const RUNTIME_EXECUTABLE: &str = "fernspielapparat";

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedConfig {
    pub api_base: String,
    pub repo: String,
    pub user_agent: String,
}

impl FeedConfig {
    pub fn releases_url(&self) -> String {
        format!(
            "{}/repos/{}/releases",
            self.api_base.trim_end_matches('/'),
            self.repo.trim_matches('/')
        )
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            repo: DEFAULT_REPO.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadConfig {
    pub max_redirects: usize,
    #[serde(serialize_with = "as_millis")]
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            progress_interval: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorConfig {
    pub control_host: String,
    pub control_port: u16,
    #[serde(serialize_with = "as_millis")]
    pub poll_interval: Duration,
    #[serde(serialize_with = "as_millis")]
    pub ready_timeout: Duration,
    pub runtime_args: Vec<String>,
}

impl SupervisorConfig {
    pub fn control_url(&self) -> String {
        format!("ws://{}:{}", self.control_host, self.control_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.control_host, self.control_port)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            control_host: "127.0.0.1".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            poll_interval: Duration::from_millis(150),
            ready_timeout: Duration::from_secs(5),
            // debug logs on stderr, server mode
            runtime_args: vec!["-vv".to_string(), "-s".to_string()],
        }
    }
}

/// Everything the launcher needs, resolved once by the host and passed down.
#[derive(Debug, Clone, Serialize)]
pub struct LauncherConfig {
    /// Per-user directory holding the installed runtime and `trace.jsonl`.
    pub data_dir: PathBuf,
    pub runtime_executable: String,
    pub feed: FeedConfig,
    pub download: DownloadConfig,
    pub supervisor: SupervisorConfig,
}

impl LauncherConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            runtime_executable: RUNTIME_EXECUTABLE.to_string(),
            feed: FeedConfig::default(),
            download: DownloadConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }

    /// Defaults, overlaid by `launcher.json` in `data_dir`, overlaid by the environment.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut cfg = Self::new(data_dir);
        let settings = load_settings(data_dir)?;
        cfg.apply_settings(&settings);
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_settings(&mut self, s: &Settings) {
        if let Some(v) = non_empty(s.feed_api_base.as_deref()) {
            self.feed.api_base = v;
        }
        if let Some(v) = non_empty(s.runtime_repo.as_deref()) {
            self.feed.repo = v;
        }
        if let Some(v) = non_empty(s.user_agent.as_deref()) {
            self.feed.user_agent = v;
        }
        if let Some(port) = s.control_port {
            self.supervisor.control_port = port;
        }
        if let Some(ms) = s.ready_timeout_ms {
            self.supervisor.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = s.max_redirects {
            self.download.max_redirects = n;
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("WEICHSPIEL_FEED_API_BASE") {
            self.feed.api_base = v;
        }
        if let Some(v) = env_string("WEICHSPIEL_RUNTIME_REPO") {
            self.feed.repo = v;
        }
        if let Some(port) = env_parsed::<u16>("WEICHSPIEL_CONTROL_PORT") {
            self.supervisor.control_port = port;
        }
        if let Some(ms) = env_parsed::<u64>("WEICHSPIEL_READY_TIMEOUT_MS") {
            self.supervisor.ready_timeout = Duration::from_millis(ms);
        }
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}

fn env_string(key: &str) -> Option<String> {
    non_empty(std::env::var(key).ok().as_deref())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

/// User-editable overrides stored as `launcher.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<usize>,
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("launcher.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p)
        .with_context(|| format!("read {} failed", p.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {} failed", p.display()))
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir failed")?;
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).with_context(|| format!("write {} failed", p.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn env_lock() -> &'static std::sync::Mutex<()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}
