//! Diagnostic front end for the runtime launcher.
//!
//! Resolves the per-user data directory once and hands it to the library, the
//! way the desktop shell does.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use weichspiel_observability::{safe_eprintln, Span};
use weichspiel_runtime::{
    config::{load_settings, save_settings},
    deps::runtime::{DownloadPipeline, RuntimeFetch},
    feed::GithubFeed,
    launch_runtime, locate_dependencies,
    releases::resolve_asset,
    Arch, Attempt, LauncherConfig, Platform, Progress, ProgressEvent,
};

const DATA_DIR_ENV: &str = "WEICHSPIEL_DATA_DIR";
const APP_DIR: &str = "weichspielapparat";

#[derive(Parser)]
#[command(name = "weichspiel-tools")]
#[command(about = "Locate, install and launch the fernspielapparat runtime")]
struct Cli {
    /// Per-user data directory (default: $WEICHSPIEL_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate espeak, VLC and the runtime and print them as JSON
    Deps,
    /// Print the release asset that would be downloaded
    ResolveAsset {
        /// Platform name, e.g. linux, darwin, win32
        #[arg(long)]
        platform: Option<String>,
        /// Architecture name, e.g. x64
        #[arg(long)]
        arch: Option<String>,
    },
    /// Download and install the newest runtime into the data directory
    Install,
    /// Start the runtime and keep it running until Ctrl-C
    Launch,
    /// Print the effective configuration, storing any given overrides first
    Config {
        #[arg(long)]
        control_port: Option<u16>,
        #[arg(long)]
        runtime_repo: Option<String>,
        #[arg(long)]
        feed_api_base: Option<String>,
    },
}

fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .context("no per-user data directory on this platform; pass --data-dir")
}

/// Loads `launcher.json` plus env overrides, tracing a malformed file.
fn load_config(data_dir: &Path) -> Result<LauncherConfig> {
    let span = Span::start(data_dir, None, "Cli", "CLI.config", None);
    match LauncherConfig::load(data_dir) {
        Ok(cfg) => {
            span.ok(None);
            Ok(cfg)
        }
        Err(e) => {
            span.err_anyhow("config", "E_CONFIG", &e, None);
            Err(e)
        }
    }
}

fn progress_line(ev: &ProgressEvent) -> String {
    format!("[{:>3.0}%] {}", ev.ratio * 100.0, ev.task)
}

fn stderr_progress() -> Progress {
    Progress::new(|ev| safe_eprintln!("{}", progress_line(&ev)))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;

    match cli.command {
        Commands::Config {
            control_port,
            runtime_repo,
            feed_api_base,
        } => {
            if control_port.is_some() || runtime_repo.is_some() || feed_api_base.is_some() {
                let mut settings = load_settings(&data_dir)?;
                if control_port.is_some() {
                    settings.control_port = control_port;
                }
                if runtime_repo.is_some() {
                    settings.runtime_repo = runtime_repo;
                }
                if feed_api_base.is_some() {
                    settings.feed_api_base = feed_api_base;
                }
                save_settings(&data_dir, &settings)?;
            }
            print_json(&load_config(&data_dir)?)
        }
        Commands::Deps => {
            let cfg = load_config(&data_dir)?;
            let attempt = Attempt::new(&cfg.data_dir);
            safe_eprintln!("launch {}", attempt.launch_id());
            let deps = locate_dependencies(&cfg, &stderr_progress(), &attempt).await?;
            print_json(&deps)
        }
        Commands::ResolveAsset { platform, arch } => {
            let cfg = load_config(&data_dir)?;
            let platform = platform.map_or_else(Platform::current, |p| Platform::parse(&p));
            let arch = arch.map_or_else(Arch::current, |a| Arch::parse(&a));
            let feed = GithubFeed::new(reqwest::Client::new(), cfg.feed.clone());
            let asset = resolve_asset(&feed, &platform, &arch).await?;
            print_json(&asset)
        }
        Commands::Install => {
            let cfg = load_config(&data_dir)?;
            let attempt = Attempt::new(&cfg.data_dir);
            safe_eprintln!("launch {}", attempt.launch_id());
            let pipeline = DownloadPipeline::from_config(&cfg, Platform::current(), Arch::current())?;
            let path = pipeline
                .fetch(&cfg.data_dir, &stderr_progress(), &attempt)
                .await?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Launch => {
            let cfg = load_config(&data_dir)?;
            let handle = launch_runtime(&cfg, &stderr_progress()).await?;
            println!("{}", handle.control_url());
            safe_eprintln!(
                "fernspielapparat running (pid {}), Ctrl-C to stop",
                handle.pid().map_or_else(|| "?".to_string(), |p| p.to_string())
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C failed")?;
            let status = handle.shutdown().await.context("stopping runtime failed")?;
            safe_eprintln!("fernspielapparat stopped: {status}");
            Ok(())
        }
    }
}
