use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::{
    header::{ACCEPT, LOCATION, USER_AGENT},
    redirect::Policy,
    Client, Response, Url,
};
use tokio::{fs, io::AsyncWriteExt, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DownloadConfig,
    error::{LaunchError, Result},
    progress::{Progress, TASK_DOWNLOAD},
};

const ACCEPT_OCTETS: &str = "application/octet-stream";

/// Fetches release assets to disk, following redirects itself so the hop
/// count stays bounded and headers are re-sent on every hop.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    user_agent: String,
    cfg: DownloadConfig,
}

impl Downloader {
    pub fn new(user_agent: &str, cfg: DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| LaunchError::network("<client>", e))?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            cfg,
        })
    }

    /// Streams `url` into `dest`. `dest` only appears once it is complete and closed.
    pub async fn download(&self, url: &str, dest: &Path, progress: &Progress) -> Result<PathBuf> {
        progress.stage(TASK_DOWNLOAD);
        let (resp, final_url) = self.follow_redirects(url).await?;
        let total = resp.content_length();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| LaunchError::file(parent, e))?;
        }
        let part = part_path(dest);
        let written = Arc::new(AtomicU64::new(0));

        let token = CancellationToken::new();
        // Cancels the ticker on every way out of this function, including early returns.
        let _ticker_guard = token.clone().drop_guard();
        let ticker = progress.is_attached().then(|| {
            tokio::spawn(tick_progress(
                token.clone(),
                written.clone(),
                total,
                progress.clone(),
                self.cfg.progress_interval,
            ))
        });

        let streamed = write_body(resp, &final_url, &part, &written).await;
        token.cancel();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }

        if let Err(e) = streamed {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&part, dest).await {
            let _ = fs::remove_file(&part).await;
            return Err(LaunchError::file(dest, e));
        }

        progress.report(TASK_DOWNLOAD, 1.0);
        Ok(dest.to_path_buf())
    }

    async fn follow_redirects(&self, url: &str) -> Result<(Response, String)> {
        let mut current = Url::parse(url).map_err(|e| LaunchError::network(url, e))?;
        let mut hops = 0usize;
        loop {
            let resp = self
                .client
                .get(current.clone())
                .header(ACCEPT, ACCEPT_OCTETS)
                .header(USER_AGENT, &self.user_agent)
                .send()
                .await
                .map_err(|e| LaunchError::network(current.as_str(), e))?;
            let status = resp.status();

            if status.is_success() {
                return Ok((resp, current.to_string()));
            }
            if !status.is_redirection() {
                return Err(LaunchError::HttpError {
                    url: current.to_string(),
                    status_code: status.as_u16(),
                });
            }
            if hops >= self.cfg.max_redirects {
                return Err(LaunchError::RedirectLimit {
                    url: url.to_string(),
                    limit: self.cfg.max_redirects,
                });
            }

            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| LaunchError::HttpError {
                    url: current.to_string(),
                    status_code: status.as_u16(),
                })?;
            current = current
                .join(location)
                .map_err(|e| LaunchError::network(current.as_str(), e))?;
            hops += 1;
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn write_body(resp: Response, url: &str, part: &Path, written: &AtomicU64) -> Result<()> {
    let mut file = fs::File::create(part)
        .await
        .map_err(|e| LaunchError::file(part, e))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| LaunchError::network(url, e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| LaunchError::file(part, e))?;
        written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    file.flush().await.map_err(|e| LaunchError::file(part, e))?;
    file.sync_all().await.map_err(|e| LaunchError::file(part, e))?;
    Ok(())
}

/// `read / max(1, total)` clamped to `[0, 1]`. Unknown length counts as 1 byte.
pub fn completion_ratio(read: u64, total: Option<u64>) -> f64 {
    let total = total.unwrap_or(0).max(1);
    (read as f64 / total as f64).clamp(0.0, 1.0)
}

async fn tick_progress(
    token: CancellationToken,
    written: Arc<AtomicU64>,
    total: Option<u64>,
    progress: Progress,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let read = written.load(Ordering::Relaxed);
                progress.report(TASK_DOWNLOAD, completion_ratio(read, total));
            }
        }
    }
}
