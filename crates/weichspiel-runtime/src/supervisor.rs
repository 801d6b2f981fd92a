use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::TcpStream,
    process::{Child, Command},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use weichspiel_observability::safe_eprintln;

use crate::{
    attempt::Attempt,
    config::SupervisorConfig,
    environment::Environment,
    error::{LaunchError, Result},
};

const STAGE: &str = "Supervisor";
/// Startup output kept for error messages; forwarding to stderr is not limited.
pub const CAPTURE_LIMIT: usize = 64 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Starting,
    Healthy,
    Crashed,
    TimedOut,
}

/// A runtime that came up and accepts connections on its control port.
///
/// The process is never killed on drop; call [`RuntimeHandle::shutdown`].
#[derive(Debug)]
pub struct RuntimeHandle {
    child: Child,
    control_url: String,
}

impl RuntimeHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    /// `Some` once the runtime has exited.
    pub fn try_exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the runtime unless it already exited, and reaps it.
    pub async fn shutdown(mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.start_kill()?;
        self.child.wait().await
    }
}

type Captured = Arc<Mutex<String>>;

fn capture(captured: &Captured, line: &str) {
    let mut buf = captured.lock().unwrap_or_else(|e| e.into_inner());
    let room = CAPTURE_LIMIT.saturating_sub(buf.len());
    if room == 0 {
        return;
    }
    let mut end = line.len().min(room);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&line[..end]);
    if buf.len() < CAPTURE_LIMIT {
        buf.push('\n');
    }
}

fn captured_text(captured: &Captured) -> String {
    captured
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .trim_end()
        .to_string()
}

/// Copies child output to our stderr line by line for as long as the child lives.
fn forward<R>(stream: R, label: &'static str, captured: Captured) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    safe_eprintln!("fernspielapparat {label}: {line}");
                    capture(&captured, line);
                }
            }
        }
    })
}

/// Polls `addr` until a TCP connection succeeds or `ceiling` has passed.
async fn wait_until_reachable(addr: &str, every: Duration, ceiling: Duration) -> bool {
    let deadline = Instant::now() + ceiling;
    loop {
        if let Ok(Ok(_)) = timeout(every, TcpStream::connect(addr)).await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(every.min(deadline - now)).await;
    }
}

enum Startup {
    Exited(std::io::Result<ExitStatus>),
    Reachable,
    Unreachable,
}

/// Starts the runtime and watches it until it is reachable, exits, or runs out of time.
///
/// `env` is laid over the inherited environment.
pub async fn supervise(
    binary: &Path,
    env: &Environment,
    cfg: &SupervisorConfig,
    attempt: &Attempt,
) -> Result<RuntimeHandle> {
    let name = binary.display().to_string();
    let span = attempt.span(
        STAGE,
        "SUP.spawn",
        Some(json!({ "binary": name, "args": cfg.runtime_args })),
    );
    let spawned = Command::new(binary)
        .args(&cfg.runtime_args)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            let err = LaunchError::ProcessSpawnError {
                binary: name,
                source,
            };
            span.fail(&err, None);
            return Err(err);
        }
    };
    span.ok(Some(json!({ "pid": child.id() })));

    let captured: Captured = Arc::new(Mutex::new(String::new()));
    let mut forwarders = Vec::new();
    if let Some(out) = child.stdout.take() {
        forwarders.push(forward(out, "stdout", captured.clone()));
    }
    if let Some(err) = child.stderr.take() {
        forwarders.push(forward(err, "stderr", captured.clone()));
    }

    let addr = cfg.control_addr();
    let span = attempt.span(
        STAGE,
        "SUP.ready",
        Some(json!({
            "addr": addr,
            "timeout_ms": cfg.ready_timeout.as_millis() as u64,
            "state": format!("{:?}", StartupState::Starting),
        })),
    );
    let started = Instant::now();
    let outcome = tokio::select! {
        status = child.wait() => Startup::Exited(status),
        reachable = wait_until_reachable(&addr, cfg.poll_interval, cfg.ready_timeout) => {
            if reachable { Startup::Reachable } else { Startup::Unreachable }
        }
    };

    let state = match &outcome {
        Startup::Reachable => StartupState::Healthy,
        Startup::Exited(_) => StartupState::Crashed,
        Startup::Unreachable => StartupState::TimedOut,
    };
    let result = match outcome {
        Startup::Reachable => Ok(RuntimeHandle {
            child,
            control_url: cfg.control_url(),
        }),
        Startup::Exited(status) => {
            drain(forwarders).await;
            Err(LaunchError::ProcessCrashed {
                code: status.ok().and_then(|s| s.code()),
                output: captured_text(&captured),
            })
        }
        Startup::Unreachable => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            drain(forwarders).await;
            Err(LaunchError::ReadinessTimeout {
                waited: started.elapsed(),
                output: captured_text(&captured),
            })
        }
    };

    let ctx = json!({
        "state": format!("{state:?}"),
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    match &result {
        Ok(_) => span.ok(Some(ctx)),
        Err(e) => {
            safe_eprintln!("supervisor: {e}");
            span.fail(e, Some(ctx));
        }
    }
    result
}

/// Gives the output forwarders a moment to read what the child wrote before exiting.
async fn drain(forwarders: Vec<JoinHandle<()>>) {
    for handle in forwarders {
        let _ = timeout(DRAIN_TIMEOUT, handle).await;
    }
}
