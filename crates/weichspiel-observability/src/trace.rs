use std::{
    fmt::Display,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const TRACE_FILE: &str = "trace.jsonl";
const DEFAULT_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_MAX_FILES: usize = 5;
const BACKTRACE_MAX_CHARS: usize = 12_000;

/// An error that knows how it should be labelled in the trace.
///
/// `kind` is a coarse family (`http`, `io`, `process`, ...), `code` a stable
/// machine readable identifier such as `E_READINESS_TIMEOUT`.
pub trait Classified: Display {
    fn kind(&self) -> &'static str;
    fn code(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct TraceConfig {
    enabled: bool,
    backtrace: bool,
    max_bytes: u64,
    max_files: usize,
}

impl TraceConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_flag("WEICHSPIEL_TRACE_ENABLED"),
            backtrace: env_flag("WEICHSPIEL_TRACE_BACKTRACE"),
            max_bytes: env_parse("WEICHSPIEL_TRACE_MAX_BYTES", DEFAULT_MAX_BYTES),
            max_files: env_parse("WEICHSPIEL_TRACE_MAX_FILES", DEFAULT_MAX_FILES),
        }
    }
}

// Unset means on; only an explicit "0/false/no/off" turns a flag off.
fn env_flag(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !matches!(t.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn trace_path(log_dir: &Path) -> PathBuf {
    log_dir.join(TRACE_FILE)
}

fn generation_path(log_dir: &Path, n: usize) -> PathBuf {
    log_dir.join(format!("{TRACE_FILE}.{n}"))
}

fn rotate_best_effort(log_dir: &Path, cfg: &TraceConfig) {
    if cfg.max_files == 0 {
        return;
    }
    let current = trace_path(log_dir);
    let Ok(meta) = std::fs::metadata(&current) else {
        return;
    };
    if meta.len() <= cfg.max_bytes {
        return;
    }

    // Drop the oldest generation first; rename onto an existing file fails on Windows.
    let oldest = generation_path(log_dir, cfg.max_files);
    if oldest.exists() {
        let _ = std::fs::remove_file(&oldest);
    }
    for n in (1..cfg.max_files).rev() {
        let src = generation_path(log_dir, n);
        if src.exists() {
            let _ = std::fs::rename(&src, generation_path(log_dir, n + 1));
        }
    }
    let _ = std::fs::rename(&current, generation_path(log_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn emit_best_effort(log_dir: &Path, ev: &TraceEvent) {
    let cfg = TraceConfig::from_env();
    if !cfg.enabled {
        return;
    }
    let line = match serde_json::to_string(ev) {
        Ok(mut s) => {
            s.push('\n');
            s
        }
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };

    // A poisoned lock only means another writer panicked mid-line; keep tracing.
    let _guard = write_lock()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = std::fs::create_dir_all(log_dir);
    rotate_best_effort(log_dir, &cfg);

    let p = trace_path(log_dir);
    match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(mut f) => {
            if let Err(e) = f.write_all(line.as_bytes()) {
                crate::safe_eprintln!("trace: write failed: {}: {e}", p.display());
            }
        }
        Err(e) => crate::safe_eprintln!("trace: open failed: {}: {e}", p.display()),
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

// Scrubs the user name out of home directory paths so traces can be shared.
fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let after = &rest[pos + marker.len()..];
            let name_len = after.find(sep).unwrap_or(after.len());
            rest = &after[name_len..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn backtrace_ctx(extra: Option<Value>) -> Option<Value> {
    if !TraceConfig::from_env().backtrace {
        return extra;
    }
    let bt = format!("{:?}", std::backtrace::Backtrace::force_capture());
    let mut m = serde_json::Map::new();
    m.insert(
        "backtrace".to_string(),
        Value::String(clamp_chars(&redact_user_paths(&bt), BACKTRACE_MAX_CHARS)),
    );
    Some(merge_ctx(m, extra))
}

fn merge_ctx(mut base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => {}
        Some(Value::Object(m)) => base.extend(m),
        Some(v) => {
            base.insert("extra".to_string(), v);
        }
    }
    Value::Object(base)
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub launch_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: &'static str,     // start|end|event
    pub status: &'static str, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

/// One-off trace line that is not part of a span.
pub fn event(
    log_dir: &Path,
    launch_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &'static str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        log_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            launch_id: launch_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event",
            status,
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// A timed step. Emits a `start` line on creation and exactly one `end` line,
/// either through `ok`/`skipped`/`err*` or with `aborted` status on drop.
pub struct Span {
    log_dir: PathBuf,
    launch_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        log_dir: &Path,
        launch_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            log_dir: log_dir.to_path_buf(),
            launch_id: launch_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, ctx, false);
        span
    }

    fn emit(
        &self,
        op: &'static str,
        status: &'static str,
        error: Option<TraceError>,
        ctx: Option<Value>,
        timed: bool,
    ) {
        emit_best_effort(
            &self.log_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                launch_id: self.launch_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op,
                status,
                duration_ms: timed.then(|| self.t0.elapsed().as_millis()),
                error,
                ctx,
            },
        );
    }

    fn finish(
        mut self,
        status: &'static str,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        self.finished = true;
        self.emit("end", status, error, ctx, true);
    }

    pub fn ok(self, ctx: Option<Value>) {
        self.finish("ok", None, ctx);
    }

    pub fn skipped(self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.finish("skipped", Some(error), ctx);
    }

    pub fn err(self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.finish("err", Some(error), backtrace_ctx(ctx));
    }

    /// Closes the span with a typed error, using its own kind and code.
    pub fn fail<E: Classified>(self, err: &E, ctx: Option<Value>) {
        let message = err.to_string();
        self.err(err.kind(), err.code(), &message, ctx);
    }

    pub fn err_anyhow(self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let mut m = serde_json::Map::new();
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), serde_json::json!(chain));
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.finish("err", Some(error), backtrace_ctx(Some(merge_ctx(m, ctx))));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.emit("end", "aborted", Some(error), backtrace_ctx(None), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    fn read_lines(dir: &Path) -> Vec<Value> {
        let raw = fs::read_to_string(trace_path(dir)).expect("read trace");
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect()
    }

    #[test]
    fn concurrent_emit_keeps_jsonl_lines_parseable() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().to_path_buf();
        let threads = 8;
        let per_thread = 50;

        let joins: Vec<_> = (0..threads)
            .map(|i| {
                let dir2 = dir.clone();
                thread::spawn(move || {
                    for j in 0..per_thread {
                        event(
                            &dir2,
                            Some("launch-concurrent"),
                            "Deps",
                            "DEP.concurrent",
                            "ok",
                            Some(serde_json::json!({"i": i, "j": j})),
                        );
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().expect("join");
        }

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), threads * per_thread);
        assert!(lines.iter().all(|v| v["step_id"] == "DEP.concurrent"));
    }

    #[test]
    fn dropped_span_is_recorded_as_aborted() {
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _span = Span::start(td.path(), Some("l-1"), "Supervisor", "SUP.ready", None);
        }
        let lines = read_lines(td.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["op"], "start");
        assert_eq!(lines[1]["status"], "aborted");
        assert_eq!(lines[1]["error"]["code"], "ABORTED");
        assert_eq!(lines[1]["launch_id"], "l-1");
    }

    struct Boom;

    impl Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl Classified for Boom {
        fn kind(&self) -> &'static str {
            "process"
        }
        fn code(&self) -> &'static str {
            "E_BOOM"
        }
    }

    #[test]
    fn failed_span_carries_kind_and_code() {
        let td = tempfile::tempdir().expect("tempdir");
        let span = Span::start(td.path(), None, "Deps", "DEP.runtime", None);
        span.fail(&Boom, Some(serde_json::json!({"binary": "fernspielapparat"})));

        let lines = read_lines(td.path());
        let end = &lines[1];
        assert_eq!(end["status"], "err");
        assert_eq!(end["error"]["kind"], "process");
        assert_eq!(end["error"]["code"], "E_BOOM");
        assert_eq!(end["error"]["message"], "boom");
        assert_eq!(end["ctx"]["binary"], "fernspielapparat");
        assert!(end["duration_ms"].is_number());
    }

    #[test]
    fn home_paths_are_redacted() {
        let s = "at /home/alice/src/main.rs and C:\\Users\\bob\\x and /Users/carol/y";
        let out = redact_user_paths(s);
        assert!(!out.contains("alice"));
        assert!(!out.contains("bob"));
        assert!(!out.contains("carol"));
        assert!(out.contains("/home/<redacted>/src/main.rs"));
    }
}
