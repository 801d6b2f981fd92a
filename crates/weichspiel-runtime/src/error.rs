use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use weichspiel_observability::Classified;

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;

/// Everything that can go wrong while locating, installing or starting the runtime.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{what} is not supported by the fernspielapparat runtime")]
    UnsupportedPlatform { what: String },

    #[error("release feed request to {url} failed: {message}")]
    FeedError {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("newest release has no asset for platform {platform}")]
    NoMatchingAsset { platform: String },

    #[error("HTTP request to {url} failed: {message}")]
    NetworkError { url: String, message: String },

    #[error("HTTP request to {url} failed, status: {status_code}")]
    HttpError { url: String, status_code: u16 },

    #[error("gave up on {url} after {limit} redirects")]
    RedirectLimit { url: String, limit: usize },

    #[error("file operation on {} failed: {source}", path.display())]
    FileError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decompress release {}: {message}", archive.display())]
    ExtractError { archive: PathBuf, message: String },

    #[error("could not find {executable} in {}", archive.display())]
    ExecutableNotFound { archive: PathBuf, executable: String },

    #[error("unexpected version output from {binary}: {output:?}")]
    VersionParseError { binary: String, output: String },

    #[error("lacking execution permissions for runtime binary at {}: {message}", path.display())]
    PermissionError { path: PathBuf, message: String },

    #[error("{binary} could not be started: {source}")]
    ProcessSpawnError {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fernspielapparat exited during startup with {}, output: {output:?}", exit_label(*code))]
    ProcessCrashed { code: Option<i32>, output: String },

    #[error("fernspielapparat not reachable after {} ms, output: {output:?}", waited.as_millis())]
    ReadinessTimeout { waited: Duration, output: String },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

impl LaunchError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileError {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn network(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::NetworkError {
            url: url.into(),
            message: err.to_string(),
        }
    }
}

impl Classified for LaunchError {
    fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } | Self::NoMatchingAsset { .. } => "platform",
            Self::FeedError { .. }
            | Self::NetworkError { .. }
            | Self::HttpError { .. }
            | Self::RedirectLimit { .. } => "http",
            Self::FileError { .. } | Self::PermissionError { .. } => "io",
            Self::ExtractError { .. } | Self::ExecutableNotFound { .. } => "archive",
            Self::VersionParseError { .. } => "parse",
            Self::ProcessSpawnError { .. }
            | Self::ProcessCrashed { .. }
            | Self::ReadinessTimeout { .. } => "process",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } => "E_UNSUPPORTED_PLATFORM",
            Self::FeedError { .. } => "E_FEED",
            Self::NoMatchingAsset { .. } => "E_NO_MATCHING_ASSET",
            Self::NetworkError { .. } => "E_NETWORK",
            Self::HttpError { .. } => "E_HTTP",
            Self::RedirectLimit { .. } => "E_REDIRECT_LIMIT",
            Self::FileError { .. } => "E_FILE",
            Self::ExtractError { .. } => "E_EXTRACT",
            Self::ExecutableNotFound { .. } => "E_EXECUTABLE_NOT_FOUND",
            Self::VersionParseError { .. } => "E_VERSION_PARSE",
            Self::PermissionError { .. } => "E_PERMISSION",
            Self::ProcessSpawnError { .. } => "E_PROCESS_SPAWN",
            Self::ProcessCrashed { .. } => "E_PROCESS_CRASHED",
            Self::ReadinessTimeout { .. } => "E_READINESS_TIMEOUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_message_names_exit_code_and_output() {
        let err = LaunchError::ProcessCrashed {
            code: Some(3),
            output: "cannot open phonebook".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "{msg}");
        assert!(msg.contains("cannot open phonebook"), "{msg}");
        assert_eq!(err.code(), "E_PROCESS_CRASHED");
        assert_eq!(err.kind(), "process");
    }

    #[test]
    fn signal_exit_is_labelled() {
        let err = LaunchError::ProcessCrashed {
            code: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("a signal"));
    }
}
