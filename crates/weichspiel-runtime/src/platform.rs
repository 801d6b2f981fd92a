use std::fmt;

use serde::Serialize;

/// Separator between entries of `PATH`-like variables.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: &str = ":";

/// Operating systems the launcher knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
    Other(String),
}

impl Platform {
    pub fn current() -> Self {
        Self::parse(std::env::consts::OS)
    }

    /// Accepts both Rust (`macos`) and Node style (`darwin`, `win32`) names.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "linux" => Self::Linux,
            "macos" | "darwin" => Self::Macos,
            "windows" | "win32" => Self::Windows,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            _ => "",
        }
    }

    pub fn executable_name(&self, stem: &str) -> String {
        format!("{stem}{}", self.executable_suffix())
    }

    /// Case-insensitive pattern a release asset name must match for this platform.
    pub fn asset_pattern(&self) -> Option<&'static str> {
        match self {
            Self::Linux => Some(r"(?i)linux.*\.tar\.gz$"),
            Self::Macos => Some(r"(?i)darwin.*\.tar\.gz$"),
            Self::Windows => Some(r"(?i)msys.*\.tar\.gz$"),
            Self::Other(_) => None,
        }
    }

    /// Whether a missing speech engine is tolerated (the OS has its own synthesis).
    pub fn speech_optional(&self) -> bool {
        matches!(self, Self::Macos | Self::Windows)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Macos => write!(f, "macos"),
            Self::Windows => write!(f, "windows"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// CPU architectures. Only `x86_64` release assets are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Other(String),
}

impl Arch {
    pub fn current() -> Self {
        Self::parse(std::env::consts::ARCH)
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "x64" | "amd64" => Self::X86_64,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::X86_64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}
