use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    environment::Environment,
    error::{LaunchError, Result},
};

pub const VERSION_FLAG: &str = "--version";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a binary printed when asked for its version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs a binary once with the version flag.
#[async_trait]
pub trait VersionProbe: Send + Sync {
    async fn run(&self, binary: &Path, env: &Environment) -> Result<ProbeOutput>;
}

/// Spawns the real process. `env` is laid over the inherited environment.
#[derive(Debug, Clone, Default)]
pub struct CommandProbe;

#[async_trait]
impl VersionProbe for CommandProbe {
    async fn run(&self, binary: &Path, env: &Environment) -> Result<ProbeOutput> {
        let name = binary.display().to_string();
        let child = Command::new(binary)
            .arg(VERSION_FLAG)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::ProcessSpawnError {
                binary: name.clone(),
                source,
            })?;

        let out = match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
            Ok(res) => res.map_err(|source| LaunchError::ProcessSpawnError {
                binary: name.clone(),
                source,
            })?,
            Err(_) => {
                return Err(LaunchError::VersionParseError {
                    binary: name,
                    output: format!("no answer within {} s", PROBE_TIMEOUT.as_secs()),
                })
            }
        };

        let output = ProbeOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };
        if !out.status.success() {
            return Err(LaunchError::VersionParseError {
                binary: name,
                output: format!("{}, output: {}", out.status, output.combined().trim()),
            });
        }
        Ok(output)
    }
}

/// Parses a `<name> <version>` banner into the version.
pub fn parse_version_banner(binary: &str, output: &str) -> Result<String> {
    let words: Vec<&str> = output.split_whitespace().collect();
    match words.as_slice() {
        [_, version] => Ok((*version).to_string()),
        _ => Err(LaunchError::VersionParseError {
            binary: binary.to_string(),
            output: output.to_string(),
        }),
    }
}

/// Version and voice data directory from an espeak or espeak-ng banner.
pub fn parse_espeak_banner(binary: &str, output: &str) -> Result<(String, String)> {
    let parse_err = || LaunchError::VersionParseError {
        binary: binary.to_string(),
        output: output.to_string(),
    };

    let (_, after_marker) = output.split_once("text-to-speech:").ok_or_else(parse_err)?;
    let version = after_marker
        .split_whitespace()
        .next()
        .ok_or_else(parse_err)?;
    let (_, data) = output.split_once("Data at:").ok_or_else(parse_err)?;
    let directory = data.lines().next().unwrap_or("").trim();
    if directory.is_empty() {
        return Err(parse_err());
    }
    Ok((version.to_string(), directory.to_string()))
}

/// VLC prints its version on the first line, e.g. `VLC media player 3.0.18 Vetinari`.
pub fn parse_vlc_version(binary: &str, stdout: &str) -> Result<String> {
    let first = stdout.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return Err(LaunchError::VersionParseError {
            binary: binary.to_string(),
            output: stdout.to_string(),
        });
    }
    Ok(first.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{fs, path::{Path, PathBuf}};

    /// Writes an executable `sh` script into `dir`.
    #[cfg(unix)]
    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join(name);
        fs::write(&p, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).expect("chmod");
        p
    }
}
