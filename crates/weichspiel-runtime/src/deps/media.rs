use std::path::{Path, PathBuf};

use serde_json::json;

use super::{Dependency, STAGE};
use crate::{
    attempt::Attempt,
    environment::Environment,
    error::Result,
    platform::{Platform, PATH_LIST_SEPARATOR},
    probe::{parse_vlc_version, VersionProbe},
};

const VLC: &str = "vlc";
const PLUGIN_PATH: &str = "VLC_PLUGIN_PATH";

/// Well-known VLC install directories, most likely first. Empty where VLC is
/// expected on `PATH`.
pub fn install_candidates(
    platform: &Platform,
    user_env: &Environment,
    home: Option<&Path>,
) -> Vec<PathBuf> {
    match platform {
        Platform::Macos => {
            let mut dirs = vec![PathBuf::from("/Applications/VLC.app/Contents/MacOS")];
            if let Some(home) = home {
                dirs.push(home.join("Applications/VLC.app/Contents/MacOS"));
            }
            dirs
        }
        Platform::Windows => ["ProgramFiles", "ProgramFiles(x86)"]
            .iter()
            .filter_map(|key| user_env.get(key))
            .filter(|v| !v.is_empty())
            .map(|base| Path::new(base).join("VideoLAN").join("VLC"))
            .collect(),
        _ => Vec::new(),
    }
}

fn mentions_vlc(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.to_ascii_lowercase().contains(VLC))
}

/// Library and plugin search hints for a VLC installed in `dir`.
///
/// Values the user already configured are left alone: a search path that already
/// mentions VLC, or any plugin path at all, suppresses the matching hint.
pub fn hint_environment(platform: &Platform, dir: &Path, user_env: &Environment) -> Environment {
    let mut env = Environment::new();
    let plugin_dir = dir.join("plugins").display().to_string();
    let plugins_unset = user_env.get(PLUGIN_PATH).filter(|v| !v.is_empty()).is_none();

    match platform {
        Platform::Macos => {
            if !mentions_vlc(user_env.get("DYLD_LIBRARY_PATH")) {
                let libs = format!(
                    "{}{PATH_LIST_SEPARATOR}{}",
                    dir.display(),
                    dir.join("lib").display()
                );
                env.set("DYLD_LIBRARY_PATH", libs);
            }
            if plugins_unset {
                env.set(PLUGIN_PATH, plugin_dir);
            }
        }
        Platform::Windows => {
            if !mentions_vlc(user_env.get("Path")) {
                env.set("Path", dir.display().to_string());
            }
            if plugins_unset {
                env.set(PLUGIN_PATH, plugin_dir);
            }
        }
        _ => {}
    }
    env
}

/// VLC is required everywhere; any failure propagates.
pub async fn locate_media(
    platform: &Platform,
    probe: &dyn VersionProbe,
    attempt: &Attempt,
) -> Result<Dependency> {
    let span = attempt.span(STAGE, "DEP.vlc", None);
    let user_env = Environment::from_process();
    let home = dirs::home_dir();
    let exe = platform.executable_name(VLC);

    let candidates = install_candidates(platform, &user_env, home.as_deref());
    let directory = candidates
        .iter()
        .find(|d| d.join(&exe).is_file())
        .or(candidates.first())
        .cloned();
    let (binary, environment) = match &directory {
        Some(dir) => (dir.join(&exe), hint_environment(platform, dir, &user_env)),
        None => (
            which::which(&exe).unwrap_or_else(|_| PathBuf::from(&exe)),
            Environment::new(),
        ),
    };

    let version = match probe.run(&binary, &Environment::new()).await {
        Ok(out) => parse_vlc_version(VLC, &out.stdout),
        Err(e) => Err(e),
    };
    match version {
        Ok(version) => {
            span.ok(Some(json!({
                "version": version,
                "binary": binary.display().to_string(),
                "hints": environment.keys().collect::<Vec<_>>(),
            })));
            Ok(Dependency::new(version, directory, binary, environment))
        }
        Err(e) => {
            span.fail(&e, Some(json!({ "binary": binary.display().to_string() })));
            Err(e)
        }
    }
}
