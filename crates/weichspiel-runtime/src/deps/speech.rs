use std::path::PathBuf;

use serde_json::json;
use weichspiel_observability::safe_eprintln;

use super::{Dependency, STAGE};
use crate::{
    attempt::Attempt,
    environment::Environment,
    error::Result,
    platform::Platform,
    probe::{parse_espeak_banner, VersionProbe},
};

const ESPEAK: &str = "espeak";

/// espeak on `PATH`, or `None` where the OS has its own speech synthesis.
pub async fn locate_speech(
    platform: &Platform,
    probe: &dyn VersionProbe,
    attempt: &Attempt,
) -> Result<Option<Dependency>> {
    let span = attempt.span(STAGE, "DEP.espeak", None);
    let name = platform.executable_name(ESPEAK);
    let binary = which::which(&name).unwrap_or_else(|_| PathBuf::from(&name));

    match probe_espeak(&binary, probe).await {
        Ok(dep) => {
            span.ok(Some(json!({
                "version": dep.version(),
                "binary": dep.binary().display().to_string(),
            })));
            Ok(Some(dep))
        }
        Err(e) if platform.speech_optional() => {
            safe_eprintln!("deps: espeak unavailable, falling back to system speech: {e}");
            span.skipped("espeak_optional", Some(json!({ "error": e.to_string() })));
            Ok(None)
        }
        Err(e) => {
            span.fail(&e, None);
            Err(e)
        }
    }
}

async fn probe_espeak(binary: &std::path::Path, probe: &dyn VersionProbe) -> Result<Dependency> {
    let out = probe.run(binary, &Environment::new()).await?;
    let (version, directory) = parse_espeak_banner(ESPEAK, &out.stdout)?;
    Ok(Dependency::new(
        version,
        Some(PathBuf::from(directory)),
        binary,
        Environment::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::LaunchError, probe::ProbeOutput};
    use async_trait::async_trait;
    use std::path::Path;

    struct FixedProbe(Option<&'static str>);

    #[async_trait]
    impl VersionProbe for FixedProbe {
        async fn run(&self, binary: &Path, _env: &Environment) -> Result<ProbeOutput> {
            match self.0 {
                Some(stdout) => Ok(ProbeOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
                None => Err(LaunchError::ProcessSpawnError {
                    binary: binary.display().to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    fn attempt(dir: &Path) -> Attempt {
        Attempt::new(dir)
    }

    #[tokio::test]
    async fn banner_yields_version_and_voice_dir() {
        let td = tempfile::tempdir().expect("tempdir");
        let probe = FixedProbe(Some(
            "speak text-to-speech: 1.48.03  04.Mar.14   Data at: /usr/share/espeak-data\n",
        ));
        let dep = locate_speech(&Platform::Linux, &probe, &attempt(td.path()))
            .await
            .expect("locate")
            .expect("present");
        assert_eq!(dep.version(), "1.48.03");
        assert_eq!(dep.directory(), Some(Path::new("/usr/share/espeak-data")));
        assert!(dep.environment().is_empty());
    }

    #[tokio::test]
    async fn missing_espeak_is_fatal_only_where_required() {
        let td = tempfile::tempdir().expect("tempdir");
        let probe = FixedProbe(None);

        let linux = locate_speech(&Platform::Linux, &probe, &attempt(td.path())).await;
        assert!(matches!(linux, Err(LaunchError::ProcessSpawnError { .. })));

        for platform in [Platform::Macos, Platform::Windows] {
            let got = locate_speech(&platform, &probe, &attempt(td.path()))
                .await
                .expect("optional");
            assert!(got.is_none(), "{platform}");
        }
    }
}
