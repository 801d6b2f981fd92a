use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::{
    error::{LaunchError, Result},
    platform::Platform,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledExecutable {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Exact,
    Variant,
}

/// Extracts the runtime executable from a `.tar.gz` into `install_dir`.
///
/// Only the entry named like the executable is written; everything else in the
/// archive is skipped. Runs on the blocking pool.
pub async fn install_executable(
    archive: &Path,
    install_dir: &Path,
    platform: &Platform,
    stem: &str,
) -> Result<InstalledExecutable> {
    let archive = archive.to_path_buf();
    let install_dir = install_dir.to_path_buf();
    let platform = platform.clone();
    let stem = stem.to_string();
    let archive_for_err = archive.clone();
    tokio::task::spawn_blocking(move || extract_executable(&archive, &install_dir, &platform, &stem))
        .await
        .map_err(|e| LaunchError::ExtractError {
            archive: archive_for_err,
            message: format!("extraction task failed: {e}"),
        })?
}

pub fn extract_executable(
    archive: &Path,
    install_dir: &Path,
    platform: &Platform,
    stem: &str,
) -> Result<InstalledExecutable> {
    let canonical = platform.executable_name(stem);
    // The same binary under the other platform's suffix, accepted as a fallback.
    let variant = if platform.executable_suffix().is_empty() {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    };

    let file = File::open(archive).map_err(|e| LaunchError::file(archive, e))?;
    fs::create_dir_all(install_dir).map_err(|e| LaunchError::file(install_dir, e))?;
    let staging = install_dir.join(format!(".{canonical}.installing"));

    let extracted = extract_into(file, &staging, &canonical, &variant);
    let found = match extracted {
        Ok(found) => found,
        Err(message) => {
            let _ = fs::remove_file(&staging);
            return Err(LaunchError::ExtractError {
                archive: archive.to_path_buf(),
                message,
            });
        }
    };
    if found.is_none() {
        let _ = fs::remove_file(&staging);
        return Err(LaunchError::ExecutableNotFound {
            archive: archive.to_path_buf(),
            executable: canonical,
        });
    }

    let target = install_dir.join(&canonical);
    let finalized = make_executable(&staging).and_then(|()| fs::rename(&staging, &target));
    if let Err(e) = finalized {
        let _ = fs::remove_file(&staging);
        return Err(LaunchError::file(&target, e));
    }

    let sha256 = sha256_file(&target).map_err(|e| LaunchError::file(&target, e))?;
    Ok(InstalledExecutable {
        path: target,
        sha256,
    })
}

fn extract_into(
    file: File,
    staging: &Path,
    canonical: &str,
    variant: &str,
) -> std::result::Result<Option<Match>, String> {
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let entries = tar.entries().map_err(|e| e.to_string())?;

    let mut found = None;
    for entry in entries {
        let mut entry = entry.map_err(|e| e.to_string())?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let kind = {
            let path = entry.path().map_err(|e| e.to_string())?;
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name == canonical => Match::Exact,
                Some(name) if name == variant => Match::Variant,
                _ => continue,
            }
        };
        // An exact match is final; a variant only fills the slot while it is empty.
        if found == Some(Match::Exact) || (kind == Match::Variant && found.is_some()) {
            continue;
        }

        let mut out = File::create(staging).map_err(|e| e.to_string())?;
        io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;
        out.sync_all().map_err(|e| e.to_string())?;
        found = Some(kind);
    }
    Ok(found)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{fs::File, path::Path};

    use flate2::{write::GzEncoder, Compression};

    /// Writes a `.tar.gz` holding the given `(name, contents)` entries in order.
    pub(crate) fn write_tarball(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(dest).expect("create tarball");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).expect("append");
        }
        let gz = builder.into_inner().expect("finish tar");
        gz.finish().expect("finish gz");
    }
}
