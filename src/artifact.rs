//! Artifact staging.
//!
//! A unit's packaged artifact is fetched once per definition at define time
//! into `<base>/apps/<definition>/` and extracted per instance at configure
//! time into `<base>/apps/<definition>/<name>/`.
//!
//! ## Supported References
//!
//! | Reference                 | Fetch                          |
//! |---------------------------|--------------------------------|
//! | `http://…`, `https://…`   | streamed download (reqwest)    |
//! | `file:///abs/path`        | local copy                     |
//! | `/abs/path`               | local copy                     |
//!
//! ## Supported Archives
//!
//! `.tar.gz`/`.tgz` and `.tar` are unpacked in-process with path traversal
//! checks; `.zip` is handed to `unzip` (or `Expand-Archive` on Windows).

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info};

use crate::constants::{MAX_ARTIFACT_SIZE, MAX_EXTRACTED_SIZE};
use crate::error::{Error, Result};
use crate::script::ScriptFamily;
use crate::unit::UnitDefinition;

/// Archive formats the stager can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Guesses the format from the file name.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Remote(String),
    Local(PathBuf),
}

impl ArtifactSource {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            Ok(Self::Remote(reference.to_string()))
        } else if let Some(path) = reference.strip_prefix("file://") {
            Ok(Self::Local(PathBuf::from(path)))
        } else if Path::new(reference).is_absolute() {
            Ok(Self::Local(PathBuf::from(reference)))
        } else {
            Err(Error::ArtifactFailed {
                reference: reference.to_string(),
                reason: "unsupported reference (expected http(s)://, file:// or an absolute path)"
                    .to_string(),
            })
        }
    }
}

/// Fetches and unpacks unit artifacts under the `apps/` directory.
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    apps_dir: PathBuf,
    client: reqwest::Client,
    max_artifact_size: u64,
    family: ScriptFamily,
}

impl ArtifactStager {
    pub fn new(apps_dir: impl Into<PathBuf>, download_timeout: Duration, family: ScriptFamily) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            apps_dir: apps_dir.into(),
            client,
            max_artifact_size: MAX_ARTIFACT_SIZE,
            family,
        })
    }

    /// `<apps>/<definition>`
    pub fn staging_dir(&self, definition_id: &str) -> PathBuf {
        self.apps_dir.join(definition_id)
    }

    /// `<apps>/<definition>/<name>`
    pub fn instance_dir(&self, definition_id: &str, name: &str) -> PathBuf {
        self.staging_dir(definition_id).join(name)
    }

    /// `<apps>/<definition>/<artifact file name>`
    pub fn archive_path(&self, unit: &UnitDefinition) -> Option<PathBuf> {
        unit.artifact_name()
            .map(|name| self.staging_dir(&unit.fdu_id).join(name))
    }

    /// Creates the staging directory and fetches the artifact into it.
    ///
    /// Returns the staging directory when the unit has an artifact. An archive
    /// already staged by a sibling instance is reused.
    pub async fn stage(&self, unit: &UnitDefinition) -> Result<Option<PathBuf>> {
        let dir = self.staging_dir(&unit.fdu_id);
        tokio::fs::create_dir_all(&dir).await?;

        let (Some(reference), Some(archive)) = (unit.image.as_deref(), self.archive_path(unit)) else {
            return Ok(None);
        };

        if archive.is_file() {
            debug!(definition = %unit.fdu_id, archive = %archive.display(), "artifact already staged");
            return Ok(Some(dir));
        }

        // Fetch into a unique temp name so concurrent siblings never see a partial file.
        let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        let fetched = match ArtifactSource::parse(reference)? {
            ArtifactSource::Remote(url) => self.download(&url, &tmp).await,
            ArtifactSource::Local(path) => self.copy(reference, &path, &tmp).await,
        };
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &archive).await?;

        info!(definition = %unit.fdu_id, reference = %reference, "artifact staged");
        Ok(Some(dir))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let failed = |reason: String| Error::ArtifactFailed {
            reference: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        if let Some(len) = response.content_length()
            && len > self.max_artifact_size
        {
            return Err(Error::ArtifactTooLarge {
                size: len,
                limit: self.max_artifact_size,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            written += chunk.len() as u64;
            if written > self.max_artifact_size {
                return Err(Error::ArtifactTooLarge {
                    size: written,
                    limit: self.max_artifact_size,
                });
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        debug!(url = %url, bytes = written, "artifact downloaded");
        Ok(())
    }

    async fn copy(&self, reference: &str, src: &Path, dest: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(src).await.map_err(|e| Error::ArtifactFailed {
            reference: reference.to_string(),
            reason: format!("{}: {}", src.display(), e),
        })?;
        if !meta.is_file() {
            return Err(Error::ArtifactFailed {
                reference: reference.to_string(),
                reason: format!("{} is not a regular file", src.display()),
            });
        }
        if meta.len() > self.max_artifact_size {
            return Err(Error::ArtifactTooLarge {
                size: meta.len(),
                limit: self.max_artifact_size,
            });
        }
        tokio::fs::copy(src, dest).await?;
        Ok(())
    }

    /// Unpacks the staged artifact of `unit` into `dest`.
    pub async fn extract(&self, unit: &UnitDefinition, dest: &Path) -> Result<()> {
        let Some(archive) = self.archive_path(unit) else {
            return Ok(());
        };
        let name = unit.artifact_name().unwrap_or_default();
        let format = ArchiveFormat::from_name(name).ok_or_else(|| Error::ArtifactFailed {
            reference: name.to_string(),
            reason: "unknown archive format".to_string(),
        })?;

        tokio::fs::create_dir_all(dest).await?;
        match format {
            ArchiveFormat::TarGz | ArchiveFormat::Tar => {
                let archive_path = archive.clone();
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || unpack_tar(&archive_path, &dest, format == ArchiveFormat::TarGz))
                    .await
                    .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;
            }
            ArchiveFormat::Zip => self.unzip(&archive, dest).await?,
        }

        info!(definition = %unit.fdu_id, dest = %dest.display(), "artifact extracted");
        Ok(())
    }

    async fn unzip(&self, archive: &Path, dest: &Path) -> Result<()> {
        let mut cmd = match self.family {
            ScriptFamily::Posix => {
                let mut c = tokio::process::Command::new("unzip");
                c.arg("-o").arg("-q").arg(archive).arg("-d").arg(dest);
                c
            }
            ScriptFamily::PowerShell => {
                let mut c = tokio::process::Command::new("PowerShell");
                c.arg("-Command").arg(format!(
                    "Expand-Archive -Force -Path '{}' -DestinationPath '{}'",
                    archive.display(),
                    dest.display()
                ));
                c
            }
        };
        let output = cmd.output().await.map_err(|e| Error::ArtifactFailed {
            reference: archive.display().to_string(),
            reason: format!("cannot run extractor: {}", e),
        })?;
        if !output.status.success() {
            return Err(Error::ArtifactFailed {
                reference: archive.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Removes the staging directory of a definition.
    pub fn remove_staging(&self, definition_id: &str) -> Result<()> {
        let dir = self.staging_dir(definition_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// True if `path` stays below the extraction root.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpacks a (gzipped) tarball into `dest`, rejecting escaping entries.
pub fn unpack_tar(archive: &Path, dest: &Path, gzipped: bool) -> Result<u64> {
    let file = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let failed = |e: std::io::Error| Error::ArtifactFailed {
        reference: archive.display().to_string(),
        reason: e.to_string(),
    };

    let mut tar = Archive::new(reader);
    let mut total = 0u64;
    for entry in tar.entries().map_err(failed)? {
        let mut entry = entry.map_err(failed)?;
        let path = entry.path().map_err(failed)?.into_owned();

        // SECURITY: no absolute paths or parent components.
        if !is_contained(&path) {
            return Err(Error::PathTraversal {
                path: path.display().to_string(),
            });
        }
        if matches!(entry.header().entry_type(), EntryType::Symlink | EntryType::Link)
            && let Some(target) = entry.link_name().map_err(failed)?
        {
            let resolved = path.parent().unwrap_or(Path::new("")).join(&target);
            let escapes = target.is_absolute() || !stays_below(&resolved);
            if escapes {
                return Err(Error::PathTraversal {
                    path: format!("{} -> {}", path.display(), target.display()),
                });
            }
        }

        total += entry.size();
        if total > MAX_EXTRACTED_SIZE {
            return Err(Error::ArtifactTooLarge {
                size: total,
                limit: MAX_EXTRACTED_SIZE,
            });
        }

        entry.unpack_in(dest).map_err(failed)?;
    }
    Ok(total)
}

/// True if resolving `..` lexically never climbs above the root.
fn stays_below(path: &Path) -> bool {
    let mut depth = 0i32;
    for c in path.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_format_from_name() {
        assert_eq!(ArchiveFormat::from_name("app.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("APP.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("app.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("app.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("app.rar"), None);
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(
            ArtifactSource::parse("https://h/a.tgz").unwrap(),
            ArtifactSource::Remote("https://h/a.tgz".to_string())
        );
        assert_eq!(
            ArtifactSource::parse("file:///srv/a.tgz").unwrap(),
            ArtifactSource::Local(PathBuf::from("/srv/a.tgz"))
        );
        assert!(ArtifactSource::parse("ftp://h/a.tgz").is_err());
        assert!(ArtifactSource::parse("relative/a.tgz").is_err());
    }

    #[test]
    fn test_containment_checks() {
        assert!(is_contained(Path::new("bin/app")));
        assert!(is_contained(Path::new("./bin/app..bak")));
        assert!(!is_contained(Path::new("../etc/passwd")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(stays_below(Path::new("a/b/../c")));
        assert!(!stays_below(Path::new("a/../../c")));
    }
}
