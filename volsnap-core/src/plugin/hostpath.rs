/*!
Reference backend archiving host directories.

A snapshot of a `HostPath` volume is a gzip-compressed tarball
`<archive_dir>/<uuid>.tgz` plus a sidecar `<uuid>.json` recording the tag set,
the source path and the SHA-256 of the archive. Finding a snapshot by tags
scans the sidecars.

The tarball is written under a `.partial` name and only renamed into place
after its sidecar exists, so every published archive can be found by tags.
A failed create removes whatever it wrote.
*/

use super::{CreatedSnapshot, SnapshotDescription, SnapshotPlugin};
use crate::config::BackendConfig;
use crate::model::{
    BackendKind, Condition, SnapshotData, SnapshotSource, SnapshotTags, Volume, VolumeSource,
};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};

const ARCHIVE_EXTENSION: &str = "tgz";
const SIDECAR_EXTENSION: &str = "json";
const PARTIAL_EXTENSION: &str = "partial";

/// Metadata stored next to each archive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSidecar {
    pub tags: SnapshotTags,
    pub source_path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Snapshots host-path volumes into a local archive directory
#[derive(Debug, Default)]
pub struct HostPathPlugin {
    archive_dir: OnceLock<PathBuf>,
}

impl HostPathPlugin {
    /// Plugin that must be bound with [`SnapshotPlugin::init`] before use
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin already bound to `archive_dir`; the directory is created lazily
    pub fn with_archive_dir(archive_dir: impl Into<PathBuf>) -> Self {
        let plugin = Self::new();
        let _ = plugin.archive_dir.set(archive_dir.into());
        plugin
    }

    fn archive_dir(&self) -> Result<&Path> {
        self.archive_dir
            .get()
            .map(PathBuf::as_path)
            .ok_or_else(|| SnapshotError::config("hostPath plugin used before init"))
    }

    /// Resolve a snapshot source to an archive inside our directory
    fn owned_archive(&self, source: &SnapshotSource) -> Result<PathBuf> {
        let SnapshotSource::HostPath { path } = source else {
            return Err(SnapshotError::rejected(
                BackendKind::HostPath.as_str(),
                format!("not a hostPath snapshot: {}", source.kind()),
            ));
        };
        let archive = PathBuf::from(path);
        let archive_dir = self.archive_dir()?;
        if archive.parent() != Some(archive_dir)
            || archive.extension().and_then(|ext| ext.to_str()) != Some(ARCHIVE_EXTENSION)
        {
            return Err(SnapshotError::rejected(
                BackendKind::HostPath.as_str(),
                format!("{path} is not an archive managed by this plugin"),
            ));
        }
        Ok(archive)
    }
}

fn io_error(context: &str, e: std::io::Error) -> SnapshotError {
    SnapshotError::backend(BackendKind::HostPath.as_str(), format!("{context}: {e}"))
}

fn join_error(e: tokio::task::JoinError) -> SnapshotError {
    SnapshotError::backend(
        BackendKind::HostPath.as_str(),
        format!("archive task failed: {e}"),
    )
}

/// Write `source_dir` into a gzip tarball at `target`, returning its digest and size
fn write_tarball(source_dir: &Path, target: &Path) -> std::io::Result<(String, u64)> {
    {
        let file = File::create(target)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", source_dir)?;
        builder.into_inner()?.finish()?.flush()?;
    }

    let mut hasher = Sha256::new();
    let mut reader = BufReader::new(File::open(target)?);
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    let size = std::fs::metadata(target)?.len();
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Archive `source_dir` as `archive`, publishing its sidecar first
fn publish_archive(
    source_dir: &Path,
    archive: &Path,
    tags: SnapshotTags,
) -> std::io::Result<ArchiveSidecar> {
    let partial = archive.with_extension(PARTIAL_EXTENSION);
    let sidecar_path = archive.with_extension(SIDECAR_EXTENSION);
    let sidecar_tmp = sidecar_path.with_extension("tmp");

    let published = write_tarball(source_dir, &partial).and_then(|(sha256, size_bytes)| {
        let sidecar = ArchiveSidecar {
            tags,
            source_path: source_dir.to_string_lossy().into_owned(),
            sha256,
            size_bytes,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_vec_pretty(&sidecar).map_err(std::io::Error::other)?;
        std::fs::write(&sidecar_tmp, raw)?;
        std::fs::rename(&sidecar_tmp, &sidecar_path)?;
        std::fs::rename(&partial, archive)?;
        Ok(sidecar)
    });

    if published.is_err() {
        for leftover in [&partial, &sidecar_tmp, &sidecar_path] {
            if let Err(e) = remove_if_present(leftover) {
                warn!(path = %leftover.display(), error = %e, "Could not clean up failed archive");
            }
        }
    }
    published
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn find_by_tags(archive_dir: &Path, tags: &SnapshotTags) -> std::io::Result<Option<PathBuf>> {
    if !archive_dir.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(archive_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SIDECAR_EXTENSION) {
            continue;
        }
        let sidecar: ArchiveSidecar = match std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_slice(&raw).map_err(|e| e.to_string()))
        {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable sidecar");
                continue;
            }
        };
        let archive = path.with_extension(ARCHIVE_EXTENSION);
        if &sidecar.tags == tags && archive.is_file() {
            return Ok(Some(archive));
        }
    }
    Ok(None)
}

#[async_trait]
impl SnapshotPlugin for HostPathPlugin {
    fn kind(&self) -> BackendKind {
        BackendKind::HostPath
    }

    async fn init(&self, provider: &BackendConfig) -> Result<()> {
        let BackendConfig::HostPath { archive_dir } = provider else {
            return Err(SnapshotError::config(
                "hostPath plugin needs a hostPath backend configuration",
            ));
        };
        tokio::fs::create_dir_all(archive_dir).await.map_err(|e| {
            SnapshotError::config(format!(
                "Cannot create archive directory {}: {e}",
                archive_dir.display()
            ))
        })?;
        if self.archive_dir.set(archive_dir.clone()).is_err() && self.archive_dir()? != archive_dir
        {
            return Err(SnapshotError::config(
                "hostPath plugin is already bound to another archive directory",
            ));
        }
        info!(archive_dir = %archive_dir.display(), "hostPath plugin initialized");
        Ok(())
    }

    #[instrument(skip(self, tags), fields(volume = %volume.name()))]
    async fn snapshot_create(
        &self,
        volume: &Volume,
        tags: &SnapshotTags,
    ) -> Result<CreatedSnapshot> {
        let VolumeSource::HostPath { path } = &volume.source else {
            return Err(SnapshotError::rejected(
                BackendKind::HostPath.as_str(),
                format!("volume {} is not a hostPath volume", volume.name()),
            ));
        };
        let source_dir = PathBuf::from(path);
        if !tokio::fs::metadata(&source_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(SnapshotError::rejected(
                BackendKind::HostPath.as_str(),
                format!("source directory {path} does not exist"),
            ));
        }

        let archive_dir = self.archive_dir()?.to_path_buf();
        tokio::fs::create_dir_all(&archive_dir)
            .await
            .map_err(|e| io_error("cannot create archive directory", e))?;

        let id = uuid::Uuid::new_v4();
        let archive = archive_dir.join(format!("{id}.{ARCHIVE_EXTENSION}"));

        let archive_target = archive.clone();
        let wanted = tags.clone();
        let sidecar = tokio::task::spawn_blocking(move || {
            publish_archive(&source_dir, &archive_target, wanted)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| io_error("archiving failed", e))?;

        info!(
            archive = %archive.display(),
            size_bytes = sidecar.size_bytes,
            "Archived host path"
        );
        Ok(CreatedSnapshot {
            source: SnapshotSource::HostPath {
                path: archive.to_string_lossy().into_owned(),
            },
            conditions: vec![Condition::ready("Snapshot created successfully")],
        })
    }

    async fn snapshot_delete(&self, source: &SnapshotSource) -> Result<()> {
        let archive = self.owned_archive(source)?;
        let sidecar = archive.with_extension(SIDECAR_EXTENSION);
        tokio::task::spawn_blocking(move || {
            remove_if_present(&archive)?;
            remove_if_present(&sidecar)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| io_error("cannot delete archive", e))?;
        debug!(source = source.id(), "Deleted host path archive");
        Ok(())
    }

    async fn describe_snapshot(&self, data: &SnapshotData) -> Result<SnapshotDescription> {
        let archive = self.owned_archive(&data.spec.source)?;
        let condition = match tokio::fs::metadata(&archive).await {
            Ok(meta) if meta.is_file() => Condition::ready("Snapshot created successfully"),
            Ok(_) => Condition::error("ArchiveInvalid", "archive path is not a file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Condition::error("ArchiveMissing", "archive no longer exists")
            }
            Err(e) => return Err(io_error("cannot stat archive", e)),
        };
        Ok(SnapshotDescription {
            conditions: vec![condition],
            complete: true,
        })
    }

    async fn find_snapshot(&self, tags: &SnapshotTags) -> Result<Option<CreatedSnapshot>> {
        let archive_dir = self.archive_dir()?.to_path_buf();
        let wanted = tags.clone();
        let found = tokio::task::spawn_blocking(move || find_by_tags(&archive_dir, &wanted))
            .await
            .map_err(join_error)?
            .map_err(|e| io_error("cannot scan archives", e))?;

        Ok(found.map(|archive| CreatedSnapshot {
            source: SnapshotSource::HostPath {
                path: archive.to_string_lossy().into_owned(),
            },
            conditions: vec![Condition::ready("Snapshot created successfully")],
        }))
    }

    async fn volume_delete(&self, volume: &Volume) -> Result<()> {
        let VolumeSource::HostPath { path } = &volume.source else {
            return Err(SnapshotError::rejected(
                BackendKind::HostPath.as_str(),
                format!("volume {} is not a hostPath volume", volume.name()),
            ));
        };
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(io_error("cannot delete volume directory", e))
            }
            _ => Ok(()),
        }
    }
}
