//! Artifact publication.
//!
//! After every run the collector's output files are packed into a zip
//! archive with a JSON manifest beside it. Manifests record when the archive
//! expires; expired archives are pruned whenever a new one is published.

use crate::core::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::write::FileOptions;
use zip::CompressionMethod;

/// Metadata stored next to each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact name.
    pub name: String,
    /// Run that produced the artifact.
    pub run_id: String,
    /// When the archive was written.
    pub created_at: DateTime<Utc>,
    /// When the archive may be deleted.
    pub expires_at: DateTime<Utc>,
    /// Files packed into the archive, in order.
    pub files: Vec<String>,
}

impl ArtifactManifest {
    /// Returns true once `now` is at or past the expiry time.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An archive on disk and its manifest.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Path of the zip archive.
    pub archive: PathBuf,
    /// Path of the JSON manifest.
    pub manifest_path: PathBuf,
    /// Parsed manifest.
    pub manifest: ArtifactManifest,
}

/// Directory of retained artifacts for one artifact name.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    name: String,
    retention: Duration,
}

impl ArtifactStore {
    /// Creates a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            retention,
        }
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Packs whichever of `outputs` exist under `root` into a new archive.
    ///
    /// Missing files are skipped. Returns `None` without writing anything
    /// when none of them exist.
    pub fn publish(
        &self,
        root: &Path,
        outputs: &[String],
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredArtifact>> {
        let present: Vec<&String> = outputs
            .iter()
            .filter(|name| root.join(name.as_str()).is_file())
            .collect();

        if present.is_empty() {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io("create artifact dir", e))?;

        let stem = format!("{}-{run_id}", self.name);
        let archive = self.dir.join(format!("{stem}.zip"));
        let manifest_path = self.dir.join(format!("{stem}.json"));
        let partial = self.dir.join(format!("{stem}.zip.partial"));

        write_archive(root, &present, &partial)?;
        std::fs::rename(&partial, &archive).map_err(|e| Error::io("finalize archive", e))?;

        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::artifact(format!("retention out of range: {e}")))?;
        let manifest = ArtifactManifest {
            name: self.name.clone(),
            run_id: run_id.to_string(),
            created_at: now,
            expires_at: now + retention,
            files: present.iter().map(|s| (*s).clone()).collect(),
        };

        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::artifact(format!("serialize manifest: {e}")))?;
        std::fs::write(&manifest_path, json).map_err(|e| Error::io("write manifest", e))?;

        tracing::info!(
            archive = %archive.display(),
            files = manifest.files.len(),
            expires_at = %manifest.expires_at,
            "Published artifact"
        );

        Ok(Some(StoredArtifact {
            archive,
            manifest_path,
            manifest,
        }))
    }

    /// Lists this store's artifacts, oldest first.
    pub fn list(&self) -> Result<Vec<StoredArtifact>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("read artifact dir", e)),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io("read artifact dir", e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content =
                std::fs::read_to_string(&path).map_err(|e| Error::io("read manifest", e))?;
            let manifest: ArtifactManifest = match serde_json::from_str(&content) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                    continue;
                },
            };

            if manifest.name != self.name {
                continue;
            }

            artifacts.push(StoredArtifact {
                archive: path.with_extension("zip"),
                manifest_path: path,
                manifest,
            });
        }

        artifacts.sort_by(|a, b| a.manifest.created_at.cmp(&b.manifest.created_at));
        Ok(artifacts)
    }

    /// Deletes artifacts whose retention has run out; returns the removed archives.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();

        for artifact in self.list()? {
            if !artifact.manifest.is_expired(now) {
                continue;
            }

            remove_if_present(&artifact.archive)?;
            remove_if_present(&artifact.manifest_path)?;
            tracing::debug!(archive = %artifact.archive.display(), "Pruned expired artifact");
            removed.push(artifact.archive);
        }

        Ok(removed)
    }
}

fn write_archive(root: &Path, files: &[&String], dest: &Path) -> Result<()> {
    let file = File::create(dest).map_err(|e| Error::io("create archive", e))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for name in files {
        let entry = name.replace('\\', "/");
        zip.start_file(entry, options)
            .map_err(|e| Error::artifact(format!("add {name}: {e}")))?;
        let mut src =
            File::open(root.join(name.as_str())).map_err(|e| Error::io("open output file", e))?;
        std::io::copy(&mut src, &mut zip).map_err(|e| Error::io("write archive entry", e))?;
    }

    let mut writer = zip
        .finish()
        .map_err(|e| Error::artifact(format!("finish archive: {e}")))?;
    writer.flush().map_err(|e| Error::io("flush archive", e))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("remove artifact", e)),
    }
}
