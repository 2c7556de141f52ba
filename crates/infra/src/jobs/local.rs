//! Filesystem-backed collaborators for single-host deployments and dev.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::debug;

use super::handlers::{FileRemover, ImageStore};

/// Reject anything that could escape the storage root.
fn relative(path: &str) -> anyhow::Result<&Path> {
    let path = Path::new(path);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("path `{}` must stay inside the storage root", path.display());
    }
    Ok(path)
}

/// Writes images under `root/{folder}/{file_name}`. Writing the same job twice
/// overwrites the same file.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn store(&self, bytes: &[u8], file_name: &str, folder: &str) -> anyhow::Result<String> {
        let dir = self.root.join(relative(folder)?);
        let name = relative(file_name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let target = dir.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        debug!(path = %target.display(), size = bytes.len(), "image stored");
        Ok(format!("{}/{}", folder.trim_end_matches('/'), file_name))
    }
}

/// Deletes old files from a folder under `root`, plus any explicit paths.
#[derive(Debug, Clone)]
pub struct LocalFileRemover {
    root: PathBuf,
}

impl LocalFileRemover {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileRemover for LocalFileRemover {
    async fn remove(
        &self,
        folder: &str,
        older_than_days: u32,
        paths: &[String],
    ) -> anyhow::Result<u64> {
        let dir = self.root.join(relative(folder)?);
        let mut removed = 0;

        for path in paths {
            let target = dir.join(relative(path)?);
            match tokio::fs::remove_file(&target).await {
                Ok(()) => removed += 1,
                // Already gone: a repeated run must not fail.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", target.display())),
            }
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(older_than_days) * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            if meta.modified()? <= cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        debug!(folder, removed, "file cleanup finished");
        Ok(removed)
    }
}
