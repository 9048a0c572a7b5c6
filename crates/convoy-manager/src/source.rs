//! Source acquisition for order staging.
//!
//! A source is staged exactly once, into `orders/<id>/src/`, and the
//! descriptor is discarded from the order before it is persisted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

/// Directory name sources stage into, below the order directory.
pub const SOURCE_DIR: &str = "src";

/// Errors raised while staging a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A listed path does not exist.
    #[error("source path not found: {0}")]
    PathNotFound(PathBuf),

    /// The zip payload could not be extracted.
    #[error("unreadable zip archive: {0}")]
    Zip(String),

    /// The git checkout failed.
    #[error("git checkout failed: {0}")]
    Git(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an order's files come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    /// Local files or directories, copied as-is.
    Paths {
        /// Files and directories to copy.
        list: Vec<PathBuf>,
    },

    /// A zip archive carried inline.
    Zip {
        /// Archive bytes, base64 in transit.
        #[serde(with = "convoy_model::base64_bytes")]
        bytes: Vec<u8>,
    },

    /// A git repository, shallow-cloned.
    Git {
        /// Clone URL.
        url: String,

        /// Branch or tag to check out; the remote default when absent.
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

impl Source {
    /// Stage this source into `order_dir/src/`.
    pub async fn stage(&self, order_dir: &Path) -> Result<(), SourceError> {
        let dest = order_dir.join(SOURCE_DIR);
        tokio::fs::create_dir_all(&dest).await?;

        match self {
            Self::Paths { list } => stage_paths(list, &dest).await,
            Self::Zip { bytes } => stage_zip(bytes.clone(), &dest).await,
            Self::Git { url, reference } => stage_git(url, reference.as_deref(), &dest).await,
        }
    }
}

async fn stage_paths(list: &[PathBuf], dest: &Path) -> Result<(), SourceError> {
    for path in list {
        if !path.exists() {
            return Err(SourceError::PathNotFound(path.clone()));
        }
        let name = path
            .file_name()
            .ok_or_else(|| SourceError::PathNotFound(path.clone()))?;
        copy_recursive(path, &dest.join(name)).await?;
    }
    debug!(count = list.len(), dest = %dest.display(), "copied source paths");
    Ok(())
}

async fn copy_recursive(from: &Path, to: &Path) -> Result<(), SourceError> {
    if from.is_dir() {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            Box::pin(copy_recursive(&entry.path(), &to.join(name))).await?;
        }
    } else {
        tokio::fs::copy(from, to).await?;
    }
    Ok(())
}

async fn stage_zip(bytes: Vec<u8>, dest: &Path) -> Result<(), SourceError> {
    let dest = dest.to_owned();
    spawn_blocking(move || {
        let reader = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(reader).map_err(|e| SourceError::Zip(e.to_string()))?;
        archive
            .extract(&dest)
            .map_err(|e| SourceError::Zip(e.to_string()))
    })
    .await
    .map_err(|e| SourceError::Io(std::io::Error::other(e)))?
}

async fn stage_git(url: &str, reference: Option<&str>, dest: &Path) -> Result<(), SourceError> {
    let mut cmd = Command::new("git");
    cmd.arg("clone").arg("--depth").arg("1");
    if let Some(reference) = reference {
        cmd.arg("--branch").arg(reference);
    }
    cmd.arg(url).arg(dest);

    info!(url = %url, reference = ?reference, "cloning source repository");

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Git(stderr.trim().to_owned()));
    }
    Ok(())
}
