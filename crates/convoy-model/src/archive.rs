//! Tar+gzip codec for source transfer and package return.
//!
//! The archive carries the source directory itself: compressing
//! `orders/<id>/src` produces entries prefixed `src/`, so extraction into a
//! task directory recreates `tasks/<id>/src/...` on the agent.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::error::ArchiveError;

/// Compress a directory into a tar.gz archive, rooted at the directory's
/// own name.
pub async fn compress_files(src: &Path) -> Result<Vec<u8>, ArchiveError> {
    let src = src.to_owned();
    spawn_blocking(move || compress_files_sync(&src))
        .await
        .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?
}

/// Decompress a tar.gz archive into a destination directory, rejecting
/// entries that would escape it.
pub async fn decompress_files(data: Vec<u8>, dest: &Path) -> Result<(), ArchiveError> {
    let dest = dest.to_owned();
    spawn_blocking(move || decompress_files_sync(&data, &dest))
        .await
        .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?
}

fn compress_files_sync(src: &Path) -> Result<Vec<u8>, ArchiveError> {
    if !src.is_dir() {
        return Err(ArchiveError::Unreadable(format!(
            "{} is not a directory",
            src.display()
        )));
    }

    let root = src
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArchiveError::Unreadable(format!("{} has no name", src.display())))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    {
        let mut builder = tar::Builder::new(&mut encoder);
        builder.follow_symlinks(false);

        // The root entry keeps empty directories extractable.
        builder.append_dir(&root, src)?;

        for path in walkdir(src)? {
            let relative = path
                .strip_prefix(src)
                .map_err(|e| ArchiveError::Unreadable(e.to_string()))?;
            let name = root.join(relative);

            if path.is_file() {
                builder.append_path_with_name(&path, name)?;
            } else if path.is_dir() {
                builder.append_dir(name, &path)?;
            }
        }

        builder.finish()?;
    }

    let compressed = encoder.finish()?;
    debug!(
        src = %src.display(),
        compressed_size = compressed.len(),
        "compressed archive"
    );

    Ok(compressed)
}

fn decompress_files_sync(data: &[u8], dest: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(dest)?;

    let decoder = GzDecoder::new(Cursor::new(data));
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::Unreadable(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Unreadable(e.to_string()))?;
        let raw_path = entry
            .path()
            .map_err(|e| ArchiveError::Unreadable(e.to_string()))?
            .into_owned();

        let safe = sanitize(&raw_path)
            .ok_or_else(|| ArchiveError::PathEscape(raw_path.display().to_string()))?;
        let target = dest.join(safe);

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            // Links and specials never belong in a source archive.
            return Err(ArchiveError::PathEscape(raw_path.display().to_string()));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        let mut file = std::fs::File::create(&target)?;
        file.write_all(&contents)?;
    }

    debug!(dest = %dest.display(), compressed_size = data.len(), "decompressed archive");
    Ok(())
}

/// Strip a tar entry path down to plain relative components.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn walkdir(path: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        paths.push(path.clone());
        if path.is_dir() {
            paths.extend(walkdir(&path)?);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn compress_and_decompress_directory() {
        let work = TempDir::new().expect("tempdir");
        let src = work.path().join("src");
        std::fs::create_dir(&src).expect("mkdir");
        std::fs::write(src.join("run.sh"), "echo hi").expect("write");
        std::fs::create_dir(src.join("conf")).expect("mkdir");
        std::fs::write(src.join("conf/app.toml"), "port = 80").expect("write");

        let archive = compress_files(&src).await.expect("compress");
        assert!(!archive.is_empty());

        let dest = TempDir::new().expect("tempdir");
        decompress_files(archive, dest.path()).await.expect("decompress");

        let restored = dest.path().join("src");
        assert_eq!(
            std::fs::read_to_string(restored.join("run.sh")).expect("read"),
            "echo hi"
        );
        assert_eq!(
            std::fs::read_to_string(restored.join("conf/app.toml")).expect("read"),
            "port = 80"
        );
    }

    #[tokio::test]
    async fn empty_directory_roundtrip() {
        let work = TempDir::new().expect("tempdir");
        let src = work.path().join("src");
        std::fs::create_dir(&src).expect("mkdir");

        let archive = compress_files(&src).await.expect("compress");
        let dest = TempDir::new().expect("tempdir");
        decompress_files(archive, dest.path()).await.expect("decompress");
        assert!(dest.path().join("src").is_dir());
    }

    #[tokio::test]
    async fn garbage_bytes_are_unreadable() {
        let dest = TempDir::new().expect("tempdir");
        let result = decompress_files(vec![0, 1, 2, 3], dest.path()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_source_is_unreadable() {
        let result = compress_files(Path::new("/nonexistent/source/dir")).await;
        assert!(matches!(result, Err(ArchiveError::Unreadable(_))));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize(Path::new("../evil")).is_none());
        assert!(sanitize(Path::new("/etc/passwd")).is_none());
        assert!(sanitize(Path::new("a/../../b")).is_none());
        assert_eq!(
            sanitize(Path::new("./src/run.sh")),
            Some(PathBuf::from("src/run.sh"))
        );
    }
}
