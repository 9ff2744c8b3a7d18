use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{RelayError, Result};

/// Stat a path, mapping "does not exist" to `None`
pub async fn stat_if_exists(path: &Path) -> Result<Option<Metadata>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RelayError::io("stat", path, e)),
    }
}

/// Copy `src` to `dest`, creating the destination directory.
///
/// The copy is only considered complete once the number of bytes written
/// matches the source size and the destination has been flushed to disk.
/// A failed copy removes whatever it wrote to `dest`.
pub async fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    let src_size = fs::metadata(src)
        .await
        .map_err(|e| RelayError::io("stat", src, e))?
        .len();

    let mut src_file = fs::File::open(src)
        .await
        .map_err(|e| RelayError::io("open", src, e))?;

    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| RelayError::io("create directory", dir, e))?;
    }

    let mut dest_file = fs::File::create(dest)
        .await
        .map_err(|e| RelayError::io("create", dest, e))?;

    if let Err(e) = write_all(&mut src_file, &mut dest_file, src, dest, src_size).await {
        drop(dest_file);
        if let Err(cleanup) = remove_if_exists(dest).await {
            warn!("unable to remove partial copy {}: {}", dest.display(), cleanup);
        }
        return Err(e);
    }

    debug!("copied {} bytes from {} to {}", src_size, src.display(), dest.display());
    Ok(src_size)
}

async fn write_all(
    src_file: &mut fs::File,
    dest_file: &mut fs::File,
    src: &Path,
    dest: &Path,
    src_size: u64,
) -> Result<()> {
    let written = tokio::io::copy(src_file, dest_file)
        .await
        .map_err(|e| RelayError::Io {
            context: format!("unable to copy {} to {}", src.display(), dest.display()),
            source: e,
        })?;
    if written != src_size {
        return Err(RelayError::inconsistency(format!(
            "copied the wrong number of bytes ({} instead of {}) from {} to {}",
            written,
            src_size,
            src.display(),
            dest.display()
        )));
    }

    dest_file.flush().await.map_err(|e| RelayError::io("flush", dest, e))?;
    dest_file.sync_all().await.map_err(|e| RelayError::io("sync", dest, e))
}

/// Move a file by copying it and then removing the source.
///
/// Claim, work and failed directories can live on different volumes, so a
/// plain rename is not enough.
pub async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    copy_file(src, dest).await?;
    fs::remove_file(src)
        .await
        .map_err(|e| RelayError::io("remove", src, e))
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RelayError::io("remove", path, e)),
    }
}

/// True when the base name starts with a dot
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
