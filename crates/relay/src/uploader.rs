//! Resumable upload of a transcoded video into a media library.
//!
//! Every step first checks whether its outcome is already in place, so the
//! step can be re-run from the top after a crash at any point:
//!
//! 1. copy the transcoded file onto the library share
//! 2. refresh the library until it lists the video
//! 3. remove the transcoded file
//! 4. remove the original raw file

use std::path::{Path, PathBuf};
use std::time::Duration;

use humansize::{format_size, DECIMAL};
use log::{info, warn};

use crate::error::{RelayError, Result};
use crate::fsutil::{copy_file, remove_if_exists, stat_if_exists};
use crate::plex::MediaLibrary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Transcoded file produced by the transcode job
    pub transcoded: PathBuf,
    /// Original file that was claimed from the watch directory
    pub raw: PathBuf,
    /// Mounted directory that backs the library
    pub share: PathBuf,
}

impl UploadRequest {
    pub fn filename(&self) -> Result<String> {
        self.transcoded
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RelayError::invalid_argument(format!("{} has no file name", self.transcoded.display()))
            })
    }

    /// Where the video ends up on the share
    pub fn upload_path(&self) -> Result<PathBuf> {
        Ok(self.share.join(self.filename()?))
    }
}

/// How long to wait for the library to pick up a new video after a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

/// Which steps actually did something on this run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: bool,
    pub refreshed: bool,
    pub removed_transcoded: bool,
    pub removed_raw: bool,
}

async fn should_upload(transcoded: &Path, upload_path: &Path) -> Result<bool> {
    let dest = stat_if_exists(upload_path).await?;
    let src = stat_if_exists(transcoded).await?;

    match (src, dest) {
        (None, None) => Err(RelayError::inconsistency(format!(
            "the transcoded video {} is missing and {} was never uploaded",
            transcoded.display(),
            upload_path.display()
        ))),
        (None, Some(_)) => {
            info!("the transcoded video is gone and was found on the library share, skipping upload");
            Ok(false)
        }
        (Some(_), None) => {
            info!("the video is not on the library share and must be uploaded");
            Ok(true)
        }
        (Some(src), Some(dest)) if src.len() > dest.len() => {
            info!(
                "the copy on the library share is smaller than the transcoded video ({} < {}) and must be re-uploaded",
                format_size(dest.len(), DECIMAL),
                format_size(src.len(), DECIMAL)
            );
            Ok(true)
        }
        (Some(_), Some(dest)) => {
            info!(
                "the video is already on the library share ({}), skipping upload",
                format_size(dest.len(), DECIMAL)
            );
            Ok(false)
        }
    }
}

async fn confirm_indexed(library: &dyn MediaLibrary, filename: &str, policy: &ConfirmPolicy) -> Result<()> {
    info!("checking that {} is now in the library...", filename);
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        match library.has_video(filename).await {
            Ok(true) => return Ok(()),
            Ok(false) => info!("{} is not indexed yet (attempt {}/{})", filename, attempt, policy.attempts),
            Err(e) => warn!("unable to check the library for {}: {}", filename, e),
        }
    }
    Err(RelayError::inconsistency(format!(
        "the library was updated but {} is still not in it",
        filename
    )))
}

async fn remove_local(path: &Path) -> Result<bool> {
    let removed = remove_if_exists(path).await?;
    if removed {
        info!("removed {}", path.display());
    }
    Ok(removed)
}

/// Copy the transcoded video onto the library share unless it is already there.
///
/// Needs no media server, so it can run before the library is resolved.
/// Returns whether a copy was made.
pub async fn upload_to_share(request: &UploadRequest) -> Result<bool> {
    let upload_path = request.upload_path()?;
    if !should_upload(&request.transcoded, &upload_path).await? {
        return Ok(false);
    }
    info!("uploading {} to {}...", request.transcoded.display(), upload_path.display());
    let bytes = copy_file(&request.transcoded, &upload_path).await?;
    info!("uploaded {} ({})", upload_path.display(), format_size(bytes, DECIMAL));
    Ok(true)
}

/// Make sure the library lists the uploaded video, then remove the local copies.
pub async fn finish_upload(
    request: &UploadRequest,
    uploaded: bool,
    library: &dyn MediaLibrary,
    policy: &ConfirmPolicy,
) -> Result<UploadReport> {
    let filename = request.filename()?;
    let mut report = UploadReport {
        uploaded,
        ..UploadReport::default()
    };

    let should_refresh = if uploaded {
        true
    } else {
        info!("checking for {} in the library...", filename);
        !library.has_video(&filename).await?
    };

    if should_refresh {
        info!("updating the library index...");
        library.refresh().await?;
        confirm_indexed(library, &filename, policy).await?;
        report.refreshed = true;
    } else {
        info!("{} is already in the library, skipping update", filename);
    }

    report.removed_transcoded = remove_local(&request.transcoded).await?;
    report.removed_raw = remove_local(&request.raw).await?;

    info!("✅ {} is in the library", filename);
    Ok(report)
}

/// Run every remaining upload step for `request`.
pub async fn upload(
    request: &UploadRequest,
    library: &dyn MediaLibrary,
    policy: &ConfirmPolicy,
) -> Result<UploadReport> {
    let uploaded = upload_to_share(request).await?;
    finish_upload(request, uploaded, library, policy).await
}
