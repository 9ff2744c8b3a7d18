use std::future::Future;

use async_trait::async_trait;
use log::info;
use tokio_util::sync::CancellationToken;

use super::{JobManifest, JobSummary};
use crate::error::{RelayError, Result};

/// How many times create-or-replace will delete a conflicting job before giving up
const MAX_REPLACE_ROUNDS: usize = 5;

/// Run a platform call, abandoning it with [`RelayError::Cancelled`] once `cancel` fires.
pub(crate) async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        result = call => result,
    }
}

/// Narrow contract over the batch compute platform.
///
/// Implementors provide the primitives; [`create_or_replace`](JobClient::create_or_replace)
/// layers the at-most-one-live-job-per-name protocol on top of them.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Submit a job. Fails with [`RelayError::AlreadyExists`] when the name is taken.
    async fn create(&self, manifest: &JobManifest) -> Result<JobSummary>;

    /// Request cascading deletion of a job and its pods. An absent job is not an error.
    async fn delete(&self, name: &str, namespace: &str) -> Result<()>;

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<JobSummary>>;

    async fn list(&self, namespace: &str) -> Result<Vec<JobSummary>>;

    /// Block until the job reports a successful completion.
    ///
    /// Returns [`RelayError::WatchEnded`] if the watch closes or the job is
    /// deleted first, [`RelayError::JobFailed`] if it can no longer succeed and
    /// [`RelayError::Cancelled`] when `cancel` fires.
    async fn wait_until_succeeded(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<JobSummary>;

    /// Block until the job is observed absent.
    async fn wait_until_deleted(&self, name: &str, namespace: &str, cancel: &CancellationToken) -> Result<()>;

    /// Create the job, replacing any existing job with the same name.
    ///
    /// A conflicting job is deleted and its deletion awaited before creation is
    /// retried, so two jobs with the same name are never live at once.
    async fn create_or_replace(&self, manifest: &JobManifest, cancel: &CancellationToken) -> Result<String> {
        for _ in 0..MAX_REPLACE_ROUNDS {
            match unless_cancelled(cancel, self.create(manifest)).await {
                Ok(job) => {
                    info!("created job: {}/{}", job.namespace, job.name);
                    return Ok(job.name);
                }
                Err(RelayError::AlreadyExists(_)) => {
                    info!(
                        "job {}/{} already exists, replacing it",
                        manifest.namespace, manifest.name
                    );
                    unless_cancelled(cancel, self.delete(&manifest.name, &manifest.namespace))
                        .await
                        .map_err(|e| match e {
                            RelayError::Cancelled => RelayError::Cancelled,
                            e => RelayError::platform(format!(
                                "unable to delete existing job {} so that it can be recreated: {}",
                                manifest.name, e
                            )),
                        })?;
                    self.wait_until_deleted(&manifest.name, &manifest.namespace, cancel)
                        .await
                        .map_err(|e| match e {
                            RelayError::Cancelled => RelayError::Cancelled,
                            e => RelayError::platform(format!(
                                "unable to wait for the {} job to be deleted: {}",
                                manifest.name, e
                            )),
                        })?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RelayError::platform(format!(
            "job {} kept reappearing after {} replace attempts",
            manifest.name, MAX_REPLACE_ROUNDS
        )))
    }
}
