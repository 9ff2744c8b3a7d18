//! Block a job step until an upstream job has succeeded.
//!
//! Runs as the first step of a dependent job so that, for example, an upload
//! never starts before its transcode finished.

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::{ExitStatus, RelayError};
use crate::jobs::{JobClient, JobSummary};

#[derive(Debug)]
pub enum ChainOutcome {
    /// The upstream job completed successfully
    Succeeded(JobSummary),
    /// The wait can never succeed: the watch closed, the job was deleted or failed
    GaveUp(RelayError),
    /// Shutdown was requested while waiting
    Interrupted,
}

impl ChainOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ChainOutcome::Succeeded(_) => ExitStatus::Success,
            ChainOutcome::GaveUp(_) => ExitStatus::RuntimeError,
            ChainOutcome::Interrupted => ExitStatus::Interrupted,
        }
    }
}

/// Wait for `name` to succeed. There are no retries: any outcome other than
/// success ends the wait.
pub async fn wait_for_upstream(
    client: &dyn JobClient,
    name: &str,
    namespace: &str,
    cancel: &CancellationToken,
) -> ChainOutcome {
    info!("waiting for job {}/{} to succeed", namespace, name);
    match client.wait_until_succeeded(name, namespace, cancel).await {
        Ok(job) => {
            info!("job {} succeeded", job.name);
            ChainOutcome::Succeeded(job)
        }
        Err(RelayError::Cancelled) => {
            info!("interrupted while waiting for job {}", name);
            ChainOutcome::Interrupted
        }
        Err(e) => {
            error!("giving up on job {}: {}", name, e);
            ChainOutcome::GaveUp(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobClient;
    use crate::jobs::{JobManifest, JobStatus};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const NS: &str = "relay";

    async fn submitted(client: &MemoryJobClient, name: &str) {
        let manifest = JobManifest::new(name, NS, json!({"kind": "Job"})).unwrap();
        client.create(&manifest).await.unwrap();
    }

    fn spawn_wait(
        client: &MemoryJobClient,
        name: &str,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<ChainOutcome> {
        let client: Arc<dyn JobClient> = Arc::new(client.clone());
        let name = name.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move { wait_for_upstream(client.as_ref(), &name, NS, &cancel).await })
    }

    #[tokio::test]
    async fn exits_zero_once_upstream_succeeds() {
        let client = MemoryJobClient::new();
        submitted(&client, "movie-mkv-transcode").await;
        let cancel = CancellationToken::new();
        let wait = spawn_wait(&client, "movie-mkv-transcode", &cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.set_status("movie-mkv-transcode", NS, JobStatus::Running);
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.set_status("movie-mkv-transcode", NS, JobStatus::Succeeded);

        let outcome = wait.await.unwrap();
        assert!(matches!(&outcome, ChainOutcome::Succeeded(job) if job.name == "movie-mkv-transcode"));
        assert_eq!(outcome.exit_status().code(), 0);
    }

    #[tokio::test]
    async fn gives_up_when_the_watch_closes() {
        let client = MemoryJobClient::new();
        submitted(&client, "movie-mkv-transcode").await;
        let cancel = CancellationToken::new();
        let wait = spawn_wait(&client, "movie-mkv-transcode", &cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close_watches();

        let outcome = wait.await.unwrap();
        assert!(matches!(outcome, ChainOutcome::GaveUp(RelayError::WatchEnded(_))));
        assert_eq!(outcome.exit_status().code(), 3);
    }

    #[tokio::test]
    async fn gives_up_when_upstream_is_deleted() {
        let client = MemoryJobClient::new();
        submitted(&client, "movie-mkv-transcode").await;
        let cancel = CancellationToken::new();
        let wait = spawn_wait(&client, "movie-mkv-transcode", &cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.delete("movie-mkv-transcode", NS).await.unwrap();

        let outcome = wait.await.unwrap();
        assert_eq!(outcome.exit_status(), ExitStatus::RuntimeError);
    }

    #[tokio::test]
    async fn gives_up_when_upstream_fails() {
        let client = MemoryJobClient::new();
        submitted(&client, "movie-mkv-transcode").await;
        client.set_status("movie-mkv-transcode", NS, JobStatus::Failed);

        let outcome = wait_for_upstream(&client, "movie-mkv-transcode", NS, &CancellationToken::new()).await;
        assert!(matches!(outcome, ChainOutcome::GaveUp(RelayError::JobFailed(_))));
    }

    #[tokio::test]
    async fn interrupt_exits_two() {
        let client = MemoryJobClient::new();
        submitted(&client, "movie-mkv-transcode").await;
        let cancel = CancellationToken::new();
        let wait = spawn_wait(&client, "movie-mkv-transcode", &cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = wait.await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Interrupted));
        assert_eq!(outcome.exit_status().code(), 2);
    }
}
