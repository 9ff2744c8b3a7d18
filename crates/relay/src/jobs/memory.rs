//! In-memory platform used by the orchestrator and job-chain tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{JobClient, JobManifest, JobRole, JobStatus, JobSummary};
use crate::error::{RelayError, Result};

#[derive(Debug, Clone)]
struct Stored {
    summary: JobSummary,
    terminating: bool,
}

struct Inner {
    jobs: watch::Sender<HashMap<String, Stored>>,
    created: Mutex<Vec<JobManifest>>,
    history: Mutex<Vec<String>>,
    failing_roles: Mutex<HashSet<JobRole>>,
    watches_closed: CancellationToken,
    delete_delay: Duration,
}

#[derive(Clone)]
pub(crate) struct MemoryJobClient {
    inner: Arc<Inner>,
}

fn key(name: &str, namespace: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl MemoryJobClient {
    pub fn new() -> Self {
        Self::with_delete_delay(Duration::from_millis(20))
    }

    /// Deleted jobs linger (terminating) for `delay` before they disappear
    pub fn with_delete_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: watch::channel(HashMap::new()).0,
                created: Mutex::new(Vec::new()),
                history: Mutex::new(Vec::new()),
                failing_roles: Mutex::new(HashSet::new()),
                watches_closed: CancellationToken::new(),
                delete_delay: delay,
            }),
        }
    }

    pub fn fail_creates_for(&self, role: JobRole) {
        self.inner.failing_roles.lock().unwrap().insert(role);
    }

    pub fn set_status(&self, name: &str, namespace: &str, status: JobStatus) {
        self.inner.jobs.send_modify(|jobs| {
            if let Some(stored) = jobs.get_mut(&key(name, namespace)) {
                stored.summary.status = status;
                if status == JobStatus::Succeeded || status == JobStatus::Failed {
                    stored.summary.completed_at = Some(Utc::now());
                }
            }
        });
    }

    /// Every manifest ever accepted, in submission order
    pub fn created(&self) -> Vec<JobManifest> {
        self.inner.created.lock().unwrap().clone()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created().into_iter().map(|m| m.name).collect()
    }

    /// `create`/`delete`/`gone` entries in the order the platform saw them
    pub fn history(&self) -> Vec<String> {
        self.inner.history.lock().unwrap().clone()
    }

    pub fn is_live(&self, name: &str, namespace: &str) -> bool {
        self.inner.jobs.borrow().contains_key(&key(name, namespace))
    }

    /// Simulate the platform dropping every open watch
    pub fn close_watches(&self) {
        self.inner.watches_closed.cancel();
    }

    fn record(&self, entry: String) {
        self.inner.history.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl JobClient for MemoryJobClient {
    async fn create(&self, manifest: &JobManifest) -> Result<JobSummary> {
        if let Some(role) = JobRole::from_job_name(&manifest.name) {
            if self.inner.failing_roles.lock().unwrap().contains(&role) {
                return Err(RelayError::platform("platform unreachable"));
            }
        }

        let k = key(&manifest.name, &manifest.namespace);
        let summary = JobSummary {
            name: manifest.name.clone(),
            namespace: manifest.namespace.clone(),
            status: JobStatus::Pending,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
        };
        let mut conflict = false;
        self.inner.jobs.send_if_modified(|jobs| {
            if jobs.contains_key(&k) {
                conflict = true;
                return false;
            }
            jobs.insert(
                k,
                Stored {
                    summary: summary.clone(),
                    terminating: false,
                },
            );
            true
        });
        if conflict {
            return Err(RelayError::AlreadyExists(manifest.name.clone()));
        }
        self.record(format!("create {}", manifest.name));
        self.inner.created.lock().unwrap().push(manifest.clone());
        Ok(summary)
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        let k = key(name, namespace);
        let mut found = false;
        self.inner.jobs.send_modify(|jobs| {
            if let Some(stored) = jobs.get_mut(&k) {
                found = true;
                stored.terminating = true;
            }
        });
        if !found {
            return Ok(());
        }
        self.record(format!("delete {}", name));

        let client = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(client.inner.delete_delay).await;
            client.record(format!("gone {}", name));
            client.inner.jobs.send_modify(|jobs| {
                jobs.remove(&k);
            });
        });
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<JobSummary>> {
        Ok(self
            .inner
            .jobs
            .borrow()
            .get(&key(name, namespace))
            .map(|s| s.summary.clone()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<JobSummary>> {
        Ok(self
            .inner
            .jobs
            .borrow()
            .values()
            .filter(|s| s.summary.namespace == namespace)
            .map(|s| s.summary.clone())
            .collect())
    }

    async fn wait_until_succeeded(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        let k = key(name, namespace);
        let mut rx = self.inner.jobs.subscribe();
        let mut seen = false;
        loop {
            {
                let jobs = rx.borrow_and_update();
                match jobs.get(&k) {
                    Some(s) if s.summary.status == JobStatus::Succeeded => return Ok(s.summary.clone()),
                    Some(s) if s.summary.status == JobStatus::Failed => {
                        return Err(RelayError::JobFailed(name.to_string()))
                    }
                    Some(s) if s.terminating => return Err(RelayError::WatchEnded(name.to_string())),
                    Some(_) => seen = true,
                    None if seen => return Err(RelayError::WatchEnded(name.to_string())),
                    None => {}
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = self.inner.watches_closed.cancelled() => {
                    return Err(RelayError::WatchEnded(name.to_string()))
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::WatchEnded(name.to_string()));
                    }
                }
            }
        }
    }

    async fn wait_until_deleted(&self, name: &str, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        let k = key(name, namespace);
        let mut rx = self.inner.jobs.subscribe();
        loop {
            if !rx.borrow_and_update().contains_key(&k) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::WatchEnded(name.to_string()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str) -> JobManifest {
        JobManifest::new(name, "relay", json!({"kind": "Job"})).unwrap()
    }

    #[tokio::test]
    async fn create_or_replace_waits_for_the_old_job_to_disappear() {
        let client = MemoryJobClient::with_delete_delay(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let m = manifest("movie-mkv-transcode");

        client.create_or_replace(&m, &cancel).await.unwrap();
        client.create_or_replace(&m, &cancel).await.unwrap();

        assert_eq!(
            client.history(),
            vec![
                "create movie-mkv-transcode",
                "delete movie-mkv-transcode",
                "gone movie-mkv-transcode",
                "create movie-mkv-transcode",
            ]
        );
        assert_eq!(client.list("relay").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_absent_job_is_ok() {
        let client = MemoryJobClient::new();
        client.delete("nope", "relay").await.unwrap();
        assert!(client.history().is_empty());
    }

    #[tokio::test]
    async fn create_or_replace_honours_cancellation() {
        let client = MemoryJobClient::with_delete_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let m = manifest("movie-mkv-upload");
        client.create(&m).await.unwrap();

        let waiter = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.create_or_replace(&m, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
