//! Kubernetes `batch/v1` Job client over plain HTTP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::client::unless_cancelled;
use super::{JobClient, JobManifest, JobStatus, JobSummary};
use crate::error::{RelayError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Upper bound on a single non-watch API round-trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before re-opening a deletion watch that the server closed
const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for the Kubernetes API server
#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    /// Namespace used when a caller does not name one
    pub namespace: String,
}

impl KubeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            ca_cert: None,
            namespace: "default".to_string(),
        }
    }

    /// Configuration for a process running inside a pod
    pub fn in_cluster() -> Result<Self> {
        let base_url = api_server_url(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
        )?;

        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token_path = sa.join("token");
        let token = std::fs::read_to_string(&token_path)
            .map_err(|e| RelayError::io("read", &token_path, e))?;
        let namespace = std::fs::read_to_string(sa.join("namespace"))
            .map(|ns| ns.trim().to_string())
            .unwrap_or_else(|_| "default".to_string());

        Ok(Self {
            base_url,
            token: Some(token.trim().to_string()),
            ca_cert: Some(sa.join("ca.crt")),
            namespace,
        })
    }

    /// `KUBE_API_URL` (+ optional `KUBE_TOKEN`) when set, otherwise in-cluster
    pub fn from_env() -> Result<Self> {
        match std::env::var("KUBE_API_URL") {
            Ok(url) if !url.is_empty() => {
                let mut cfg = Self::new(url);
                cfg.token = std::env::var("KUBE_TOKEN").ok().filter(|t| !t.is_empty());
                if let Ok(ns) = std::env::var("KUBE_NAMESPACE") {
                    cfg.namespace = ns;
                }
                Ok(cfg)
            }
            _ => Self::in_cluster(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// API server address from the service environment injected into every pod
fn api_server_url(host: Option<String>, port: Option<String>) -> Result<String> {
    // A missing host is a deployment problem, not a bad argument
    let host = host.filter(|h| !h.is_empty()).ok_or_else(|| {
        RelayError::platform("KUBERNETES_SERVICE_HOST is not set, not running in a cluster")
    })?;
    let port = port.filter(|p| !p.is_empty()).unwrap_or_else(|| "443".to_string());
    let host = if host.contains(':') { format!("[{}]", host) } else { host };
    Ok(format!("https://{}:{}", host, port))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    resource_version: Option<String>,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeJobStatus {
    #[serde(default)]
    active: i32,
    #[serde(default)]
    succeeded: i32,
    start_time: Option<DateTime<Utc>>,
    completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Deserialize)]
struct KubeJob {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: KubeJobStatus,
}

impl KubeJob {
    fn job_status(&self) -> JobStatus {
        let s = &self.status;
        let has_condition = |kind: &str| s.conditions.iter().any(|c| c.kind == kind && c.status == "True");
        if s.succeeded > 0 {
            JobStatus::Succeeded
        } else if has_condition("Failed") {
            JobStatus::Failed
        } else if s.active > 0 {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            status: self.job_status(),
            created_at: self.metadata.creation_timestamp,
            started_at: self.status.start_time,
            completed_at: self.status.completion_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<KubeJob>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

/// Pull the human readable message out of a `Status` object
fn status_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

async fn platform_error(action: &str, resp: Response) -> RelayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    RelayError::platform(format!("unable to {}: {} {}", action, status, status_message(&body)))
}

/// Newline-delimited JSON events from a streaming watch response
struct WatchStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl WatchStream {
    fn new(resp: Response) -> Self {
        Self {
            chunks: resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            buf: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(line)
    }

    fn parse(line: &[u8]) -> Result<Option<WatchEvent>> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(text)?))
    }

    /// Next event, or `None` once the server closes the stream
    async fn next_event(&mut self, cancel: &CancellationToken) -> Result<Option<WatchEvent>> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(event) = Self::parse(&line)? {
                    return Ok(Some(event));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                chunk = self.chunks.next() => match chunk {
                    Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        let rest = std::mem::take(&mut self.buf);
                        return Self::parse(&rest);
                    }
                }
            }
        }
    }
}

/// [`JobClient`] backed by the Kubernetes REST API
#[derive(Clone)]
pub struct KubeJobClient {
    http: reqwest::Client,
    config: KubeConfig,
}

impl KubeJobClient {
    pub fn new(config: KubeConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("vidrelay/", env!("CARGO_PKG_VERSION")));
        if let Some(ca) = &config.ca_cert {
            let pem = std::fs::read(ca).map_err(|e| RelayError::io("read", ca, e))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.config.base_url, namespace)
    }

    fn job_url(&self, name: &str, namespace: &str) -> String {
        format!("{}/{}", self.jobs_url(namespace), name)
    }

    fn authorized(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// A bounded request. Watches use [`authorized`](Self::authorized) since they stay open.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.authorized(method, url).timeout(REQUEST_TIMEOUT)
    }

    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<KubeJob>> {
        let resp = self.request(Method::GET, &self.job_url(name, namespace)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json().await?)),
            _ => Err(platform_error(&format!("get job {}/{}", namespace, name), resp).await),
        }
    }

    async fn open_watch(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WatchStream> {
        let mut query = vec![
            ("watch", "true".to_string()),
            ("fieldSelector", format!("metadata.name={}", name)),
        ];
        if let Some(rv) = resource_version {
            query.push(("resourceVersion", rv.to_string()));
        }
        let request = self.authorized(Method::GET, &self.jobs_url(namespace)).query(&query).send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            resp = request => resp?,
        };
        if !resp.status().is_success() {
            return Err(platform_error(&format!("watch {}:jobs for {}", namespace, name), resp).await);
        }
        Ok(WatchStream::new(resp))
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create(&self, manifest: &JobManifest) -> Result<JobSummary> {
        let resp = self
            .request(Method::POST, &self.jobs_url(&manifest.namespace))
            .json(&manifest.body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(RelayError::AlreadyExists(manifest.name.clone())),
            s if s.is_success() => {
                let job: KubeJob = resp.json().await?;
                Ok(job.summary())
            }
            _ => Err(platform_error(&format!("create job {}", manifest.name), resp).await),
        }
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        info!("deleting job: {}/{}", namespace, name);
        // Foreground propagation keeps the job visible until its pods are gone
        let options = json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": "Foreground",
        });
        let resp = self
            .request(Method::DELETE, &self.job_url(name, namespace))
            .json(&options)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!("job {}/{} was already gone", namespace, name);
                Ok(())
            }
            s if s.is_success() => Ok(()),
            _ => Err(platform_error(&format!("delete {}/{}", namespace, name), resp).await),
        }
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<JobSummary>> {
        Ok(self.get_job(name, namespace).await?.map(|job| job.summary()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<JobSummary>> {
        let resp = self.request(Method::GET, &self.jobs_url(namespace)).send().await?;
        if !resp.status().is_success() {
            return Err(platform_error(&format!("list jobs in {}", namespace), resp).await);
        }
        let list: JobList = resp.json().await?;
        Ok(list.items.iter().map(KubeJob::summary).collect())
    }

    async fn wait_until_succeeded(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        let mut watch = self.open_watch(name, namespace, None, cancel).await?;
        while let Some(event) = watch.next_event(cancel).await? {
            match event.kind.as_str() {
                "ADDED" | "MODIFIED" => {
                    let job: KubeJob = serde_json::from_value(event.object)?;
                    let summary = job.summary();
                    match summary.status {
                        JobStatus::Succeeded => return Ok(summary),
                        JobStatus::Failed => return Err(RelayError::JobFailed(name.to_string())),
                        status => info!("job {} hasn't succeeded yet, current status is {}", name, status),
                    }
                }
                "DELETED" => {
                    info!("job {}/{} was deleted before it succeeded", namespace, name);
                    return Err(RelayError::WatchEnded(name.to_string()));
                }
                "ERROR" => {
                    return Err(RelayError::platform(format!(
                        "watch of job {} failed: {}",
                        name,
                        status_message(&event.object.to_string())
                    )))
                }
                _ => {}
            }
        }
        Err(RelayError::WatchEnded(name.to_string()))
    }

    async fn wait_until_deleted(&self, name: &str, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            let resource_version = match unless_cancelled(cancel, self.get_job(name, namespace)).await? {
                None => return Ok(()),
                Some(job) => job.metadata.resource_version,
            };

            let mut watch = self.open_watch(name, namespace, resource_version.as_deref(), cancel).await?;
            while let Some(event) = watch.next_event(cancel).await? {
                match event.kind.as_str() {
                    "DELETED" => {
                        debug!("observed deletion of job {}/{}", namespace, name);
                        return Ok(());
                    }
                    "ERROR" => debug!(
                        "deletion watch for {} reported {}, re-checking",
                        name,
                        status_message(&event.object.to_string())
                    ),
                    _ => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(REWATCH_DELAY) => {}
            }
        }
    }
}
