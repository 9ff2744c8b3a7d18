pub mod client;
pub mod kube;
pub mod template;

#[cfg(test)]
pub(crate) mod memory;

pub use client::JobClient;
pub use kube::{KubeConfig, KubeJobClient};
pub use template::{JobTemplate, JobTemplates};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Kubernetes object names are DNS labels
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Hex digits of the filename digest kept in shortened job names
const NAME_DIGEST_LEN: usize = 8;

/// The two kinds of remote work a file goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRole {
    Transcode,
    Upload,
}

impl JobRole {
    pub fn as_str(self) -> &'static str {
        match self {
            JobRole::Transcode => "transcode",
            JobRole::Upload => "upload",
        }
    }

    /// Recover the role from a job name built by [`job_name`]
    pub fn from_job_name(name: &str) -> Option<Self> {
        [JobRole::Transcode, JobRole::Upload]
            .into_iter()
            .find(|role| name.ends_with(&format!("-{}", role.as_str())))
    }
}

impl fmt::Display for JobRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Deleted,
}

impl JobStatus {
    /// Pending or running jobs still have work in flight
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
            JobStatus::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// A job as currently observed on the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub namespace: String,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSummary {
    pub fn role(&self) -> Option<JobRole> {
        JobRole::from_job_name(&self.name)
    }

    /// Time between start and completion, or until now for unfinished jobs
    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or(now) - started)
    }
}

/// Replace characters that aren't allowed in a job name with dashes.
pub fn sanitize_job_name(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Deterministic job name for a file and role, e.g. `movie.mkv` → `movie-mkv-transcode`
///
/// Names that would not fit the platform limit are cut short and end in a
/// digest of the whole filename, so long names sharing a prefix stay apart.
pub fn job_name(filename: &str, role: JobRole) -> String {
    let base = sanitize_job_name(filename);
    let room = MAX_JOB_NAME_LEN - role.as_str().len() - 1;
    if base.len() <= room {
        return format!("{}-{}", base, role);
    }
    let digest = format!("{:x}", Sha256::digest(filename.as_bytes()));
    let keep = room - NAME_DIGEST_LEN - 1;
    format!("{}-{}-{}", &base[..keep], &digest[..NAME_DIGEST_LEN], role)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeValues {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadValues {
    /// Transcode job that must succeed before the upload step runs
    pub wait_for_job: String,
    pub transcoded_file: PathBuf,
    pub raw_file: PathBuf,
    pub destination_suffix: PathBuf,
    pub plex_server: String,
    pub plex_token: String,
    pub plex_library: String,
    pub plex_share: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Transcode(TranscodeValues),
    Upload(UploadValues),
}

/// One named unit of remote execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    pub name: String,
    pub namespace: String,
    pub spec: JobSpec,
}

impl PipelineJob {
    pub fn transcode(namespace: impl Into<String>, values: TranscodeValues) -> Self {
        Self {
            name: job_name(&base_name(&values.input_path), JobRole::Transcode),
            namespace: namespace.into(),
            spec: JobSpec::Transcode(values),
        }
    }

    pub fn upload(namespace: impl Into<String>, values: UploadValues) -> Self {
        Self {
            name: job_name(&base_name(&values.transcoded_file), JobRole::Upload),
            namespace: namespace.into(),
            spec: JobSpec::Upload(values),
        }
    }

    pub fn role(&self) -> JobRole {
        match self.spec {
            JobSpec::Transcode(_) => JobRole::Transcode,
            JobSpec::Upload(_) => JobRole::Upload,
        }
    }

    /// Values substituted into the role's job template
    pub fn template_values(&self) -> BTreeMap<&'static str, String> {
        let mut values = BTreeMap::new();
        values.insert("Name", self.name.clone());
        values.insert("Namespace", self.namespace.clone());
        match &self.spec {
            JobSpec::Transcode(t) => {
                values.insert("InputPath", t.input_path.display().to_string());
                values.insert("OutputPath", t.output_path.display().to_string());
                let output_dir = t.output_path.parent().unwrap_or_else(|| Path::new(""));
                values.insert("OutputDir", output_dir.display().to_string());
                values.insert("Preset", t.preset.clone());
            }
            JobSpec::Upload(u) => {
                values.insert("WaitForJob", u.wait_for_job.clone());
                values.insert("TranscodedFile", u.transcoded_file.display().to_string());
                values.insert("RawFile", u.raw_file.display().to_string());
                values.insert("DestinationSuffix", u.destination_suffix.display().to_string());
                values.insert("PlexServer", u.plex_server.clone());
                values.insert("PlexToken", u.plex_token.clone());
                values.insert("PlexLibrary", u.plex_library.clone());
                values.insert("PlexShare", u.plex_share.display().to_string());
            }
        }
        values
    }

    /// Build the platform manifest for this job from its role's template
    pub fn render(&self, templates: &JobTemplates) -> Result<JobManifest> {
        let body = templates.for_role(self.role()).render(&self.template_values())?;
        JobManifest::new(&self.name, &self.namespace, body)
    }
}

/// A rendered job definition ready to submit
#[derive(Debug, Clone, PartialEq)]
pub struct JobManifest {
    pub name: String,
    pub namespace: String,
    pub body: serde_json::Value,
}

impl JobManifest {
    /// Pin the manifest's metadata to `name`/`namespace` so the identity never
    /// depends on what the template author wrote.
    pub fn new(name: &str, namespace: &str, mut body: serde_json::Value) -> Result<Self> {
        let object = body.as_object_mut().ok_or_else(|| {
            crate::error::RelayError::invalid_argument("job template must be a JSON object")
        })?;
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
        if !metadata.is_object() {
            *metadata = serde_json::json!({});
        }
        metadata["name"] = serde_json::Value::String(name.to_string());
        metadata["namespace"] = serde_json::Value::String(namespace.to_string());
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            body,
        })
    }
}
