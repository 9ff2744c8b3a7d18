//! The per-file pipeline: claim a stable video, submit its transcode job and
//! then its upload job.
//!
//! No pipeline state is persisted. The claim directory is the work queue and
//! job names are derived from file names, so a restarted watcher can pick up
//! every claimed file again without creating duplicate jobs.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::error::{RelayError, Result};
use crate::fsutil::{is_hidden, move_file};
use crate::jobs::{
    job_name, JobClient, JobRole, JobTemplates, PipelineJob, TranscodeValues, UploadValues,
};
use crate::stable::{FileEvent, StableFileWatcher};

/// Where a file is in its journey through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Watching,
    Claimed,
    TranscodeSubmitted,
    UploadSubmitted,
    Done,
    /// Moved to the failed directory, never retried automatically
    FailedCleanup,
    /// Hidden files are left alone
    Ignored,
    /// The claim move failed, the file stays in the watch directory
    Abandoned,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Watching => "watching",
            PipelineState::Claimed => "claimed",
            PipelineState::TranscodeSubmitted => "transcode submitted",
            PipelineState::UploadSubmitted => "upload submitted",
            PipelineState::Done => "done",
            PipelineState::FailedCleanup => "failed",
            PipelineState::Ignored => "ignored",
            PipelineState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// The library is the first directory under the watch root, e.g. `Movies/Foo/bar.mkv` → `Movies`
pub fn library_for(path_suffix: &Path) -> Option<String> {
    let mut components = path_suffix.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(library)), Some(_)) => Some(library.to_string_lossy().into_owned()),
        _ => None,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Everything a file task needs, shared between tasks
pub(crate) struct Pipeline {
    config: WatcherConfig,
    client: Arc<dyn JobClient>,
    templates: JobTemplates,
    cancel: CancellationToken,
}

impl Pipeline {
    pub(crate) fn new(
        config: WatcherConfig,
        client: Arc<dyn JobClient>,
        templates: JobTemplates,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            templates,
            cancel,
        }
    }

    /// Claim a stable file from the watch directory and submit its jobs
    pub(crate) async fn handle_video(&self, path: &Path) -> PipelineState {
        if is_hidden(path) {
            debug!("ignoring hidden file {}", path.display());
            return PipelineState::Ignored;
        }

        // Keep the nesting relative to the watch directory: /watch/Movies/Foo/bar.mkv -> Movies/Foo/bar.mkv
        let path_suffix = match path.strip_prefix(&self.config.watch_dir) {
            Ok(suffix) => suffix.to_path_buf(),
            Err(_) => {
                warn!(
                    "{} is not under {}, skipping",
                    path.display(),
                    self.config.watch_dir.display()
                );
                return PipelineState::Abandoned;
            }
        };

        let claim_path = self.config.claim_dir.join(&path_suffix);
        info!("attempting to claim {}", path.display());
        if let Err(e) = move_file(path, &claim_path).await {
            error!(
                "unable to move {} to {}, skipping for now: {}",
                path.display(),
                claim_path.display(),
                e
            );
            return PipelineState::Abandoned;
        }
        info!("claimed {}", claim_path.display());

        self.submit(&path_suffix).await
    }

    /// Submit the jobs for a file that is already claimed
    pub(crate) async fn submit(&self, path_suffix: &Path) -> PipelineState {
        let claim_path = self.config.claim_dir.join(path_suffix);
        let transcoded_path = self.config.transcoded_dir.join(path_suffix);

        let library = match library_for(path_suffix) {
            Some(library) => library,
            None => {
                error!(
                    "{} is not inside a library directory, cannot tell where to upload it",
                    path_suffix.display()
                );
                self.cleanup_failed_claim(&claim_path).await;
                return PipelineState::FailedCleanup;
            }
        };

        let transcode = PipelineJob::transcode(
            &self.config.namespace,
            TranscodeValues {
                input_path: claim_path.clone(),
                output_path: transcoded_path.clone(),
                preset: self.config.video_preset.clone(),
            },
        );
        info!("creating transcode job for {}", file_name(&claim_path));
        if let Err(e) = self.create(&transcode).await {
            return self.abort(PipelineState::Claimed, &claim_path, e, None).await;
        }
        info!("{}: {}", PipelineState::TranscodeSubmitted, transcode.name);

        let upload = PipelineJob::upload(
            &self.config.namespace,
            UploadValues {
                wait_for_job: transcode.name.clone(),
                transcoded_file: transcoded_path,
                raw_file: claim_path.clone(),
                destination_suffix: path_suffix.to_path_buf(),
                plex_server: self.config.plex.url.clone(),
                plex_token: self.config.plex.token.clone(),
                plex_share: self.config.plex.share_root.join(&library),
                plex_library: library,
            },
        );
        info!("creating upload job for {}", file_name(&claim_path));
        if let Err(e) = self.create(&upload).await {
            return self
                .abort(PipelineState::TranscodeSubmitted, &claim_path, e, Some(&transcode))
                .await;
        }
        info!("{}: {}", PipelineState::UploadSubmitted, upload.name);

        info!("{} handed off to {} and {}", path_suffix.display(), transcode.name, upload.name);
        PipelineState::Done
    }

    async fn create(&self, job: &PipelineJob) -> Result<String> {
        let manifest = job.render(&self.templates)?;
        self.client.create_or_replace(&manifest, &self.cancel).await
    }

    /// Unwind a failed submission. Shutdown leaves the claim in place for recovery.
    async fn abort(
        &self,
        reached: PipelineState,
        claim_path: &Path,
        err: RelayError,
        submitted: Option<&PipelineJob>,
    ) -> PipelineState {
        if matches!(err, RelayError::Cancelled) {
            info!("shutting down, leaving {} claimed", claim_path.display());
            return reached;
        }
        error!("unable to submit jobs for {}: {}", claim_path.display(), err);
        if let Some(job) = submitted {
            if let Err(e) = self.client.delete(&job.name, &job.namespace).await {
                error!("unable to delete job {}: {}", job.name, e);
            }
        }
        self.cleanup_failed_claim(claim_path).await;
        PipelineState::FailedCleanup
    }

    /// Move a claimed file into the failed directory
    pub(crate) async fn cleanup_failed_claim(&self, claim_path: &Path) {
        let Ok(path_suffix) = claim_path.strip_prefix(&self.config.claim_dir) else {
            error!("{} is not a claim, leaving it alone", claim_path.display());
            return;
        };
        let failed_path = self.config.failed_dir.join(path_suffix);
        info!("cleaning up failed claim: {}", claim_path.display());
        if let Err(e) = move_file(claim_path, &failed_path).await {
            error!("unable to cleanup failed claim: {}", e);
        }
    }

    /// Claimed files whose jobs need to be submitted again.
    ///
    /// A claim whose upload job is still pending or running is skipped, that
    /// work is already in flight.
    pub(crate) async fn pending_claims(&self) -> Result<Vec<PathBuf>> {
        let live: HashSet<String> = self
            .client
            .list(&self.config.namespace)
            .await?
            .into_iter()
            .filter(|job| job.status.is_live())
            .map(|job| job.name)
            .collect();

        let mut pending = Vec::new();
        for entry in WalkDir::new(&self.config.claim_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || is_hidden(entry.path()) {
                continue;
            }
            let Ok(suffix) = entry.path().strip_prefix(&self.config.claim_dir) else {
                continue;
            };
            let upload = job_name(&file_name(entry.path()), JobRole::Upload);
            if live.contains(&upload) {
                info!("{} is still being processed by {}", suffix.display(), upload);
                continue;
            }
            pending.push(suffix.to_path_buf());
        }
        Ok(pending)
    }
}

/// Watches for new videos and pushes each one through the pipeline
pub struct VideoWatcher {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl VideoWatcher {
    /// Create the working directories, resubmit leftover claims and start
    /// watching. Errors here mean the watcher cannot run at all.
    pub async fn start(config: WatcherConfig, client: Arc<dyn JobClient>) -> Result<Self> {
        for dir in config.working_dirs() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RelayError::io("create directory", dir, e))?;
        }
        let templates = JobTemplates::load(&config.templates_dir)?;

        let cancel = CancellationToken::new();
        let pipeline = Arc::new(Pipeline::new(config, client, templates, cancel.clone()));

        let recovered = pipeline.pending_claims().await?;
        if !recovered.is_empty() {
            info!("🔄 resubmitting {} claimed file(s) left from a previous run", recovered.len());
        }

        let (detector, events) = StableFileWatcher::watch_until(
            &pipeline.config.watch_dir,
            pipeline.config.stable_threshold(),
            &cancel,
        )?;
        info!("watching {} for new videos", pipeline.config.watch_dir.display());

        let dispatcher = tokio::spawn(dispatch(pipeline.clone(), detector, events, recovered));
        Ok(Self {
            pipeline,
            cancel,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.pipeline.config
    }

    /// Stop watching and interrupt in-flight submissions
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close and wait for every file task to wind down
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        info!("done watching for videos!");
    }
}

impl Drop for VideoWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    pipeline: Arc<Pipeline>,
    detector: StableFileWatcher,
    mut events: mpsc::Receiver<FileEvent>,
    recovered: Vec<PathBuf>,
) {
    let mut tasks = JoinSet::new();
    for suffix in recovered {
        let pipeline = pipeline.clone();
        tasks.spawn(async move { pipeline.submit(&suffix).await });
    }

    loop {
        tokio::select! {
            _ = pipeline.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(FileEvent { path }) => {
                    let pipeline = pipeline.clone();
                    tasks.spawn(async move { pipeline.handle_video(&path).await });
                }
                None => {
                    warn!("stopped receiving file events");
                    break;
                }
            },
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = done {
                    error!("file task panicked: {}", e);
                }
            }
        }
    }

    detector.shutdown().await;
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{wait_for_upstream, ChainOutcome};
    use crate::jobs::memory::MemoryJobClient;
    use crate::jobs::JobStatus;
    use crate::plex::{MediaLibrary, Video};
    use crate::uploader::{upload, ConfirmPolicy, UploadRequest};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    const NS: &str = "vidrelay";

    fn templates_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../deploy/templates")
    }

    fn config(tmp: &TempDir) -> WatcherConfig {
        let mut cfg = WatcherConfig::from_volumes(tmp.path(), tmp.path());
        cfg.templates_dir = templates_dir();
        cfg.stable_threshold_secs = 1;
        cfg.namespace = NS.to_string();
        cfg.plex.url = "http://plex:32400".into();
        cfg.plex.token = "plex-token".into();
        cfg.plex.share_root = tmp.path().join("plex");
        for dir in cfg.working_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        cfg
    }

    fn pipeline(cfg: &WatcherConfig, client: &MemoryJobClient) -> Pipeline {
        Pipeline::new(
            cfg.clone(),
            Arc::new(client.clone()),
            JobTemplates::load(&cfg.templates_dir).unwrap(),
            CancellationToken::new(),
        )
    }

    fn drop_video(cfg: &WatcherConfig, suffix: &str, len: usize) -> PathBuf {
        let path = cfg.watch_dir.join(suffix);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Indexes whatever lands on the share when refreshed
    struct ShareLibrary {
        share: PathBuf,
        indexed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaLibrary for ShareLibrary {
        async fn list(&self) -> Result<Vec<Video>> {
            let indexed = self.indexed.lock().unwrap();
            Ok(indexed
                .iter()
                .map(|f| Video {
                    title: f.clone(),
                    files: vec![f.clone()],
                })
                .collect())
        }

        async fn refresh(&self) -> Result<()> {
            let files: Vec<String> = WalkDir::new(&self.share)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().display().to_string())
                .collect();
            *self.indexed.lock().unwrap() = files;
            Ok(())
        }
    }

    #[test]
    fn library_is_the_first_directory() {
        assert_eq!(library_for(Path::new("Movies/movie.mkv")).as_deref(), Some("Movies"));
        assert_eq!(library_for(Path::new("TV/Show/S01/e01.mkv")).as_deref(), Some("TV"));
        assert_eq!(library_for(Path::new("movie.mkv")), None);
    }

    #[tokio::test]
    async fn submits_transcode_then_upload() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let path = drop_video(&cfg, "Movies/movie.mkv", 1024);

        let state = pipeline(&cfg, &client).handle_video(&path).await;

        assert_eq!(state, PipelineState::Done);
        assert!(!path.exists());
        assert!(cfg.claim_dir.join("Movies/movie.mkv").exists());
        assert_eq!(client.created_names(), vec!["movie-mkv-transcode", "movie-mkv-upload"]);

        let created = client.created();
        let transcode = created[0].body.to_string();
        assert!(transcode.contains(&cfg.claim_dir.join("Movies/movie.mkv").display().to_string()));
        assert!(transcode.contains(&cfg.transcoded_dir.join("Movies/movie.mkv").display().to_string()));
        let upload = created[1].body.to_string();
        assert!(upload.contains("\"movie-mkv-transcode\""));
        assert!(upload.contains(&cfg.plex.share_root.join("Movies").display().to_string()));
    }

    #[tokio::test]
    async fn hidden_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let path = drop_video(&cfg, "Movies/.movie.mkv.part", 10);

        let state = pipeline(&cfg, &client).handle_video(&path).await;

        assert_eq!(state, PipelineState::Ignored);
        assert!(path.exists());
        assert!(client.created().is_empty());
    }

    #[tokio::test]
    async fn failed_claim_leaves_the_file_in_place() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let missing = cfg.watch_dir.join("Movies/gone.mkv");

        let state = pipeline(&cfg, &client).handle_video(&missing).await;

        assert_eq!(state, PipelineState::Abandoned);
        assert!(client.created().is_empty());
    }

    #[tokio::test]
    async fn transcode_submission_failure_moves_the_claim_to_failed() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        client.fail_creates_for(JobRole::Transcode);
        let path = drop_video(&cfg, "Movies/movie.mkv", 1024);

        let state = pipeline(&cfg, &client).handle_video(&path).await;

        assert_eq!(state, PipelineState::FailedCleanup);
        assert!(cfg.failed_dir.join("Movies/movie.mkv").exists());
        assert!(!cfg.claim_dir.join("Movies/movie.mkv").exists());
        assert!(client.created().is_empty());
    }

    #[tokio::test]
    async fn upload_submission_failure_deletes_the_transcode_job() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        client.fail_creates_for(JobRole::Upload);
        let path = drop_video(&cfg, "Movies/movie.mkv", 1024);

        let state = pipeline(&cfg, &client).handle_video(&path).await;

        assert_eq!(state, PipelineState::FailedCleanup);
        assert!(cfg.failed_dir.join("Movies/movie.mkv").exists());
        assert_eq!(client.created_names(), vec!["movie-mkv-transcode"]);
        assert!(client.history().contains(&"delete movie-mkv-transcode".to_string()));
        eventually("transcode job removal", || !client.is_live("movie-mkv-transcode", NS)).await;
    }

    #[tokio::test]
    async fn file_outside_a_library_fails_without_jobs() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let path = drop_video(&cfg, "movie.mkv", 1024);

        let state = pipeline(&cfg, &client).handle_video(&path).await;

        assert_eq!(state, PipelineState::FailedCleanup);
        assert!(cfg.failed_dir.join("movie.mkv").exists());
        assert!(client.created().is_empty());
    }

    #[tokio::test]
    async fn resubmitting_a_claim_replaces_its_jobs() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let p = pipeline(&cfg, &client);
        let path = drop_video(&cfg, "Movies/movie.mkv", 1024);
        assert_eq!(p.handle_video(&path).await, PipelineState::Done);

        assert_eq!(p.submit(Path::new("Movies/movie.mkv")).await, PipelineState::Done);

        let history = client.history();
        assert_eq!(history.iter().filter(|h| *h == "create movie-mkv-transcode").count(), 2);
        assert!(history.contains(&"gone movie-mkv-transcode".to_string()));
        assert_eq!(client.list(NS).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn recovery_skips_claims_with_live_uploads() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let p = pipeline(&cfg, &client);

        let busy = drop_video(&cfg, "Movies/busy.mkv", 10);
        assert_eq!(p.handle_video(&busy).await, PipelineState::Done);
        client.set_status("busy-mkv-upload", NS, JobStatus::Running);

        for name in ["Movies/stale.mkv", "TV/Show/s01e01.mkv", "Movies/.hidden"] {
            let claim = cfg.claim_dir.join(name);
            std::fs::create_dir_all(claim.parent().unwrap()).unwrap();
            std::fs::write(&claim, b"raw").unwrap();
        }

        let mut pending = p.pending_claims().await.unwrap();
        pending.sort();
        assert_eq!(
            pending,
            vec![PathBuf::from("Movies/stale.mkv"), PathBuf::from("TV/Show/s01e01.mkv")]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_resubmits_leftover_claims() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let claim = cfg.claim_dir.join("Movies/leftover.mkv");
        std::fs::create_dir_all(claim.parent().unwrap()).unwrap();
        std::fs::write(&claim, b"raw").unwrap();

        let watcher = VideoWatcher::start(cfg.clone(), Arc::new(client.clone())).await.unwrap();
        eventually("leftover upload job", || client.is_live("leftover-mkv-upload", NS)).await;
        watcher.shutdown().await;

        assert!(claim.exists());
    }

    #[tokio::test]
    async fn start_fails_without_templates() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.templates_dir = tmp.path().join("no-templates");

        let result = VideoWatcher::start(cfg, Arc::new(MemoryJobClient::new())).await;
        assert!(result.is_err());
    }

    /// Drop a movie into the watch directory and play every job through to the library.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn movie_travels_from_watch_dir_to_library() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let client = MemoryJobClient::new();
        let watcher = VideoWatcher::start(cfg.clone(), Arc::new(client.clone())).await.unwrap();

        let dropped = drop_video(&cfg, "Movies/movie.mkv", 500_000);
        let claim = cfg.claim_dir.join("Movies/movie.mkv");
        eventually("claim", || claim.exists()).await;
        assert!(!dropped.exists());
        eventually("upload job", || client.is_live("movie-mkv-upload", NS)).await;
        assert_eq!(client.created_names(), vec!["movie-mkv-transcode", "movie-mkv-upload"]);

        // the upload job's first step blocks on the transcode job
        let chain = {
            let client = client.clone();
            tokio::spawn(async move {
                wait_for_upstream(&client, "movie-mkv-transcode", NS, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!chain.is_finished());

        // the transcode job writes its output and succeeds
        let transcoded = cfg.transcoded_dir.join("Movies/movie.mkv");
        std::fs::create_dir_all(transcoded.parent().unwrap()).unwrap();
        std::fs::write(&transcoded, vec![1u8; 250_000]).unwrap();
        client.set_status("movie-mkv-transcode", NS, JobStatus::Succeeded);
        assert!(matches!(chain.await.unwrap(), ChainOutcome::Succeeded(_)));

        // then the upload job's second step runs
        let share = cfg.plex.share_root.join("Movies");
        let library = ShareLibrary {
            share: share.clone(),
            indexed: std::sync::Mutex::new(Vec::new()),
        };
        let request = UploadRequest {
            transcoded: transcoded.clone(),
            raw: claim.clone(),
            share: share.clone(),
        };
        let policy = ConfirmPolicy {
            attempts: 3,
            interval: Duration::from_millis(10),
        };
        let report = upload(&request, &library, &policy).await.unwrap();

        assert!(report.uploaded && report.refreshed);
        assert_eq!(std::fs::metadata(share.join("movie.mkv")).unwrap().len(), 250_000);
        assert!(!transcoded.exists());
        assert!(!claim.exists());

        watcher.shutdown().await;
    }
}
