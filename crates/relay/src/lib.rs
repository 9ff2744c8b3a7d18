pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod jobs;
pub mod plex;
pub mod stable;
pub mod uploader;
pub mod watcher;

pub use chain::{wait_for_upstream, ChainOutcome};
pub use config::WatcherConfig;
pub use error::{ExitStatus, RelayError, Result};
pub use jobs::{JobClient, JobStatus, JobSummary, KubeConfig, KubeJobClient};
pub use plex::{MediaLibrary, PlexClient};
pub use stable::{FileEvent, StableFileWatcher};
pub use uploader::{finish_upload, upload, upload_to_share, ConfirmPolicy, UploadReport, UploadRequest};
pub use watcher::{PipelineState, VideoWatcher};
