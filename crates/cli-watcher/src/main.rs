use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{error, info};
use relay::cli::{cancel_on_signal, normalize_long_flags};
use relay::{ExitStatus, JobClient, KubeConfig, KubeJobClient, RelayError, VideoWatcher, WatcherConfig};
use tokio_util::sync::CancellationToken;

/// Watch for new videos and hand them to transcode and upload jobs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared volume containing the watch, claim, work and fail directories
    #[arg(long)]
    shared_volume: Option<PathBuf>,

    /// Volume holding the job templates under templates/
    #[arg(long)]
    config_volume: Option<PathBuf>,

    /// Base URL of the Plex server, for example http://192.168.0.105:32400
    #[arg(long)]
    plex_server: Option<String>,

    /// Plex authentication token
    #[arg(long, env = "PLEX_TOKEN", hide_env_values = true)]
    plex_token: Option<String>,

    /// Where the library shares are mounted inside upload jobs
    #[arg(long)]
    plex_share: Option<PathBuf>,

    /// Namespace to create jobs in
    #[arg(long)]
    namespace: Option<String>,

    /// Transcoder preset
    #[arg(long)]
    preset: Option<String>,

    /// Seconds a file must stay unchanged before it is picked up
    #[arg(long)]
    stable_threshold: Option<u64>,
}

impl Args {
    /// Layer the command line over the config file
    fn apply(self, mut cfg: WatcherConfig) -> WatcherConfig {
        if self.shared_volume.is_some() || self.config_volume.is_some() {
            let shared = self.shared_volume.unwrap_or_else(|| PathBuf::from("/"));
            let config_volume = self.config_volume.unwrap_or_else(|| PathBuf::from("/config"));
            let layout = WatcherConfig::from_volumes(&shared, &config_volume);
            cfg.watch_dir = layout.watch_dir;
            cfg.claim_dir = layout.claim_dir;
            cfg.transcoded_dir = layout.transcoded_dir;
            cfg.failed_dir = layout.failed_dir;
            cfg.templates_dir = layout.templates_dir;
        }
        if let Some(url) = self.plex_server {
            cfg.plex.url = url;
        }
        if let Some(token) = self.plex_token {
            cfg.plex.token = token;
        }
        if let Some(share) = self.plex_share {
            cfg.plex.share_root = share;
        }
        if let Some(namespace) = self.namespace {
            cfg.namespace = namespace;
        }
        if let Some(preset) = self.preset {
            cfg.video_preset = preset;
        }
        if let Some(secs) = self.stable_threshold {
            cfg.stable_threshold_secs = secs;
        }
        cfg
    }
}

fn parse_args() -> std::result::Result<Args, ExitCode> {
    let command = Args::command();
    let longs: Vec<&str> = command.get_arguments().filter_map(|a| a.get_long()).collect();
    let argv = normalize_long_flags(std::env::args_os(), &longs);
    Args::try_parse_from(argv).map_err(|e| {
        let _ = e.print();
        if e.use_stderr() {
            ExitStatus::InvalidArgument.into()
        } else {
            ExitStatus::Success.into()
        }
    })
}

async fn run(args: Args) -> Result<()> {
    let file_config = WatcherConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let cfg = args.apply(file_config);
    cfg.validate()?;

    info!("video watcher starting");
    info!("  Watch dir: {}", cfg.watch_dir.display());
    info!("  Claim dir: {}", cfg.claim_dir.display());
    info!("  Transcoded dir: {}", cfg.transcoded_dir.display());
    info!("  Failed dir: {}", cfg.failed_dir.display());
    info!("  Templates: {}", cfg.templates_dir.display());
    info!("  Namespace: {}", cfg.namespace);
    info!("  Preset: {}", cfg.video_preset);
    info!("  Stable threshold: {}s", cfg.stable_threshold_secs);

    let kube = KubeConfig::from_env().context("Failed to load cluster configuration")?;
    let client: Arc<dyn JobClient> =
        Arc::new(KubeJobClient::new(kube).context("Failed to create the job client")?);

    let watcher = VideoWatcher::start(cfg, client)
        .await
        .context("Failed to start watching for videos")?;

    // Only stop watching when the process is told to
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());
    shutdown.cancelled().await;

    watcher.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };

    match run(args).await {
        Ok(()) => ExitStatus::Success.into(),
        Err(e) => {
            error!("{:#}", e);
            let status = e
                .downcast_ref::<RelayError>()
                .map(RelayError::exit_status)
                .unwrap_or(ExitStatus::RuntimeError);
            status.into()
        }
    }
}
