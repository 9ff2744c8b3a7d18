use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{error, info};
use relay::cli::normalize_long_flags;
use relay::plex::{PlexClient, ServerConfig};
use relay::{finish_upload, upload_to_share, ConfirmPolicy, ExitStatus, RelayError, UploadReport, UploadRequest};

/// Upload a transcoded video into a Plex library and clean up after it.
///
/// Safe to run again after a crash: finished steps are skipped.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transcoded video file to upload
    #[arg(short = 'f', value_name = "FILE")]
    file: PathBuf,

    /// Original raw video file to clean up
    #[arg(long)]
    raw: PathBuf,

    /// Base URL of the Plex server, for example http://192.168.0.105:32400
    #[arg(long)]
    plex_server: String,

    /// Plex authentication token
    #[arg(long, env = "PLEX_TOKEN", hide_env_values = true)]
    plex_token: String,

    /// Name of the Plex library
    #[arg(long)]
    plex_library: String,

    /// Location of the library's share
    #[arg(long)]
    plex_share: PathBuf,
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

async fn run(args: Args) -> Result<UploadReport> {
    let request = UploadRequest {
        transcoded: args.file,
        raw: args.raw,
        share: args.plex_share,
    };
    // The copy only touches the share, so it goes ahead even if Plex is down
    let uploaded = upload_to_share(&request)
        .await
        .with_context(|| format!("Failed to upload {}", request.transcoded.display()))?;

    let client = PlexClient::new(ServerConfig {
        url: args.plex_server.clone(),
        token: args.plex_token,
    })
    .context("Failed to create the Plex client")?;
    let library = client
        .find_library(&args.plex_library)
        .await
        .with_context(|| format!("Failed to find the {} library on {}", args.plex_library, args.plex_server))?;

    let report = finish_upload(&request, uploaded, &library, &ConfirmPolicy::default())
        .await
        .with_context(|| format!("Failed to add {} to the library", request.transcoded.display()))?;
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };

    match run(args).await {
        Ok(report) => {
            info!(
                "upload complete (uploaded: {}, refreshed: {}, removed transcoded: {}, removed raw: {})",
                report.uploaded, report.refreshed, report.removed_transcoded, report.removed_raw
            );
            ExitStatus::Success.into()
        }
        Err(e) => {
            error!("{:#}", e);
            // Anything past argument parsing is a runtime failure for the platform to retry
            let status = match e.downcast_ref::<RelayError>() {
                Some(RelayError::Cancelled) => ExitStatus::Interrupted,
                _ => ExitStatus::RuntimeError,
            };
            status.into()
        }
    }
}
