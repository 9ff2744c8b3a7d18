use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use log::error;
use relay::cli::{cancel_on_signal, normalize_long_flags};
use relay::{wait_for_upstream, ExitStatus, KubeConfig, KubeJobClient};
use tokio_util::sync::CancellationToken;

/// Wait for a job to succeed before letting the next step run
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the job to wait for
    #[arg(long)]
    name: String,

    /// Namespace of the job (defaults to the pod's namespace)
    #[arg(long)]
    namespace: Option<String>,
}

fn parse_args() -> Result<Args, ExitCode> {
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

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };

    let config = match KubeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("unable to load cluster configuration: {}", e);
            return e.exit_status().into();
        }
    };
    let namespace = args.namespace.unwrap_or_else(|| config.namespace.clone());
    let client = match KubeJobClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!("unable to create the job client: {}", e);
            return e.exit_status().into();
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    wait_for_upstream(&client, &args.name, &namespace, &cancel)
        .await
        .exit_status()
        .into()
}
