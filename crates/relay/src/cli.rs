//! Bits shared by the command line binaries.

use std::ffi::OsString;

use log::info;
use tokio_util::sync::CancellationToken;

/// Rewrite Go-style single-dash long flags (`-name x`, `-plex-server=y`) to
/// their double-dash form so clap can parse them. Only names in `long_flags`
/// are touched, and nothing after a bare `--`.
pub fn normalize_long_flags<I, S>(args: I, long_flags: &[&str]) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().enumerate() {
        let arg: OsString = arg.into();
        // argv[0] and anything after `--` are left alone
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        let rewritten = arg.to_str().and_then(|s| {
            if s == "--" {
                return None;
            }
            let flag = s.strip_prefix('-').filter(|rest| !rest.starts_with('-'))?;
            let name = flag.split('=').next().unwrap_or(flag);
            if name.len() > 1 && long_flags.contains(&name) {
                Some(OsString::from(format!("-{}", s)))
            } else {
                None
            }
        });
        if arg == "--" {
            passthrough = true;
        }
        out.push(rewritten.unwrap_or(arg));
    }
    out
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received interrupt, shutting down"),
                        _ = term.recv() => info!("received terminate, shutting down"),
                    }
                }
                Err(_) => {
                    let _ = ctrl_c.await;
                    info!("received interrupt, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt, shutting down");
        }
        token.cancel();
    });
}
