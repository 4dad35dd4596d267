mod backup;
mod bulk;
mod config;
mod db;
mod error;
mod interchange;
mod ipc;
mod reconcile;
mod registry;
mod roster;
mod scoring;
#[cfg(test)]
mod testutil;

use std::io::{self, BufRead, Write};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the protocol; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let cfg = config::ProcessConfig::from_env();
    init_tracing(&cfg.log_filter);

    let mut state = ipc::AppState::default();
    if let Some(path) = cfg.workspace.as_deref() {
        if let Err(e) = state.open_workspace(path) {
            error!(workspace = %path.to_string_lossy(), error = %e, "failed to open workspace");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "examd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let resp = ipc::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
