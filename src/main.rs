//! resilient-rpc daemon.
//!
//! Loads the configuration, builds the client, runs the admin API and the
//! config watcher, then drains on SIGINT/SIGTERM.
//!
//! Exit codes: `0` after a clean drain, `1` when the drain was forced,
//! `2` when startup failed.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use resilient_rpc::admin;
use resilient_rpc::config::{load_config, ConfigWatcher};
use resilient_rpc::lifecycle::{join_within, termination_signal};
use resilient_rpc::observability::logging::init_logging;
use resilient_rpc::RpcClient;

#[derive(Parser)]
#[command(name = "resilient-rpc")]
#[command(about = "Resilient multi-endpoint JSON-RPC access layer", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("resilient-rpc: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        endpoints = config.endpoints.len(),
        "resilient-rpc starting"
    );

    let client = RpcClient::new(config.clone())?;
    let sweeper = client.spawn_background();

    let admin_task = if config.admin.enabled {
        let client = client.clone();
        let admin_config = config.admin.clone();
        let shutdown = client.shutdown_signal();
        Some(tokio::spawn(async move {
            if let Err(e) = admin::serve(client, &admin_config, shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let _watch_handle = match watcher.run() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload disabled");
            None
        }
    };
    let tuner = {
        let client = client.clone();
        let mut shutdown = client.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(new_config) => client.apply_tuning(&new_config),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    termination_signal().await;
    let report = client.shutdown().await;

    let mut tasks = vec![sweeper, tuner];
    tasks.extend(admin_task);
    let remaining = config.shutdown.hard_timeout().saturating_sub(report.elapsed);
    join_within(tasks, remaining).await;

    tracing::info!(
        exit_code = report.exit_code(),
        outstanding_critical = report.outstanding_critical,
        outstanding_normal = report.outstanding_normal,
        "Shutdown complete"
    );
    Ok(if report.exit_code() == 0 { 0 } else { 1 })
}
