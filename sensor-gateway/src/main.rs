//! Entrypoint: loads configuration, then dispatches to one of three
//! processes per SPEC's CLI surface — `run` (default), `migrate`, `sync`.
//!
//! No flag-parsing crate: three `match` arms on `std::env::args()`, the way
//! the teacher reads its own argv, since the whole surface is this small.

use anyhow::Context;
use sensor_gateway::config::Config;
use sensor_gateway::orchestrator::Orchestrator;
use sensor_gateway::{migrate, sync};
use tracing::{error, info};

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BACKEND_UNREACHABLE: i32 = 2;
const EXIT_SHUTDOWN_ERROR: i32 = 3;

enum Subcommand {
    Run,
    Migrate,
    Sync,
}

fn parse_args() -> (Subcommand, String) {
    parse_from(std::env::args().skip(1))
}

fn parse_from<I: IntoIterator<Item = String>>(args: I) -> (Subcommand, String) {
    let mut subcommand = Subcommand::Run;
    let mut config_path = "config.toml".to_string();

    for arg in args {
        match arg.as_str() {
            "run" => subcommand = Subcommand::Run,
            "migrate" => subcommand = Subcommand::Migrate,
            "sync" => subcommand = Subcommand::Sync,
            other => config_path = other.to_string(),
        }
    }
    (subcommand, config_path)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let (subcommand, config_path) = parse_args();

    let config = match Config::from_file(&config_path).context("loading configuration") {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %config_path, "config error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let exit_code = match subcommand {
        Subcommand::Run => run(config).await,
        Subcommand::Migrate => run_migrate(config).await,
        Subcommand::Sync => run_sync(config).await,
    };
    std::process::exit(exit_code);
}

/// Start the integrated orchestrator (Module Manager + Cache Writer +
/// Document Writer, optionally Realtime Sync) and run until Ctrl+C.
async fn run(config: Config) -> i32 {
    info!("sensor gateway starting");

    let orchestrator = match Orchestrator::start(&config, false).await {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to start orchestrator");
            return EXIT_BACKEND_UNREACHABLE;
        }
    };

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down gracefully");
        }
    }
    let _ = cancel_tx.send(true);
    orchestrator.run_until_cancelled(cancel_rx).await;

    info!("sensor gateway stopping");
    orchestrator.stop().await;
    0
}

/// Run the Bulk Migrator once and exit (§4.7): a separate process from
/// acquisition, per §2's data-flow note.
async fn run_migrate(config: Config) -> i32 {
    info!("bulk migration starting");
    let session_prefix = config
        .session_prefix
        .clone()
        .unwrap_or_else(|| sensor_gateway::types::new_session_prefix(chrono::Utc::now()));

    match migrate::run(&config.cache, &config.document_store, session_prefix).await {
        Ok(summary) => {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "bulk migration complete"
            );
            if summary.failed > 0 {
                for (key, err) in &summary.per_key_errors {
                    error!(key = %key, error = %err, "migration key failed");
                }
            }
            0
        }
        Err(e) => {
            error!(error = %e, "bulk migration failed to start");
            EXIT_BACKEND_UNREACHABLE
        }
    }
}

/// Run Realtime Sync standalone, no acquisition (§4.8, §2's "sync process
/// drains it" data-flow note).
async fn run_sync(config: Config) -> i32 {
    info!("realtime sync starting");
    let session_prefix = config
        .session_prefix
        .clone()
        .unwrap_or_else(|| sensor_gateway::types::new_session_prefix(chrono::Utc::now()));

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let engine = match sync::spawn_all(
        &config.cache,
        &config.document_store,
        &config.sync,
        session_prefix,
        cancel_rx,
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to start realtime sync");
            return EXIT_BACKEND_UNREACHABLE;
        }
    };

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for Ctrl+C");
        return EXIT_SHUTDOWN_ERROR;
    }
    info!("received Ctrl+C, shutting down realtime sync");
    let _ = cancel_tx.send(true);
    engine.join().await;
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_to_run_and_config_toml() {
        let (subcommand, path) = parse_from(strs(&[]));
        assert!(matches!(subcommand, Subcommand::Run));
        assert_eq!(path, "config.toml");
    }

    #[test]
    fn recognizes_migrate_subcommand_with_config_path() {
        let (subcommand, path) = parse_from(strs(&["migrate", "prod.toml"]));
        assert!(matches!(subcommand, Subcommand::Migrate));
        assert_eq!(path, "prod.toml");
    }

    #[test]
    fn recognizes_sync_subcommand() {
        let (subcommand, _) = parse_from(strs(&["sync"]));
        assert!(matches!(subcommand, Subcommand::Sync));
    }
}
