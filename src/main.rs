pub mod cli;
pub mod config;
pub mod mqtt;

use crate::cli::Args;
use crate::config::{ConfigError, FileConfig, Settings};
use clap::Parser;
use color_eyre::Result;
use mqtt::config::ConnectionConfig;
use mqtt::mqtt_handler::{supervise, MqttHandler, Session, EVENT_CAPACITY};
use std::io::Write;
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    setup(args.verbose)?;

    let Some(config) = configure_or_report(&args, &mut std::io::stdout()) else {
        return Ok(ExitCode::FAILURE);
    };
    info!("Subscriber configured for {}", config);
    debug!("Connection config: {:?}", config);

    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
    let (client, network) = MqttHandler::spawn(&config, events_tx);

    let mut session = Session::new(config, client, std::io::stdout());
    let outcome = supervise(&mut session, events_rx, network, shutdown_signal()).await;

    Ok(outcome.exit_code())
}

fn configure(args: &Args) -> Result<ConnectionConfig, ConfigError> {
    let file_config = FileConfig::discover(args.config.as_deref())?;
    let settings = Settings::merge(file_config, args.overrides());
    ConnectionConfig::configure(settings)
}

/// Invalid settings are reported on `out` like every other operator-facing
/// error; the caller exits with status 1.
fn configure_or_report<W: Write>(args: &Args, out: &mut W) -> Option<ConnectionConfig> {
    match configure(args) {
        Ok(config) => Some(config),
        Err(err) => {
            error!("Configuration rejected: {:?}", err);
            if let Err(write_err) = writeln!(out, "Invalid configuration: {err}") {
                error!("Failed to write to output: {}", write_err);
            }
            None
        }
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(if verbose { Level::DEBUG } else { Level::WARN });
    Ok(())
}

/// Logs go to stderr; stdout carries the operator-facing output.
fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => debug!("Received Ctrl+C"),
        () = terminate => debug!("Received SIGTERM"),
    }
}
