//! `kiln` binary: serves the resources declared in a TOML config file.

use clap::Parser;
use kiln::{Config, Shutdown};
use std::{io, path::PathBuf, thread};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Threaded HTTP/1.1 server with WebSocket upgrade", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `listen_port` from the configuration
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter.as_str().into()))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let shutdown = Shutdown::new();
    let server = config.server_builder()?.shutdown(shutdown.clone()).build()?;

    info!(
        address = %server.local_addr(),
        workers = config.worker_count,
        resources = config.resources.len(),
        "kiln listening"
    );

    thread::Builder::new()
        .name("kiln-signals".to_owned())
        .spawn(move || watch_signals(shutdown))?;

    server.run()?;
    info!("kiln stopped");
    Ok(())
}

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
fn watch_signals(shutdown: Shutdown) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start the signal runtime, only a kill will stop the server");
            return;
        }
    };

    match runtime.block_on(wait_for_signal()) {
        Ok(name) => {
            info!(signal = name, "shutdown requested");
            shutdown.cancel();
        }
        Err(e) => error!(error = %e, "cannot install signal handlers"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use signal::unix::SignalKind;

    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
