mod config;
mod handlers;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tcp_server::{Server, ServerError, StopReason, init_listen_server, install_signal_handlers};
use tracing::{Level, info, warn};
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::{HandlerKind, Overrides, ServerConfig};
use crate::handlers::{EchoHandler, HttpHandler};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Accept TCP connections on one address and serve them from a single
/// poll(2) loop. SIGINT stops the server.
#[derive(Parser)]
#[command(name = "tcp-serverd", version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, short, env = "TCP_SERVERD_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn run(config: &ServerConfig) -> Result<StopReason, ServerError> {
    let listener = init_listen_server(&config.address, config.port)?;
    match listener.local_addr() {
        Ok(addr) => info!(%addr, handler = ?config.handler, "listening"),
        Err(e) => warn!(error = %e, "listening on unknown address"),
    }

    let loop_config = config.loop_config();
    match config.handler {
        HandlerKind::Echo => Server::new(listener, EchoHandler)
            .with_config(loop_config)
            .run(),
        HandlerKind::Http => Server::new(listener, HttpHandler)
            .with_config(loop_config)
            .run(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ServerConfig::resolve(cli.config.as_deref(), cli.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.level());

    let signals = install_signal_handlers();
    if !signals.is_complete() {
        warn!(failed = ?signals.failed, "some signal dispositions were left unchanged");
    }

    match run(&config) {
        Ok(reason) => {
            info!(?reason, "server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
