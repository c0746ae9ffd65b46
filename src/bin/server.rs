//! Tablestore Server Binary
//!
//! Starts the table service emulator.
//!
//! ## Usage
//!
//! ```bash
//! # Start server with default settings (127.0.0.1:10002)
//! cargo run --bin tablestore-server
//!
//! # Listen on all interfaces with a custom config file
//! cargo run --bin tablestore-server -- --host 0.0.0.0 --config ./tablestore.toml
//! ```
//!
//! Logging goes to stderr unless `TABLESTORE_LOG_FILE` names a file.

use tablestore::config::LoggingConfig;
use tablestore::protocol::rest;
use tablestore::protocol::{TableHandler, DEFAULT_ACCOUNT};
use tablestore::Config;

use anyhow::Context;
use clap::Parser;
use std::env;
use std::sync::Arc;
use std::sync::OnceLock;

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "tablestore-server", version, about = "Table service emulator")]
struct Args {
    /// Config file; defaults to tablestore.toml + tablestore.local.toml
    #[arg(long, env = "TABLESTORE_CONFIG")]
    config: Option<String>,

    /// Bind address, overrides http.host
    #[arg(long)]
    host: Option<String>,

    /// Port, overrides http.port
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overrides logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let loaded = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        eprintln!("Using default configuration ({e})");
        Config::default()
    });

    // Override from command line
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging);

    let handler = Arc::new(TableHandler::from_config(&config));

    tracing::info!(
        host = %config.http.host,
        port = config.http.port,
        max_tables = config.storage.max_tables,
        max_page_size = config.storage.max_page_size,
        "tablestore_starting"
    );
    println!("Tablestore Server");
    println!("=================");
    println!(
        "Endpoint: {}://{}:{}/{DEFAULT_ACCOUNT}",
        config.http.scheme, config.http.host, config.http.port
    );
    println!();

    rest::start_http_server(handler, &config.http)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("http server on {}:{}", config.http.host, config.http.port))?;

    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // RUST_LOG takes precedence over config file values
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging_config.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = logging_config.format == "json";

    let writer = match env::var("TABLESTORE_LOG_FILE") {
        Ok(log_path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                let _ = TRACE_GUARD.set(guard);
                Some(non_blocking)
            }
            Err(e) => {
                eprintln!("ERROR: Unable to open TABLESTORE_LOG_FILE '{log_path}': {e}");
                None
            }
        },
        Err(_) => None,
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match writer {
        Some(non_blocking) => {
            let base = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(non_blocking);
            if json {
                Box::new(base.json().finish())
            } else {
                Box::new(base.compact().finish())
            }
        }
        None => {
            let base = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            if json {
                Box::new(base.json().finish())
            } else {
                Box::new(base.compact().finish())
            }
        }
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
