//! dcrpc
//!
//! Command line front end: starts the messaging engine, issues calls and
//! prints engine events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcrpc_client::{connect, Connection};
use dcrpc_core::storage::{get_config_dir, init_data_dir, ConfigStorage};
use dcrpc_core::ClientConfig;
use std::fs;
use std::path::PathBuf;

mod args;

#[derive(Parser, Debug)]
#[command(name = "dcrpc")]
#[command(about = "JSON-RPC client for the messaging engine", long_about = None)]
struct Args {
    /// Config file (default: config.json in the dcrpc config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine executable, overrides the config
    #[arg(short, long)]
    server: Option<String>,

    /// Accounts directory handed to the engine
    #[arg(short, long)]
    accounts: Option<PathBuf>,

    /// Log level, overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Also write logs to dcrpc.log in the data directory
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method and print its result
    Call {
        method: String,

        /// Positional parameters, each parsed as JSON (plain strings allowed)
        #[arg(allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Print engine events until interrupted
    Listen {
        /// Only events with this method name (repeatable)
        #[arg(short, long)]
        method: Vec<String>,

        #[arg(long)]
        account: Option<u64>,

        #[arg(long)]
        chat: Option<u64>,

        /// Poll get_next_event instead of waiting for pushed notifications
        #[arg(long)]
        poll: bool,

        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Print the engine's system info
    Info,

    /// Print the effective configuration
    Config {
        /// Write it to the default config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging(&config.log_level, args.log_file)?;

    match args.command {
        Command::Config { save } => show_config(&config, save),
        Command::Info => {
            let connection = start(config).await?;
            let result = connection.call("get_system_info", Vec::new()).await;
            finish(&connection, result).await
        }
        Command::Call { method, params } => {
            let connection = start(config).await?;
            let result = connection.call(&method, args::parse_params(&params)).await;
            finish(&connection, result).await
        }
        Command::Listen {
            method,
            account,
            chat,
            poll,
            count,
        } => {
            let connection = start(config).await?;
            let filter = args::event_filter(&method, account, chat);
            let outcome = listen(&connection, filter, poll, count).await;
            connection.shutdown().await;
            outcome
        }
    }
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match args.config {
        Some(ref path) => dcrpc_core::storage::config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigStorage::new(get_config_dir()?)
            .load()
            .context("Failed to load config")?,
    };

    if let Some(ref server) = args.server {
        config.engine.executable = server.clone();
    }
    if let Some(ref accounts) = args.accounts {
        config.engine.accounts_dir = Some(accounts.clone());
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, log_file: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
    use tracing_subscriber::EnvFilter;

    // stdout carries call results; logs go to stderr.
    let writer = if log_file {
        let log_file_path = init_data_dir()?.join("dcrpc.log");
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .with_context(|| format!("Failed to open {}", log_file_path.display()))?;
        BoxMakeWriter::new(std::io::stderr.and(log_file.with_max_level(tracing::Level::DEBUG)))
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_ansi(false)
        .init();

    Ok(())
}

async fn start(config: ClientConfig) -> Result<Connection> {
    tracing::info!("Engine: {}", config.engine.executable);
    let connection = connect(config)
        .await
        .context("Failed to start engine")?;

    connection.on_crash(|exit| {
        tracing::error!("Engine crashed (code {:?})", exit.code);
    });

    Ok(connection)
}

async fn finish(
    connection: &Connection,
    result: dcrpc_client::Result<serde_json::Value>,
) -> Result<()> {
    connection.shutdown().await;
    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn listen(
    connection: &Connection,
    filter: dcrpc_client::EventFilter,
    poll: bool,
    count: Option<usize>,
) -> Result<()> {
    let mut events = connection.subscribe_events(filter);
    let pump = poll.then(|| connection.spawn_event_pump("get_next_event"));
    let mut seen = 0usize;

    tracing::info!("Listening for events, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    println!("{}", args::format_event(chrono::Local::now(), &event));
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
                None => {
                    let reason = connection.wait_closed().await;
                    anyhow::bail!("Engine connection closed: {}", reason);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    if let Some(pump) = pump {
        pump.abort();
    }
    Ok(())
}

fn show_config(config: &ClientConfig, save: bool) -> Result<()> {
    let storage = ConfigStorage::new(get_config_dir()?);
    if save {
        storage.save(config)?;
        tracing::info!("Saved config to {}", storage.path().display());
    }

    println!("# {}", storage.path().display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
