//! Binary entrypoint for the voxroom CLI.
//!
//! Commands:
//! - `start [--bind <addr>]` - run the chat server on a WebSocket listener
//! - `init` - write a starter `config.toml`
//!
//! See the library crate docs for module-level details: `voxroom::`.
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use voxroom::chat::transport::Listener;
use voxroom::chat::{firewall, render, ChatServer};
use voxroom::config::Config;

#[derive(Parser)]
#[command(name = "voxroom")]
#[command(about = "A multi-room voice and text chat server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server
    Start {
        /// Listen address, overriding `server.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bind } => {
            let mut config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting voxroom v{}", env!("CARGO_PKG_VERSION"));
            if let Some(bind) = bind {
                config.server.bind = bind;
            }

            let firewall = firewall::from_config(&config.firewall);
            if config.firewall.enabled {
                match firewall.test_available().await {
                    Ok(()) => info!("Firewall set '{}' is available", config.firewall.set_name),
                    Err(e) => warn!("Firewall unavailable, bans stay in memory only: {}", e),
                }
            }
            let renderer = render::from_config(&config.renderer);
            if config.renderer.command.is_none() {
                info!("No renderer command configured; using the built-in synthesizer");
            }

            let listener = tokio::net::TcpListener::bind(&config.server.bind)
                .await
                .with_context(|| format!("Failed to bind {}", config.server.bind))?;
            let transport = Listener::new(&config.server);
            let (server, handle) = ChatServer::new(config, renderer, firewall)?;
            let actor = server.spawn();

            tokio::select! {
                res = transport.serve(listener, handle.clone()) => {
                    if let Err(e) = res {
                        warn!("Listener stopped: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
            }
            handle.shutdown("Server shutting down.");
            actor.await.context("Chat server task panicked")??;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new voxroom configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // -v wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok())
        .map(|f| Arc::new(std::sync::Mutex::new(f)));

    // Without a TTY the log file already has everything.
    let is_tty = atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(ref file) = log_file {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }

        if record.target() == "security" {
            if let Some(ref sec_path) = security_path {
                if let Ok(mut sf) = std::fs::OpenOptions::new().create(true).append(true).open(sec_path) {
                    let _ = writeln!(sf, "{}", line);
                }
            }
        }

        if log_file.is_none() || is_tty {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}
