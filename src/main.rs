//! Chatwire - framed text chat over TCP
//!
//! Runs the broadcast chat server or a plain line-based client.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatwire::chat::{tags, ChatRelay};
use chatwire::config::{self, Config};
use chatwire::network::{self, ConnectionError, Server};
use chatwire::protocol::{self, Command};

/// Chatwire - framed text chat over TCP
#[derive(Parser)]
#[command(name = "chatwire")]
#[command(author = "Chatwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Broadcast text chat over a framed binary protocol", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a server and chat from stdin
    Client {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Client { host, port, name } => {
            run_client(config, host, port, name).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the chat server until Ctrl+C
async fn run_server(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(host) = host {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.port = port;
    }

    let mut server = Server::bind(net_config).await?;
    let events = server
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event queue already taken"))?;
    server.start()?;

    tracing::info!(
        "Chat server running on {} (protocol v{})",
        server.local_addr(),
        protocol::PROTOCOL_VERSION
    );

    let relay = ChatRelay::new(server.registry());
    tokio::select! {
        _ = relay.run(events) => {
            tracing::warn!("Chat relay stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    server.stop().await?;
    Ok(())
}

/// Connect to a server, forward stdin lines and print what arrives
async fn run_client(
    config: Config,
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.client.host.clone());
    let port = port.unwrap_or(config.client.port);
    let name = name.unwrap_or_else(|| config.client.display_name());

    let addr = network::resolve_host(&host, port).await?;
    let mut conn = network::connect(addr, config.client.connect_timeout()).await?;
    conn.send(&Command::new(tags::NAME, name.clone())).await?;
    tracing::info!("Connected to {} as '{}'", addr, name);

    let peer = conn.handle();
    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if let Err(e) = peer.send(&Command::new(tags::MESSAGE, line)).await {
                        tracing::error!("Error sending to server: {}", e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
        let _ = peer.close().await;
    });

    loop {
        tokio::select! {
            result = conn.next() => {
                match result {
                    Ok(Some(command)) => match command.tag {
                        tags::MESSAGE | tags::JOIN | tags::LEAVE => println!("{}", command.text()),
                        other => tracing::debug!(tag = other, "ignoring unknown command"),
                    },
                    Ok(None) | Err(ConnectionError::Closed) => {
                        println!("Connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Connection error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    input.abort();
    conn.close().await?;
    Ok(())
}
