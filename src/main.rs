//! Command line interface for the Nostr MCP bridge. Supports writing a
//! default configuration, serving the MCP protocol over stdio, and one-shot
//! thread reconstruction for debugging.

mod classify;
mod codec;
mod config;
mod error;
mod event;
mod notify;
mod profile;
mod resolver;
mod server;
mod source;
mod subscribe;
mod thread;
mod tools;

use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::bail;
use clap::{Parser, Subcommand};
use config::Settings;
use resolver::ResolveOptions;
use source::RelayPool;
use tools::Bridge;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nostr-mcp",
    author,
    version,
    about = "MCP server bridging Nostr conversations to AI assistants"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` file if one is not present.
    Init,
    /// Serve MCP over stdio, plus the HTTP sidecar when configured.
    Serve,
    /// Reconstruct and print the conversation containing an event.
    Thread {
        /// Event pointer: hex id, note, nevent, or naddr.
        pointer: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {}
        Commands::Serve => {
            let bridge = build_bridge(&cfg)?;
            server::serve(bridge, cfg.bind_http.clone()).await?;
        }
        Commands::Thread { pointer } => {
            let bridge = build_bridge(&cfg)?;
            match bridge.get_conversation(&pointer).await {
                Ok(markdown) => println!("{markdown}"),
                Err(e) => bail!(e.to_string()),
            }
        }
    }
    Ok(())
}

/// Assemble the bridge over a relay pool from settings.
fn build_bridge(cfg: &Settings) -> anyhow::Result<Arc<Bridge>> {
    if cfg.relays.is_empty() {
        bail!("RELAYS must name at least one relay");
    }
    let pool = RelayPool::new(
        cfg.relays.clone(),
        cfg.tor_socks.clone(),
        cfg.verify_sig,
        Duration::from_secs(cfg.collect_window_secs),
    );
    let opts = ResolveOptions {
        max_depth: cfg.resolve_depth,
        lookup_timeout: Duration::from_secs(cfg.lookup_timeout_secs),
    };
    Ok(Arc::new(Bridge::new(
        Arc::new(pool),
        cfg.notify_capacity,
        opts,
    )))
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("RELAYS=wss://relay.damus.io,wss://nos.lol\n");
    content.push_str("BIND_HTTP=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("NOTIFY_CAPACITY=1000\n");
    content.push_str("LOOKUP_TIMEOUT_SECS=10\n");
    content.push_str("COLLECT_WINDOW_SECS=3\n");
    content.push_str("RESOLVE_DEPTH=2\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    // stdout is the MCP channel; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
