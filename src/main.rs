use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ircboard::config::Config;
use ircboard::irc::{IrcSession, SessionEvent};
use ircboard::relay::Relay;
use ircboard::watcher::{ForumWatcher, WatcherState};

/// How long to wait for the IRC session to say goodbye on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "ircboard",
    version,
    about = "Announces new phpBB forum posts in IRC channels"
)]
struct Args {
    /// Configuration file
    #[arg(value_name = "CONFIG", default_value = "ircboard.toml")]
    config: PathBuf,

    /// Validate the configuration, print the feed URL and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default directive
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ircboard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let source = config.feed_source().context("Invalid forum settings")?;
    let feed_url = source.feed_url().context("Failed to build feed URL")?;

    if args.check {
        println!("Configuration OK: {}", args.config.display());
        println!("Feed URL: {}", feed_url);
        println!(
            "Server: {}:{}{}",
            config.server.host,
            config.server.port,
            if config.server.secure { " (TLS)" } else { "" }
        );
        println!("Channels: {}", config.channel_list().join(", "));
        return Ok(());
    }

    let (session, handle, mut events) = IrcSession::new(config.irc_settings());
    let relay = Relay::new(handle, config.channel_list(), config.language());

    // Watermark starts now: posts made before startup are never announced
    let mut watcher = ForumWatcher::new(source);
    watcher.subscribe(move |entries| relay.announce(entries));
    tracing::info!(feed = %feed_url, "Watching forum feed");

    let cancel = CancellationToken::new();
    let mut session_task = tokio::spawn(session.run(cancel.clone()));
    let mut session_done = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome: Result<()> = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, shutting down");
                break Ok(());
            }
            Some(event) = events.recv() => match event {
                SessionEvent::Registered => {
                    // Reconnects keep the running watcher
                    if watcher.state() == WatcherState::Idle {
                        watcher.start().context("Failed to start forum watcher")?;
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    tracing::debug!(reason = %reason, "IRC session disconnected");
                }
            },
            result = &mut session_task => {
                session_done = true;
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e).context("IRC session ended"),
                    Err(e) => Err(e).context("IRC session task failed"),
                };
            }
        }
    };

    if watcher.state() == WatcherState::Running {
        if let Err(e) = watcher.stop().await {
            tracing::warn!(error = %e, "Forum watcher did not stop cleanly");
        }
    }

    cancel.cancel();
    if !session_done {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, session_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "IRC session closed with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "IRC session task failed"),
            Err(_) => tracing::warn!("IRC session did not close in time"),
        }
    }

    tracing::info!("Goodbye");
    outcome
}
