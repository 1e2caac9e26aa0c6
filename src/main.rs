//! seeqd Server
//!
//! Runs the network manager on its own thread and a small demo world
//! stage that echoes every message to all connected sessions.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use seeqd_net::{
    logging::{self, LogLevel},
    network::world_channel,
    NetHandle, ServerConfig, SessionField, WorldEvent, VERSION,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    ///
    /// Defaults are used when the file does not exist.
    #[arg(short, long, default_value = "seeqd.toml")]
    config: PathBuf,

    /// Listen address override ("IP:PORT")
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level override (debug, notice, warning, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, missing_config) = if args.config.exists() {
        let config = ServerConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?;
        (config, false)
    } else {
        (ServerConfig::default(), true)
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init(&config.logging).context("initializing logging")?;
    if missing_config {
        warn!("Config file {} not found, using defaults", args.config.display());
    }
    info!("seeqd v{}", VERSION);

    let (world_tx, world_rx) = world_channel();
    let server = seeqd_net::spawn(config, world_tx).context("starting network manager")?;
    info!("Accepting connections on {}", server.local_addr());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building world runtime")?;
    runtime.block_on(world_stage(server.handle(), world_rx));

    info!("Shutting down");
    server.shutdown().context("stopping network manager")?;
    Ok(())
}

/// Demo world: echo to everyone, `/name <x>` sets the character name.
async fn world_stage(net: NetHandle, mut events: UnboundedReceiver<WorldEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&net, event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

fn handle_event(net: &NetHandle, event: WorldEvent) {
    match event {
        WorldEvent::Connected(session) => {
            info!(session = session.id, peer = %session.peer_addr, "Player joined");
        }
        WorldEvent::Disconnected(id) => {
            info!(session = id, "Player left");
        }
        WorldEvent::Message(msg) => {
            let text = String::from_utf8_lossy(&msg.payload);
            if let Some(name) = text.strip_prefix("/name ") {
                match net.modify_session_field(msg.session_id, SessionField::Character, name.trim()) {
                    Ok(()) => info!(session = msg.session_id, "Character set to {}", name.trim()),
                    Err(e) => warn!("Rename failed: {}", e),
                }
                return;
            }

            let speaker = net
                .session_snapshot(msg.session_id)
                .ok()
                .and_then(|s| s.field(SessionField::Character).map(str::to_owned))
                .unwrap_or_else(|| format!("#{}", msg.session_id));
            if let Err(e) = net.broadcast(format!("{speaker}: {text}").into_bytes()) {
                warn!("Echo dropped: {}", e);
            }
        }
    }
}
