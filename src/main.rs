use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshcall::{
    LocalIdentity, MeshConfig, MeshCoordinator, MeshState, RelayServer, RoomId, RtcConnector,
    StreamMap, SystemDevices, WsRelayConnector,
};
use rand::random;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshcall", version, about = "Group video calls over a full WebRTC mesh")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay.
    Relay {
        #[arg(long, default_value = "0.0.0.0:8080", env = "MESHCALL_LISTEN")]
        listen: String,
    },
    /// Join a room audio-only and stay in it until Ctrl-C.
    Join {
        #[arg(long)]
        room: String,
        /// Relay URL; overrides the config file.
        #[arg(long, env = "MESHCALL_RELAY")]
        relay: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, env = "MESHCALL_CONFIG")]
        config: Option<PathBuf>,
        /// Join with the microphone muted.
        #[arg(long)]
        muted: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info")),
        )
        .init();

    match Cli::parse().command {
        Command::Relay { listen } => run_relay(&listen).await,
        Command::Join {
            room,
            relay,
            user,
            name,
            config,
            muted,
        } => {
            let mut config = match config {
                Some(path) => MeshConfig::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => MeshConfig::default(),
            };
            if let Some(relay) = relay {
                config.relay_url = relay;
            }
            // SystemDevices has no camera backend.
            config.media.video = false;
            let user_id = user.unwrap_or_else(|| format!("user-{}", random::<u32>()));
            let name = name.unwrap_or_else(|| user_id.clone());
            join_room(config, RoomId::new(room), LocalIdentity::new(user_id, name), muted).await
        }
    }
}

async fn run_relay(listen: &str) -> Result<()> {
    let server = RelayServer::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("relay shutting down"),
    }
    Ok(())
}

async fn join_room(
    config: MeshConfig,
    room_id: RoomId,
    identity: LocalIdentity,
    muted: bool,
) -> Result<()> {
    let connector = Arc::new(RtcConnector::new(&config)?);
    let relay = Arc::new(WsRelayConnector::new(config.signaling_buffer));
    let coordinator = MeshCoordinator::new(config, relay, connector, Arc::new(SystemDevices));
    let (mesh, task) = coordinator.spawn();

    if muted {
        mesh.set_audio_enabled(false).await?;
    }
    mesh.enable(room_id.clone(), identity)
        .await
        .with_context(|| format!("failed to join room {}", room_id))?;

    let mut streams = mesh.remote_streams();
    let mut state = mesh.state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(room = %room_id, "leaving room");
                break;
            }
            changed = streams.changed() => {
                if changed.is_err() {
                    break;
                }
                report(&streams.borrow_and_update());
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == MeshState::Idle {
                    warn!(room = %room_id, "no longer in the room");
                    break;
                }
            }
        }
    }

    mesh.disable().await?;
    drop(mesh);
    task.await?;
    Ok(())
}

fn report(streams: &StreamMap) {
    let tiles: Vec<String> = streams
        .values()
        .map(|entry| match &entry.stream {
            Some(stream) => format!("{} ({} tracks)", entry.display_name, stream.tracks.len()),
            None => format!("{} (connecting)", entry.display_name),
        })
        .collect();
    info!(participants = streams.len(), tiles = ?tiles, "remote streams changed");
}
