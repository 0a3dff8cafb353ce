//! # Controller Runtime Demo
//!
//! Runs an `Artist` controller against the in-memory resource service.
//!
//! Every artist gets a debut `Album` owned by it, and an `accepted`
//! condition once the album exists. Album changes are mapped back to the
//! owning artist, and deleting an artist removes its albums.
//!
//! ## Usage
//!
//! ```bash
//! controller-runtime-demo --artists 5
//! controller-runtime-demo --leader false   # singleton controller stays idle
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use controller_runtime::cache::ID_INDEX;
use controller_runtime::observability::{init_logging, register_metrics};
use controller_runtime::prelude::*;
use controller_runtime::server::{start_server, ServerState};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const ARTIST_STATUS_KEY: &str = "demo.artist-controller";
const ALBUMS_BY_OWNER: &str = "owner";

/// Controller runtime demo
#[derive(Parser, Debug)]
#[command(name = "controller-runtime-demo")]
#[command(about = "Runs a demo artist controller on the in-memory resource service")]
struct Args {
    /// Port for /metrics, /healthz and /readyz (overrides METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Whether this server holds raft leadership
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    leader: bool,

    /// Number of artists to create at startup
    #[arg(long, default_value_t = 3)]
    artists: usize,
}

fn artist_type() -> Type {
    Type::new("demo", "v2", "Artist")
}

fn album_type() -> Type {
    Type::new("demo", "v2", "Album")
}

struct ArtistReconciler;

#[async_trait]
impl Reconciler for ArtistReconciler {
    async fn reconcile(&self, rt: &Runtime, request: Request) -> anyhow::Result<()> {
        let artist = match rt.client.read(&request.id).await {
            Ok(artist) => artist,
            Err(ResourceError::NotFound(_)) => return delete_albums(rt, &request.id).await,
            Err(err) => return Err(err.into()),
        };

        let album_id = Id::new(
            album_type(),
            artist.id.tenancy.clone(),
            format!("{}-debut", artist.id.name),
        );
        if rt
            .cache
            .get(&album_type(), ID_INDEX, &album_id.reference_key())?
            .is_none()
        {
            info!(artist = %artist.id.name, album = %album_id.name, "creating debut album");
            rt.client
                .write(
                    Resource::new(album_id)
                        .with_owner(artist.id.clone())
                        .with_data(json!({ "title": "Debut" })),
                )
                .await?;
        }

        let status = Status {
            observed_generation: artist.generation.clone(),
            conditions: vec![Condition {
                r#type: "accepted".to_string(),
                state: ConditionState::True,
                reason: "AlbumCreated".to_string(),
                message: String::new(),
            }],
        };
        if artist.status.get(ARTIST_STATUS_KEY) != Some(&status) {
            rt.client
                .write_status(&artist.id, ARTIST_STATUS_KEY, status)
                .await?;
        }
        Ok(())
    }
}

async fn delete_albums(rt: &Runtime, artist: &Id) -> anyhow::Result<()> {
    for album in rt
        .cache
        .list(&album_type(), ALBUMS_BY_OWNER, &artist.reference_key())?
    {
        info!(album = %album.id.name, "deleting album of removed artist");
        rt.client.delete(&album.id, "").await?;
    }
    Ok(())
}

fn artist_controller() -> Controller {
    Controller::new("artist", artist_type(), [])
        .with_watch(
            album_type(),
            map_owner_filtered(artist_type()),
            [Index::owner(ALBUMS_BY_OWNER)],
        )
        .with_reconciler(ArtistReconciler)
        .with_notify_start(|_rt: &Runtime| info!("artist controller started"))
        .with_notify_stop(|_rt: &Runtime| info!("artist controller stopped"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::from_env();
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    init_logging(&config)?;

    info!("Starting controller runtime demo");

    register_metrics()?;

    let cancel = CancellationToken::new();
    let server_state = Arc::new(ServerState::default());
    let server = tokio::spawn(start_server(
        config.metrics_port,
        Arc::clone(&server_state),
        cancel.clone(),
    ));

    let service = Arc::new(InMemoryResourceService::with_types([
        artist_type(),
        album_type(),
    ]));
    let manager = Manager::with_config(Arc::clone(&service) as SharedResourceService, config);
    manager.register(artist_controller());
    manager.set_raft_leader(args.leader);
    manager.run(&cancel);
    server_state.set_ready(true);

    for n in 0..args.artists {
        let id = Id::new(artist_type(), Tenancy::namespaced(), format!("artist-{n}"));
        service
            .write(Resource::new(id).with_data(json!({ "genre": "rock" })))
            .await
            .context("failed to write demo artist")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();

    match server.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Controller runtime demo stopped");
    Ok(())
}
