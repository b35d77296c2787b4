// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! gpupoold: boots the control plane.
//!
//! Order matters: identity and peer stores first, then workers, then the
//! replicator (so state exists before anyone asks for it), then preloads,
//! then the HTTP listener and outbound peer sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use gpupool::auth::{Keypair, UserRecord};
use gpupool::dispatch::Dispatcher;
use gpupool::federation::{Federation, PeerConnection};
use gpupool::http::{self, AppState};
use gpupool::payment::NoopPayment;
use gpupool::protocols::{frame_type, WorkerRequest};
use gpupool::queue::QueueManager;
use gpupool::scheduler::CapacityPolicy;
use gpupool::state::replicator::Replicator;
use gpupool::state::StateHub;
use gpupool::storage::KvStore;
use gpupool::telemetry::{SmiTelemetry, StaticCatalog, TelemetrySource};
use gpupool::worker::supervisor::{self, WorkerCommand};
use gpupool::worker::WorkerPool;
use gpupool::ClusterConfig;

#[derive(Parser, Debug)]
#[command(name = "gpupoold", about = "Federated GPU inference control plane")]
struct Args {
    /// Directory for identity, user and peer JSON stores.
    #[arg(long, env = "GPUPOOL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Model catalog file (models + pipes map).
    #[arg(long, env = "GPUPOOL_MODELS_FILE", default_value = "models.json")]
    models_file: PathBuf,

    /// Worker launch command; workers are not spawned when absent.
    #[arg(long, env = "GPUPOOL_WORKER_CMD")]
    worker_cmd: Option<String>,

    /// Directory workers bind their unix sockets in.
    #[arg(long, env = "GPUPOOL_SOCKET_DIR", default_value = ".")]
    socket_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerIdentity {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
}

fn load_or_create_identity(store: &KvStore<ServerIdentity>) -> gpupool::Result<Keypair> {
    if let Some(identity) = store.get("identity") {
        return Keypair::from_base64(&identity.private_key);
    }
    let keypair = Keypair::generate();
    store.put(
        "identity",
        ServerIdentity {
            account_id: keypair.account_id(),
            public_key: keypair.public_base64(),
            private_key: keypair.private_base64(),
        },
    )?;
    tracing::info!(account = %keypair.account_id(), "generated new server identity");
    Ok(keypair)
}

/// Wait for a device's channel to come up, then load its preassigned pipe.
async fn preload_pipe(
    pool: Arc<WorkerPool>,
    device_id: String,
    pipe_id: String,
    frozen: bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    let channel = loop {
        if let Some(channel) = pool.channel(&device_id) {
            break channel;
        }
        if tokio::time::Instant::now() > deadline {
            tracing::error!(device = %device_id, pipe = %pipe_id, "preload skipped, worker never came up");
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    match channel
        .call(WorkerRequest::new(frame_type::LOAD_PIPE_REQUEST).with_pipe(&pipe_id))
        .await
    {
        Ok(response) if response.error.is_none() => {
            tracing::info!(device = %device_id, pipe = %pipe_id, "preloaded");
            if frozen {
                pool.set_frozen(&device_id, true);
            }
        }
        Ok(response) => {
            tracing::error!(device = %device_id, pipe = %pipe_id, error = ?response.error, "preload failed");
        }
        Err(err) => {
            tracing::error!(device = %device_id, pipe = %pipe_id, %err, "preload failed");
        }
    }
}

#[tokio::main]
async fn main() -> gpupool::Result<()> {
    gpupool::logging::init();
    let args = Args::parse();
    let config = ClusterConfig::from_env()?;
    tracing::info!(url = %config.server_url, port = config.port, "starting gpupoold");

    std::fs::create_dir_all(&args.data_dir)?;
    let identity_store: KvStore<ServerIdentity> = KvStore::open(args.data_dir.join("server.json"))?;
    let keypair = Arc::new(load_or_create_identity(&identity_store)?);
    let users: Arc<KvStore<UserRecord>> = Arc::new(KvStore::open(args.data_dir.join("users.json"))?);
    let peers: KvStore<PeerConnection> = KvStore::open(args.data_dir.join("connections.json"))?;

    let hub = Arc::new(StateHub::new(&config.server_url));
    let pool = Arc::new(WorkerPool::new());
    let shutdown = CancellationToken::new();

    let telemetry = Arc::new(SmiTelemetry);
    let catalog = Arc::new(match StaticCatalog::from_file(&args.models_file) {
        Ok(catalog) => catalog,
        Err(err) => {
            tracing::warn!(%err, file = %args.models_file.display(), "no model catalog, starting empty");
            StaticCatalog::default()
        }
    });

    // Logical devices: the configured map, or one device per visible GPU.
    let devices = match &config.devices {
        Some(devices) => devices.clone(),
        None => match telemetry.gpus().await {
            Ok(gpus) => gpus.into_iter().map(|g| g.index).collect(),
            Err(err) => {
                tracing::warn!(%err, "GPU discovery failed, running with no devices");
                Vec::new()
            }
        },
    };
    tracing::info!(?devices, "devices");

    if let Some(worker_cmd) = &args.worker_cmd {
        let mut parts = worker_cmd.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| gpupool::error!("empty worker command"))?;
        let command = WorkerCommand {
            program,
            args: parts.collect(),
            socket_dir: args.socket_dir.clone(),
        };
        for device_id in &devices {
            tokio::spawn(supervisor::supervise(
                command.clone(),
                device_id.clone(),
                pool.clone(),
                shutdown.clone(),
            ));
        }
    } else {
        tracing::warn!("no worker command configured, devices will stay offline");
    }

    let replicator = Replicator::new(hub.clone(), pool.clone(), telemetry, catalog);
    tokio::spawn(replicator.run(shutdown.clone()));

    for (i, (pipe_id, frozen)) in config.preload.iter().enumerate() {
        let Some(device_id) = devices.get(i) else {
            tracing::warn!(pipe = %pipe_id, "more preload entries than devices");
            break;
        };
        tokio::spawn(preload_pipe(
            pool.clone(),
            device_id.clone(),
            pipe_id.clone(),
            *frozen,
        ));
    }

    let federation = Arc::new(Federation::new(
        peers,
        keypair.clone(),
        hub.clone(),
        shutdown.clone(),
    ));
    federation.start_granted_sessions();

    let queue = Arc::new(QueueManager::new(hub.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        hub.clone(),
        pool.clone(),
        queue,
        keypair.clone(),
        Arc::new(NoopPayment),
        CapacityPolicy::default(),
        Duration::from_secs(config.dispatch_timeout_secs),
    ));

    let app = http::router(AppState {
        hub,
        pool,
        dispatcher,
        federation,
        keypair,
        users,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = serve_shutdown.cancelled() => {}
        }
    })
    .await?;

    shutdown.cancel();
    tracing::info!("shutdown complete");
    Ok(())
}
