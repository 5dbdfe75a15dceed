//! An unattended audio playout agent.
//!
//! One binary, two daemons: `playout player` owns the media backend and
//! `playout scheduler` owns playout policy. They cooperate only through the
//! redis bus, so either side can be restarted independently.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backend;
mod bus;
mod cache;
mod client;
mod config;
mod device;
mod generator;
mod model;
mod player;
mod scheduler;
mod signal;
mod storage;

use bus::{Channel, RedisBus, Store};
use client::RemoteClient;
use config::Config;
use device::Device;
use player::Player;
use scheduler::Scheduler;
use storage::TrackStorage;

/// An unattended audio playout agent.
#[derive(Parser)]
#[command(about, version)]
struct Args {
    /// The daemon to run.
    #[command(subcommand)]
    command: Command,
}

/// The two long-running halves of the agent.
#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Run the playback daemon that owns the media backend.
    Player,

    /// Run the scheduling daemon that owns playout policy.
    Scheduler,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_logging(&config);

    match args.command {
        Command::Player => run_player(config).await,
        Command::Scheduler => run_scheduler(config).await,
    }
}

fn init_logging(config: &Config) {
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Brings up the player daemon on the configured media backend.
async fn run_player(config: Config) -> eyre::Result<()> {
    let bus: Arc<dyn Channel> = Arc::new(RedisBus::connect(&config.redis_url).await?);
    let backend = backend::load(&config.media_backend)?;

    info!("starting player on the `{}` backend", config.media_backend);
    let mut player = Player::new(bus, backend, &config).await?;
    player.run().await
}

/// Brings up the scheduler daemon and its supporting subsystems.
async fn run_scheduler(config: Config) -> eyre::Result<()> {
    let redis = Arc::new(RedisBus::connect(&config.redis_url).await?);
    let store: Arc<dyn Store> = redis.clone();
    let channel: Arc<dyn Channel> = redis;

    let storage = Arc::new(TrackStorage::open(store.clone(), &config.download_dir).await?);
    let client = RemoteClient::new(&config)?;
    let device = Arc::new(Device::new(
        store,
        storage.clone(),
        client.clone(),
        channel.clone(),
        &config,
    ));

    info!("starting scheduler for device {}", config.device_id);
    let mut scheduler = Scheduler::new(device, storage, channel, client, &config).await?;
    scheduler.run().await
}
