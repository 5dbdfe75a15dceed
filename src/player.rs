//! The player daemon: a tick loop that drives the media backend from bus
//! commands and reports playback lifecycle back to the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::MediaBackend;
use crate::bus::{publish_signal, Channel, Subscription};
use crate::config::Config;
use crate::model::PlaylistItem;
use crate::signal::Signal;

/// Pause between loop ticks.
const TICK: Duration = Duration::from_millis(100);

/// Ticks between idle heartbeats (about ten seconds).
const IDLE_EVERY_TICKS: u32 = 100;

/// How long to give the backend to actually start playing.
const PLAY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for playback to start.
const PLAY_WAIT_POLL: Duration = Duration::from_secs(1);

/// The daemon owning the media backend.
pub struct Player {
    backend: Box<dyn MediaBackend>,
    bus: Arc<dyn Channel>,
    subscription: Subscription,
    scheduler_channel: String,
    current: Option<PlaylistItem>,
    counter: u32,
}

impl Player {
    /// Subscribes to the player channel and wraps the backend.
    pub async fn new(
        bus: Arc<dyn Channel>,
        backend: Box<dyn MediaBackend>,
        config: &Config,
    ) -> Result<Self, crate::bus::Error> {
        let subscription = bus.subscribe(&config.player_channel).await?;
        Ok(Self {
            backend,
            bus,
            subscription,
            scheduler_channel: config.scheduler_channel.clone(),
            current: None,
            counter: 0,
        })
    }

    /// Announces readiness, then ticks forever.
    pub async fn run(&mut self) -> eyre::Result<()> {
        publish_signal(&*self.bus, &self.scheduler_channel, &Signal::PlayerReady).await;

        loop {
            self.tick().await;
            tokio::time::sleep(TICK).await;
        }
    }

    /// One pass of the main loop.
    async fn tick(&mut self) {
        if self.current.is_some() && !self.backend.is_playing() {
            debug!("player finished its track, sending TRACK_FINISHED");
            self.ack_finished().await;
        }

        if let Some(payload) = self.subscription.try_next() {
            match Signal::decode(&payload) {
                Ok(signal) => self.handle(signal).await,
                Err(e) => error!("dropping malformed bus message: {e}"),
            }
        }

        self.counter += 1;
        if self.counter >= IDLE_EVERY_TICKS {
            self.counter = 0;
            if !self.backend.is_playing() {
                debug!("player is idle, sending PLAYER_IDLE");
                publish_signal(&*self.bus, &self.scheduler_channel, &Signal::PlayerIdle).await;
            }
        }
    }

    async fn handle(&mut self, signal: Signal) {
        match signal {
            Signal::Play(item) => self.play(item).await,
            Signal::Skip => self.skip().await,
            Signal::SetVolume(volume) => self.backend.set_volume(volume),
            Signal::Ignored(name) => debug!("ignoring unknown signal `{name}`"),
            // Scheduler-side signals have no business on this channel.
            other => debug!("ignoring signal {} on the player channel", other.name()),
        }
    }

    /// Starts a track and waits (bounded) for the backend to pick it up.
    ///
    /// Start failures are not acked here; the main loop notices a dead
    /// track on its next tick and reports it finished.
    async fn play(&mut self, item: PlaylistItem) {
        if self.backend.is_playing() {
            self.backend.stop();
        }
        if let Err(e) = self.backend.play(&item) {
            error!("unable to play {}: {e}", item.track.file);
            return;
        }

        self.current = Some(item.clone());
        publish_signal(
            &*self.bus,
            &self.scheduler_channel,
            &Signal::TrackPlay(item.clone()),
        )
        .await;

        // Give the backend some time to open the file and start.
        let deadline = Instant::now() + PLAY_WAIT_TIMEOUT;
        while !self.backend.is_playing() {
            if Instant::now() >= deadline {
                break;
            }
            warn!("player not yet playing {}", item.track.file);
            tokio::time::sleep(PLAY_WAIT_POLL).await;
        }

        if self.backend.is_playing() {
            info!("player started playing {}", item.track.file);
        } else {
            error!("unable to start playback of {}", item.track.file);
        }
    }

    async fn skip(&mut self) {
        if self.current.is_some() && self.backend.is_playing() {
            self.backend.stop();
            self.ack_finished().await;
        }
    }

    async fn ack_finished(&mut self) {
        if let Some(track) = self.current.take() {
            publish_signal(
                &*self.bus,
                &self.scheduler_channel,
                &Signal::TrackFinished(track),
            )
            .await;
        }
    }
}
