//! The scheduler daemon: owns playout policy.
//!
//! A 100 ms tick loop drains player and generator events, decides what to
//! play next under the device's priority policy, paces the two generators,
//! and re-syncs the device when its local day rolls over.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::bus::{publish_signal, Channel, Subscription};
use crate::client::RemoteClient;
use crate::config::Config;
use crate::device::Device;
use crate::generator::{AdsGenerator, MusicGenerator};
use crate::model::{PlaylistItem, Priority, TrackType};
use crate::signal::Signal;
use crate::storage::TrackStorage;

/// Pause between loop ticks.
const TICK: Duration = Duration::from_millis(100);

/// Generators are paced to one spawn attempt per second, not per tick.
const GENERATOR_EVERY_TICKS: u32 = 10;

/// The day-rollover sync check runs every ten minutes.
const SYNC_CHECK_EVERY_TICKS: u32 = 6000;

/// The daemon owning playout policy.
pub struct Scheduler {
    device: Arc<Device>,
    storage: Arc<TrackStorage>,
    bus: Arc<dyn Channel>,
    client: RemoteClient,
    subscription: Subscription,
    scheduler_channel: String,
    player_channel: String,

    player_ready: bool,
    player_idle: Option<bool>,
    music: VecDeque<PlaylistItem>,
    ads: VecDeque<PlaylistItem>,

    music_generator: Option<Arc<Mutex<MusicGenerator>>>,
    ads_generator: Option<Arc<Mutex<AdsGenerator>>>,
    music_generator_busy: bool,
    ads_generator_busy: bool,

    current: Option<PlaylistItem>,
    next_track_draw_time: Option<DateTime<Tz>>,
    last_device_sync: Option<NaiveDate>,
    counter: u32,
}

impl Scheduler {
    pub async fn new(
        device: Arc<Device>,
        storage: Arc<TrackStorage>,
        bus: Arc<dyn Channel>,
        client: RemoteClient,
        config: &Config,
    ) -> Result<Self, crate::bus::Error> {
        let subscription = bus.subscribe(&config.scheduler_channel).await?;
        Ok(Self {
            device,
            storage,
            bus,
            client,
            subscription,
            scheduler_channel: config.scheduler_channel.clone(),
            player_channel: config.player_channel.clone(),
            player_ready: false,
            player_idle: None,
            music: VecDeque::new(),
            ads: VecDeque::new(),
            music_generator: None,
            ads_generator: None,
            music_generator_busy: false,
            ads_generator_busy: false,
            current: None,
            next_track_draw_time: None,
            last_device_sync: None,
            counter: 1,
        })
    }

    /// Syncs once, then ticks forever.
    pub async fn run(&mut self) -> eyre::Result<()> {
        self.device.sync().await;

        loop {
            self.tick().await;
            tokio::time::sleep(TICK).await;
        }
    }

    /// One pass of the main loop.
    async fn tick(&mut self) {
        if let Some(payload) = self.subscription.try_next() {
            match Signal::decode(&payload) {
                Ok(signal) => self.handle(signal).await,
                Err(e) => error!("dropping malformed bus message: {e}"),
            }
        }

        let priority = self.device.playback_priority().await;
        match priority {
            Priority::AdsOverMusic => self.schedule_ads_over_music().await,
            Priority::Music => self.schedule_music_over_ads().await,
        }

        if self.counter % GENERATOR_EVERY_TICKS == 0 {
            self.spawn_ads_generator(priority).await;
            self.spawn_music_generator().await;
        }

        if self.counter % SYNC_CHECK_EVERY_TICKS == 0 {
            self.counter = 1;
            if let Some(last_sync) = self.last_device_sync {
                let today = self.device.local_time().await.date_naive();
                if today != last_sync {
                    self.device.sync().await;
                }
            }
        } else {
            self.counter += 1;
        }
    }

    /// Under `ads_over_music`, a queued ad interrupts playing music.
    async fn schedule_ads_over_music(&mut self) {
        if !self.player_ready {
            return;
        }

        let should_pick = match &self.current {
            None => true,
            Some(item) => item.track.track_type == TrackType::Music && !self.ads.is_empty(),
        };
        if should_pick {
            if let Some(item) = self.pick_next_track().await {
                self.play_track(item).await;
            }
        }
    }

    /// Under the default priority, only an idle player gets a new track.
    async fn schedule_music_over_ads(&mut self) {
        if self.player_ready && self.current.is_none() {
            if let Some(item) = self.pick_next_track().await {
                self.play_track(item).await;
            }
        }
    }

    /// Drains the ads queue before the music queue and keeps the next draw
    /// time pointing at the moment the picked track will end.
    async fn pick_next_track(&mut self) -> Option<PlaylistItem> {
        let pick = self.ads.pop_front().or_else(|| self.music.pop_front());

        let now = self.device.local_time().await;
        self.next_track_draw_time = Some(match &pick {
            Some(item) => {
                debug!("picked {}", item.track.file);
                now + chrono::Duration::seconds(item.track.length)
            }
            None => now,
        });
        pick
    }

    async fn play_track(&mut self, item: PlaylistItem) {
        self.current = Some(item.clone());
        publish_signal(&*self.bus, &self.player_channel, &Signal::Play(item)).await;
    }

    /// Spawns one ad draw unless the queue is stocked or a draw is running.
    ///
    /// The draw runs on its own task; the busy flag parks the generator
    /// until the matching finish signal comes back over the bus.
    async fn spawn_ads_generator(&mut self, priority: Priority) {
        let Some(generator) = &self.ads_generator else {
            return;
        };
        if !self.ads.is_empty() || self.ads_generator_busy {
            return;
        }
        self.ads_generator_busy = true;

        // With ads on top, draw for now; otherwise ads are drawn for the
        // moment the current track runs out.
        let draw_time = match (priority, self.next_track_draw_time) {
            (Priority::AdsOverMusic, _) | (_, None) => self.device.local_time().await,
            (_, Some(t)) => t,
        };

        let generator = Arc::clone(generator);
        tokio::spawn(async move {
            if let Err(e) = generator.lock().await.draw_and_download(draw_time).await {
                error!("ad draw aborted: {e}");
            }
        });
    }

    /// Spawns one music draw unless the queue is stocked or a draw is
    /// running.
    async fn spawn_music_generator(&mut self) {
        let Some(generator) = &self.music_generator else {
            return;
        };
        if !self.music.is_empty() || self.music_generator_busy {
            return;
        }
        self.music_generator_busy = true;

        let draw_time = match self.next_track_draw_time {
            Some(t) => t,
            None => self.device.local_time().await,
        };

        let generator = Arc::clone(generator);
        tokio::spawn(async move {
            generator.lock().await.draw_and_download(draw_time).await;
        });
    }

    async fn handle(&mut self, signal: Signal) {
        match signal {
            Signal::PlayerReady => {
                debug!("received PLAYER_READY");
                self.player_ready = true;
                self.push_volume().await;
            }
            // The player restarted or outlived our bookkeeping; whatever we
            // thought was playing is not.
            Signal::PlayerIdle => {
                debug!("received PLAYER_IDLE");
                self.player_ready = true;
                self.current = None;
                self.next_track_draw_time = None;
                if self.player_idle != Some(true) {
                    self.player_idle = Some(true);
                }
            }
            Signal::TrackPlay(item) => {
                self.player_idle = Some(false);
                self.ack_play(&item).await;
            }
            Signal::TrackFinished(item) => {
                debug!("finished playing {}", item.track.file);
                self.current = None;
            }
            Signal::AdTrackDownloaded(item) => {
                debug!("queueing downloaded ad {}", item.track.file);
                self.ads.push_back(item);
            }
            Signal::MusicTrackDownloaded(item) => {
                debug!("queueing downloaded track {}", item.track.file);
                self.music.push_back(item);
            }
            Signal::MusicTrackDownloadFailed(item) => {
                debug!("failed to download {}", item.track.file);
            }
            Signal::DeviceSync => self.on_device_sync().await,
            Signal::AdsGeneratorFinished => self.ads_generator_busy = false,
            Signal::MusicGeneratorFinished => self.music_generator_busy = false,
            Signal::Ignored(name) => debug!("ignoring unknown signal `{name}`"),
            // Player-bound commands echoed onto our channel are not ours.
            other => debug!("ignoring signal {} on the scheduler channel", other.name()),
        }
    }

    /// Adopts a freshly synced schedule: drops pending playlists, rebuilds
    /// the generators, and skips whatever is playing so the new schedule
    /// takes over immediately.
    async fn on_device_sync(&mut self) {
        debug!("received DEVICE_SYNC");
        self.ads.clear();
        self.music.clear();

        self.ads_generator = Some(Arc::new(Mutex::new(AdsGenerator::new(
            self.device.clone(),
            self.storage.clone(),
            self.bus.clone(),
            self.scheduler_channel.clone(),
        ))));
        self.music_generator = Some(Arc::new(Mutex::new(MusicGenerator::new(
            self.device.clone(),
            self.storage.clone(),
            self.bus.clone(),
            self.scheduler_channel.clone(),
        ))));

        self.push_volume().await;
        publish_signal(&*self.bus, &self.player_channel, &Signal::Skip).await;
        self.last_device_sync = Some(self.device.local_time().await.date_naive());

        let url = self.client.device_url("ack-sync");
        if self.client.post(&url, None).await.is_none() {
            debug!("sync ack was not accepted");
        }
    }

    async fn push_volume(&self) {
        let volume = self.device.volume().await;
        publish_signal(
            &*self.bus,
            &self.player_channel,
            &Signal::SetVolume(volume),
        )
        .await;
    }

    /// Reports a started track to the control service.
    async fn ack_play(&self, item: &PlaylistItem) {
        let now = self.device.local_time().await;
        debug!("player started {} at {now}", item.track.file);

        let url = self.client.device_url("ack-play");
        let payload = json!({
            "id": item.track.id,
            "track_type": item.track.track_type,
            "timestamp": now.to_rfc3339(),
        });
        if self.client.post(&url, Some(&payload)).await.is_none() {
            debug!("play ack was not accepted");
        }
    }
}
