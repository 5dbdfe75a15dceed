//! The noise generators: background workers that draw candidate tracks from
//! the current schedule and download them, announcing results on the
//! scheduler channel.
//!
//! Drawing (schedule lookup and random selection) is kept separate from
//! downloading so the draw cadence can be exercised without I/O.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use tracing::{debug, error};

use crate::bus::{publish_signal, Channel};
use crate::device::Device;
use crate::model::{block_contains, AdBlock, PlaylistItem};
use crate::signal::Signal;
use crate::storage::{DownloadFailed, TrackStorage};

/// How many recently played track ids the music generator avoids.
const HISTORY_LEN: usize = 10;

/// How often to redraw before accepting a repeat from the history.
const DRAW_RETRIES: usize = 100;

/// Draws music tracks from the block active at the draw time.
pub struct MusicGenerator {
    device: Arc<Device>,
    storage: Arc<TrackStorage>,
    bus: Arc<dyn Channel>,
    scheduler_channel: String,
    history: VecDeque<i64>,
}

impl MusicGenerator {
    pub fn new(
        device: Arc<Device>,
        storage: Arc<TrackStorage>,
        bus: Arc<dyn Channel>,
        scheduler_channel: String,
    ) -> Self {
        Self {
            device,
            storage,
            bus,
            scheduler_channel,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Draws one track for `draw_time`, downloads it and announces the
    /// outcome; always finishes with `MUSIC_GENERATOR_FINISHED`.
    pub async fn draw_and_download(&mut self, draw_time: DateTime<Tz>) {
        if let Some(item) = self.draw(draw_time).await {
            debug!("drawn music track: {}", item.track.file);
            self.download_and_ack(item).await;
        }
        self.notify_finished().await;
    }

    /// Picks a track id from the active block, avoiding the recent history.
    pub async fn draw(&mut self, draw_time: DateTime<Tz>) -> Option<PlaylistItem> {
        let blocks = self.device.music_blocks().await;
        let block = blocks
            .iter()
            .find(|block| block_contains(block.start, block.end, draw_time))?;
        if block.tracks.is_empty() {
            return None;
        }

        let id = self.pick(&block.tracks);
        self.remember(id);

        let Some(track) = self.device.audio_track(id).await else {
            error!("music block {} references unknown track {id}", block.id);
            return None;
        };
        Some(self.storage.playlist_item(track))
    }

    /// Uniform draw with up to [`DRAW_RETRIES`] attempts to dodge the
    /// history; the last draw is accepted even when it repeats.
    fn pick(&self, population: &[i64]) -> i64 {
        let mut id = population[0];
        for _ in 0..DRAW_RETRIES {
            id = population[fastrand::usize(..population.len())];
            if !self.history.contains(&id) {
                break;
            }
        }
        id
    }

    fn remember(&mut self, id: i64) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(id);
    }

    async fn download_and_ack(&self, item: PlaylistItem) {
        let signal = match self.storage.download(&item.track).await {
            Ok(()) => Signal::MusicTrackDownloaded(item),
            Err(e) => {
                debug!("music download failed: {e}");
                Signal::MusicTrackDownloadFailed(item)
            }
        };
        publish_signal(&*self.bus, &self.scheduler_channel, &signal).await;
    }

    async fn notify_finished(&self) {
        publish_signal(
            &*self.bus,
            &self.scheduler_channel,
            &Signal::MusicGeneratorFinished,
        )
        .await;
    }
}

/// Draws ad batches on the interval configured by the active ad block.
pub struct AdsGenerator {
    device: Arc<Device>,
    storage: Arc<TrackStorage>,
    bus: Arc<dyn Channel>,
    scheduler_channel: String,
    current_block_id: Option<i64>,
    next_draw: Option<DateTime<Tz>>,
}

impl AdsGenerator {
    pub fn new(
        device: Arc<Device>,
        storage: Arc<TrackStorage>,
        bus: Arc<dyn Channel>,
        scheduler_channel: String,
    ) -> Self {
        Self {
            device,
            storage,
            bus,
            scheduler_channel,
            current_block_id: None,
            next_draw: None,
        }
    }

    /// Draws the due ad batch for `draw_time` (possibly empty), downloads
    /// and announces each ad, and finishes with `ADS_GENERATOR_FINISHED`.
    ///
    /// A download failure propagates: ad delivery is fail-fast, and the
    /// missing finish signal keeps the generator parked until the next
    /// device sync rebuilds it.
    pub async fn draw_and_download(&mut self, draw_time: DateTime<Tz>) -> Result<(), DownloadFailed> {
        if let Some(batch) = self.draw(draw_time).await {
            for item in batch {
                debug!("drawn ad track: {}", item.track.file);
                self.storage.download(&item.track).await?;
                publish_signal(
                    &*self.bus,
                    &self.scheduler_channel,
                    &Signal::AdTrackDownloaded(item),
                )
                .await;
            }
        }
        self.notify_finished().await;
        Ok(())
    }

    /// Returns the batch to play now: `None` when no block is active, an
    /// empty batch when the active block's interval has not elapsed yet.
    pub async fn draw(&mut self, draw_time: DateTime<Tz>) -> Option<Vec<PlaylistItem>> {
        let blocks = self.device.ad_blocks().await;
        let block = blocks
            .iter()
            .find(|block| block_contains(block.start, block.end, draw_time))?;

        let due = self.current_block_id != Some(block.id)
            || draw_time >= self.next_draw.unwrap_or(draw_time);
        self.current_block_id = Some(block.id);

        if !due {
            return Some(Vec::new());
        }

        let (batch, wait) = self.draw_ads(block).await;
        self.next_draw = Some(draw_time + wait);
        Some(batch)
    }

    /// Draws one batch from a block and computes the wait until the next.
    ///
    /// The wait is shortened by two seconds under the batch duration so the
    /// next batch is ready before the music after it starts.
    async fn draw_ads(&self, block: &AdBlock) -> (Vec<PlaylistItem>, Duration) {
        let interval = Duration::minutes(block.playback_interval);
        if block.tracks.is_empty() {
            debug!("no ad tracks to draw from, skipping");
            return (Vec::new(), interval);
        }

        let ids: Vec<i64> = if block.play_all_ads {
            block.tracks.clone()
        } else {
            (0..block.ads_count_per_block)
                .map(|_| block.tracks[fastrand::usize(..block.tracks.len())])
                .collect()
        };

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            match self.device.audio_track(id).await {
                Some(track) => batch.push(self.storage.playlist_item(track)),
                None => error!("ad block {} references unknown track {id}", block.id),
            }
        }

        let total: i64 = batch.iter().map(|item| item.track.length).sum();
        (batch, Duration::seconds((total - 2).max(0)) + interval)
    }

    async fn notify_finished(&self) {
        publish_signal(
            &*self.bus,
            &self.scheduler_channel,
            &Signal::AdsGeneratorFinished,
        )
        .await;
    }
}
