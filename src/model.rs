//! The data model shared by both daemons: audio tracks, schedule blocks and
//! the device itself, all serialized as JSON on the bus and in the caches.

use chrono::{DateTime, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Whether a track belongs to the music pool or to an ad campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Music,
    Ad,
}

/// Which of the two queues wins when both hold a track.
///
/// `music_over_ads` is accepted on the wire as a synonym for `music`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    #[serde(alias = "music_over_ads")]
    Music,
    AdsOverMusic,
}

/// A single playable track as known to the control service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub id: i64,

    /// Basename of the file inside the download directory.
    pub file: String,

    pub track_type: TrackType,

    /// Duration in seconds.
    pub length: i64,

    /// Size in bytes, used for the free-space check before downloading.
    pub size: u64,

    /// Object URL the file is fetched from.
    pub url: String,
}

/// An [`AudioTrack`] that has been drawn by a generator and resolved to a
/// local file, ready to be handed to the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    #[serde(flatten)]
    pub track: AudioTrack,

    /// `file://` uri of the track inside the download directory.
    pub uri: String,
}

/// A time-of-day window with the pool of music tracks eligible during it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicBlock {
    pub id: i64,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub tracks: Vec<i64>,
}

/// A time-of-day window with an ad pool and its drawing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdBlock {
    pub id: i64,
    pub start: NaiveTime,
    pub end: NaiveTime,

    /// How many ads to draw per batch when not playing all of them.
    pub ads_count_per_block: usize,

    /// Play every track in the block, in stored order, instead of drawing.
    pub play_all_ads: bool,

    /// Minutes between consecutive ad batches.
    pub playback_interval: i64,

    pub tracks: Vec<i64>,
}

/// The device record as replaced on each successful sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,

    /// IANA timezone name the schedule is resolved against.
    pub timezone_name: String,

    /// Playback volume, 0-100.
    pub volume: i64,

    pub playback_priority: Priority,
}

/// The full state carried by the control service's sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device: DeviceInfo,
    pub audio_tracks: Vec<AudioTrack>,
    pub music_blocks: Vec<MusicBlock>,
    pub ad_blocks: Vec<AdBlock>,
}

/// Whether the instant `at` falls inside a block's time-of-day window.
///
/// The stored times are combined with `at`'s local date in `at`'s timezone;
/// a boundary that does not exist locally (DST gap) makes the block not
/// match for that probe.
pub fn block_contains(start: NaiveTime, end: NaiveTime, at: DateTime<Tz>) -> bool {
    let date = at.date_naive();
    let tz = at.timezone();
    let (Some(start), Some(end)) = (
        date.and_time(start).and_local_timezone(tz).earliest(),
        date.and_time(end).and_local_timezone(tz).earliest(),
    ) else {
        return false;
    };

    start <= at && at <= end
}
