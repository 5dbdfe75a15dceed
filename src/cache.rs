//! Typed views over the bus key-value store.
//!
//! Each cache owns one key (or one key family) and does exactly one store
//! operation per call, so concurrent readers and writers see whole values.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::bus::{Error, Store};
use crate::model::{AdBlock, AudioTrack, DeviceInfo, MusicBlock};

/// Key holding the device record.
const DEVICE_KEY: &str = "DEVICE";

/// Key holding the music schedule.
const MUSIC_BLOCKS_KEY: &str = "MUSIC_BLOCKS";

/// Key holding the ad schedule.
const AD_BLOCKS_KEY: &str = "AD_BLOCKS";

/// Key prefix of the per-track entries.
const AUDIO_TRACK_PREFIX: &str = "AUDIO_TRACK:";

/// Key prefix of the download-LRU entries.
const DOWNLOAD_LRU_PREFIX: &str = "DL:";

/// Timestamp format of the download-LRU entries.
const LRU_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

async fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, Error> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

async fn set_json<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<(), Error> {
    store.set(key, &serde_json::to_string(value)?).await
}

/// The single-key cache holding the device record.
#[derive(Clone)]
pub struct DeviceCache {
    store: Arc<dyn Store>,
}

impl DeviceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<Option<DeviceInfo>, Error> {
        get_json(&*self.store, DEVICE_KEY).await
    }

    pub async fn set(&self, device: &DeviceInfo) -> Result<(), Error> {
        set_json(&*self.store, DEVICE_KEY, device).await
    }
}

/// The single-key cache holding the music schedule.
#[derive(Clone)]
pub struct MusicBlocksCache {
    store: Arc<dyn Store>,
}

impl MusicBlocksCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<Vec<MusicBlock>, Error> {
        Ok(get_json(&*self.store, MUSIC_BLOCKS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn set(&self, blocks: &[MusicBlock]) -> Result<(), Error> {
        set_json(&*self.store, MUSIC_BLOCKS_KEY, &blocks).await
    }
}

/// The single-key cache holding the ad schedule.
#[derive(Clone)]
pub struct AdBlocksCache {
    store: Arc<dyn Store>,
}

impl AdBlocksCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<Vec<AdBlock>, Error> {
        Ok(get_json(&*self.store, AD_BLOCKS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn set(&self, blocks: &[AdBlock]) -> Result<(), Error> {
        set_json(&*self.store, AD_BLOCKS_KEY, &blocks).await
    }
}

/// The per-track cache: one `AUDIO_TRACK:<id>` key per known track.
///
/// This is the authoritative set of track ids the device knows about.
#[derive(Clone)]
pub struct AudioTracksCache {
    store: Arc<dyn Store>,
}

impl AudioTracksCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(id: i64) -> String {
        format!("{AUDIO_TRACK_PREFIX}{id}")
    }

    pub async fn get(&self, id: i64) -> Result<Option<AudioTrack>, Error> {
        get_json(&*self.store, &Self::key(id)).await
    }

    pub async fn set(&self, track: &AudioTrack) -> Result<(), Error> {
        set_json(&*self.store, &Self::key(track.id), track).await
    }

    pub async fn all(&self) -> Result<HashMap<i64, AudioTrack>, Error> {
        let mut tracks = HashMap::new();
        for key in self.store.keys(&format!("{AUDIO_TRACK_PREFIX}*")).await? {
            if let Some(track) = get_json::<AudioTrack>(&*self.store, &key).await? {
                tracks.insert(track.id, track);
            }
        }
        Ok(tracks)
    }

    /// Reconciles the cache against a freshly synced track list.
    ///
    /// Keys absent from `tracks` are deleted and their former values are
    /// returned so the caller can remove the matching files; every entry of
    /// `tracks` is then upserted.
    pub async fn update(&self, tracks: &[AudioTrack]) -> Result<Vec<AudioTrack>, Error> {
        let current = self.store.keys(&format!("{AUDIO_TRACK_PREFIX}*")).await?;
        let keep: Vec<String> = tracks.iter().map(|track| Self::key(track.id)).collect();

        let mut removed = Vec::new();
        for key in current {
            if keep.contains(&key) {
                continue;
            }
            if let Some(track) = get_json::<AudioTrack>(&*self.store, &key).await? {
                removed.push(track);
            }
            self.store.delete(&key).await?;
        }

        for track in tracks {
            self.set(track).await?;
        }

        Ok(removed)
    }
}

/// Last-use timestamps of the files in the download directory, keyed
/// `DL:<filename>`.
#[derive(Clone)]
pub struct DownloadLruCache {
    store: Arc<dyn Store>,
}

impl DownloadLruCache {
    fn key(filename: &str) -> String {
        format!("{DOWNLOAD_LRU_PREFIX}{filename}")
    }

    fn now() -> String {
        Utc::now().naive_utc().format(LRU_TIMESTAMP_FORMAT).to_string()
    }

    /// Opens the cache, adopting any file in `download_dir` that has no
    /// entry yet with a timestamp of now.
    pub async fn open(store: Arc<dyn Store>, download_dir: &Path) -> Result<Self, Error> {
        let cache = Self { store };

        let mut entries = tokio::fs::read_dir(download_dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            let key = Self::key(&filename);
            if cache.store.get(&key).await?.is_none() {
                cache.store.set(&key, &Self::now()).await?;
            }
        }

        Ok(cache)
    }

    /// Stamps a filename as used right now.
    pub async fn touch(&self, filename: &str) -> Result<(), Error> {
        self.store.set(&Self::key(filename), &Self::now()).await
    }

    pub async fn remove(&self, filename: &str) -> Result<(), Error> {
        self.store.delete(&Self::key(filename)).await
    }

    /// Returns every entry as `(filename, last use)`.
    ///
    /// Entries whose timestamp does not parse are skipped with a warning.
    pub async fn all(&self) -> Result<Vec<(String, NaiveDateTime)>, Error> {
        let mut entries = Vec::new();
        for key in self.store.keys(&format!("{DOWNLOAD_LRU_PREFIX}*")).await? {
            let Some(filename) = key.strip_prefix(DOWNLOAD_LRU_PREFIX) else {
                continue;
            };
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match NaiveDateTime::parse_from_str(&raw, LRU_TIMESTAMP_FORMAT) {
                Ok(timestamp) => entries.push((filename.to_owned(), timestamp)),
                Err(e) => warn!("skipping unparsable LRU entry `{key}`: {e}"),
            }
        }
        Ok(entries)
    }
}
