//! The device: typed access to the synced state and the sync protocol
//! against the control service.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bus::{self, publish_signal, Channel, Store};
use crate::cache::{AdBlocksCache, AudioTracksCache, DeviceCache, MusicBlocksCache};
use crate::client::{RemoteClient, RESPONSE_TIMEOUT};
use crate::config::Config;
use crate::model::{AdBlock, AudioTrack, DeviceState, MusicBlock, Priority};
use crate::signal::Signal;
use crate::storage::TrackStorage;

/// How many times to try starting a sync task.
const SYNC_START_ATTEMPTS: u32 = 3;

/// Random backoff between sync-task start attempts, in seconds.
const SYNC_START_BACKOFF_SECS: RangeInclusive<u64> = 10..=30;

/// How many times to poll for the sync task's result.
const SYNC_POLL_ATTEMPTS: u32 = 10;

/// First poll delay; doubles each miss up to [`SYNC_POLL_DELAY_CAP`].
const SYNC_POLL_DELAY: Duration = Duration::from_secs(10);

const SYNC_POLL_DELAY_CAP: Duration = Duration::from_secs(180);

/// Response timeout while polling (the task may take a while server-side).
const SYNC_POLL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors which end a sync attempt.
#[derive(Debug, thiserror::Error)]
pub enum SyncFailed {
    #[error("failed to start sync task on remote server")]
    Start,

    #[error("device state polling exhausted")]
    Exhausted,

    #[error("malformed device state: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct StartedTask {
    task_id: String,
}

/// The device-local view of the fleet state.
pub struct Device {
    device_cache: DeviceCache,
    music_blocks_cache: MusicBlocksCache,
    ad_blocks_cache: AdBlocksCache,
    audio_tracks_cache: AudioTracksCache,
    storage: Arc<TrackStorage>,
    client: RemoteClient,
    bus: Arc<dyn Channel>,
    scheduler_channel: String,
    sync_in_progress: AtomicBool,
    start_backoff: RangeInclusive<u64>,
    poll_delay: Duration,
}

impl Device {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<TrackStorage>,
        client: RemoteClient,
        bus: Arc<dyn Channel>,
        config: &Config,
    ) -> Self {
        Self {
            device_cache: DeviceCache::new(store.clone()),
            music_blocks_cache: MusicBlocksCache::new(store.clone()),
            ad_blocks_cache: AdBlocksCache::new(store.clone()),
            audio_tracks_cache: AudioTracksCache::new(store),
            storage,
            client,
            bus,
            scheduler_channel: config.scheduler_channel.clone(),
            sync_in_progress: AtomicBool::new(false),
            start_backoff: SYNC_START_BACKOFF_SECS,
            poll_delay: SYNC_POLL_DELAY,
        }
    }

    /// Overrides the retry pacing; used by tests to avoid real backoff.
    pub fn with_backoff(mut self, start_backoff: RangeInclusive<u64>, poll_delay: Duration) -> Self {
        self.start_backoff = start_backoff;
        self.poll_delay = poll_delay;
        self
    }

    /// Fetches the remote state and decomposes it into the caches.
    ///
    /// At most one sync runs at a time; a failed fetch keeps the existing
    /// caches. Either way a `DEVICE_SYNC` signal is published at the end so
    /// the scheduler resumes with whatever state is available.
    pub async fn sync(&self) {
        if self.sync_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.fetch_state().await {
            Ok(state) => {
                if let Err(e) = self.apply_state(&state).await {
                    error!("unable to store synced device state: {e}");
                }
            }
            Err(e) => error!("failed to sync device, using state from cache: {e}"),
        }
        self.sync_in_progress.store(false, Ordering::SeqCst);

        publish_signal(&*self.bus, &self.scheduler_channel, &Signal::DeviceSync).await;
    }

    async fn fetch_state(&self) -> Result<DeviceState, SyncFailed> {
        let task_id = self.start_sync_task().await?;
        self.poll_state(&task_id).await
    }

    /// Asks the control service to assemble the device state.
    async fn start_sync_task(&self) -> Result<String, SyncFailed> {
        let url = self.client.device_url("get-state");

        for attempt in 1..=SYNC_START_ATTEMPTS {
            if let Some(response) = self.client.get(&url, &[], RESPONSE_TIMEOUT).await {
                if response.status() == StatusCode::OK {
                    match response.json::<StartedTask>().await {
                        Ok(task) => return Ok(task.task_id),
                        Err(e) => warn!("sync task response was malformed: {e}"),
                    }
                }
            }

            if attempt < SYNC_START_ATTEMPTS {
                let backoff = Duration::from_secs(fastrand::u64(self.start_backoff.clone()));
                debug!("sync start attempt {attempt} failed, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SyncFailed::Start)
    }

    /// Polls the sync task until it carries a result.
    async fn poll_state(&self, task_id: &str) -> Result<DeviceState, SyncFailed> {
        let url = self.client.device_url("get-state");
        let mut delay = self.poll_delay;

        for _ in 0..SYNC_POLL_ATTEMPTS {
            let response = self
                .client
                .get(&url, &[("task_id", task_id)], SYNC_POLL_RESPONSE_TIMEOUT)
                .await;

            if let Some(response) = response {
                match response.json::<serde_json::Value>().await {
                    Ok(mut body) => {
                        if let Some(result) = body.get_mut("result") {
                            info!("successfully synced device state");
                            return Ok(serde_json::from_value(result.take())?);
                        }
                    }
                    Err(e) => warn!("sync poll response was malformed: {e}"),
                }
            }

            debug!("sync task is still executing, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(SYNC_POLL_DELAY_CAP);
        }

        Err(SyncFailed::Exhausted)
    }

    /// Writes the four sub-states into their caches and drops the files of
    /// tracks that are no longer scheduled.
    async fn apply_state(&self, state: &DeviceState) -> Result<(), bus::Error> {
        self.device_cache.set(&state.device).await?;
        self.music_blocks_cache.set(&state.music_blocks).await?;
        self.ad_blocks_cache.set(&state.ad_blocks).await?;

        let removed = self.audio_tracks_cache.update(&state.audio_tracks).await?;
        self.storage.remove_tracks(&removed).await;
        Ok(())
    }

    async fn cached(&self) -> Option<crate::model::DeviceInfo> {
        match self.device_cache.get().await {
            Ok(device) => device,
            Err(e) => {
                warn!("unable to read the device cache: {e}");
                None
            }
        }
    }

    /// The configured volume, defaulting to full.
    pub async fn volume(&self) -> i64 {
        self.cached().await.map_or(100, |device| device.volume)
    }

    /// The device timezone, defaulting to UTC.
    pub async fn timezone(&self) -> Tz {
        let Some(device) = self.cached().await else {
            return Tz::UTC;
        };
        device.timezone_name.parse().unwrap_or_else(|_| {
            warn!("unknown timezone `{}`, using UTC", device.timezone_name);
            Tz::UTC
        })
    }

    pub async fn playback_priority(&self) -> Priority {
        self.cached()
            .await
            .map_or_else(Priority::default, |device| device.playback_priority)
    }

    /// Now, in the device timezone.
    pub async fn local_time(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone().await)
    }

    pub async fn music_blocks(&self) -> Vec<MusicBlock> {
        self.music_blocks_cache.get().await.unwrap_or_else(|e| {
            warn!("unable to read the music blocks cache: {e}");
            Vec::new()
        })
    }

    pub async fn ad_blocks(&self) -> Vec<AdBlock> {
        self.ad_blocks_cache.get().await.unwrap_or_else(|e| {
            warn!("unable to read the ad blocks cache: {e}");
            Vec::new()
        })
    }

    pub async fn audio_track(&self, id: i64) -> Option<AudioTrack> {
        self.audio_tracks_cache.get(id).await.unwrap_or_else(|e| {
            warn!("unable to read audio track {id}: {e}");
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::Device;
    use crate::bus::{Channel, MemoryBus, Subscription};
    use crate::cache::AudioTracksCache;
    use crate::client::RemoteClient;
    use crate::config::Config;
    use crate::model::{AudioTrack, Priority, TrackType};
    use crate::signal::Signal;
    use crate::storage::TrackStorage;

    fn config(app_url: &str, download_dir: &std::path::Path) -> Config {
        Config {
            device_id: "dev-1".to_owned(),
            app_url: app_url.to_owned(),
            api_key: "hunter2".to_owned(),
            download_dir: download_dir.to_path_buf(),
            media_backend: "dummy".to_owned(),
            redis_url: "redis://localhost".to_owned(),
            scheduler_channel: "SCHEDULER_REDIS_CHANNEL".to_owned(),
            player_channel: "PLAYER_REDIS_CHANNEL".to_owned(),
            debug: false,
        }
    }

    async fn device(
        bus: Arc<MemoryBus>,
        app_url: &str,
        download_dir: &std::path::Path,
    ) -> (Device, Subscription) {
        let config = config(app_url, download_dir);
        let storage = Arc::new(
            TrackStorage::open(bus.clone(), download_dir).await.unwrap(),
        );
        let client = RemoteClient::new(&config).unwrap();
        let subscription = bus.subscribe(&config.scheduler_channel).await.unwrap();

        let device = Device::new(bus.clone(), storage, client, bus, &config)
            .with_backoff(0..=0, Duration::ZERO);
        (device, subscription)
    }

    fn track(id: i64) -> AudioTrack {
        AudioTrack {
            id,
            file: format!("{id}.ogg"),
            track_type: TrackType::Music,
            length: 1,
            size: 16,
            url: format!("http://cdn.example/{id}.ogg"),
        }
    }

    fn state() -> serde_json::Value {
        json!({
            "device": {
                "id": "dev-1",
                "timezone_name": "Europe/Warsaw",
                "volume": 55,
                "playback_priority": "ads_over_music",
            },
            "audio_tracks": [track(1), track(2)],
            "music_blocks": [
                {"id": 1, "start": "00:00:00", "end": "23:59:59", "tracks": [1, 2]},
            ],
            "ad_blocks": [],
        })
    }

    #[tokio::test]
    async fn defaults_before_any_sync() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let (device, _sub) = device(bus, "http://127.0.0.1:1", dir.path()).await;

        assert_eq!(device.volume().await, 100);
        assert_eq!(device.timezone().await, chrono_tz::Tz::UTC);
        assert_eq!(device.playback_priority().await, Priority::Music);
        assert!(device.music_blocks().await.is_empty());
    }

    #[tokio::test]
    async fn sync_decomposes_state_and_reconciles_tracks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .and(query_param("task_id", "t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": state()})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_id": "t-1"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());

        // A previously synced track that the new state no longer carries.
        let tracks = AudioTracksCache::new(bus.clone());
        tracks.set(&track(9)).await.unwrap();
        std::fs::write(dir.path().join("9.ogg"), b"stale").unwrap();

        let (device, mut sub) = device(bus, &server.uri(), dir.path()).await;
        device.sync().await;

        assert_eq!(device.volume().await, 55);
        assert_eq!(device.playback_priority().await, Priority::AdsOverMusic);
        assert_eq!(device.timezone().await.name(), "Europe/Warsaw");
        assert_eq!(device.music_blocks().await.len(), 1);
        assert!(device.audio_track(1).await.is_some());
        assert!(device.audio_track(9).await.is_none());
        assert!(!dir.path().join("9.ogg").exists());

        let payload = sub.try_next().unwrap();
        assert_eq!(Signal::decode(&payload).unwrap(), Signal::DeviceSync);
    }

    #[tokio::test]
    async fn failed_sync_keeps_the_cache_and_still_acks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());

        let tracks = AudioTracksCache::new(bus.clone());
        tracks.set(&track(3)).await.unwrap();

        let (device, mut sub) = device(bus, &server.uri(), dir.path()).await;
        device.sync().await;

        // The cache survives the outage and the scheduler is still kicked.
        assert!(device.audio_track(3).await.is_some());
        let payload = sub.try_next().unwrap();
        assert_eq!(Signal::decode(&payload).unwrap(), Signal::DeviceSync);

        // All three start attempts hit the server.
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn polling_waits_out_a_pending_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .and(query_param("task_id", "t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .and(query_param("task_id", "t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": state()})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_id": "t-2"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let (device, mut sub) = device(bus, &server.uri(), dir.path()).await;
        device.sync().await;

        assert_eq!(device.volume().await, 55);
        assert!(sub.try_next().is_some());
    }
}
