//! On-disk track storage: lazy downloads into a single directory, bounded by
//! a free-space floor that is maintained by evicting the least recently used
//! file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::bus::{self, Store};
use crate::cache::DownloadLruCache;
use crate::model::{AudioTrack, PlaylistItem};

/// Free space the storage refuses to eat into: 1 GiB.
pub const SAFE_FREE_BYTES: u64 = 1 << 30;

/// Connect timeout of track downloads.
const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// What went wrong while fetching or writing a track.
#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {0}")]
    Status(StatusCode),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] bus::Error),
}

/// A failed download, carrying the track it was for.
#[derive(Debug, thiserror::Error)]
#[error("download failed for {}: {kind}", .track.file)]
pub struct DownloadFailed {
    pub track: AudioTrack,

    #[source]
    pub kind: Kind,
}

/// Probe for the free bytes available to a directory.
///
/// A trait so tests can script disk pressure; production uses [`SystemDisk`].
pub trait DiskSpace: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`DiskSpace`] backed by the mounted-disk list of the operating system.
///
/// The disk whose mount point is the longest prefix of `path` wins.
pub struct SystemDisk;

impl DiskSpace for SystemDisk {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk contains {}", path.display()),
                )
            })
    }
}

/// The download directory and its LRU bookkeeping.
pub struct TrackStorage {
    download_dir: PathBuf,
    lru: DownloadLruCache,
    http: reqwest::Client,
    disk: Box<dyn DiskSpace>,
}

impl TrackStorage {
    /// Opens the storage, creating the download directory if absent and
    /// adopting any files already in it.
    pub async fn open(store: Arc<dyn Store>, download_dir: &Path) -> eyre::Result<Self> {
        fs::create_dir_all(download_dir).await?;
        let lru = DownloadLruCache::open(store, download_dir).await?;
        let http = reqwest::Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            download_dir: download_dir.to_path_buf(),
            lru,
            http,
            disk: Box::new(SystemDisk),
        })
    }

    /// Replaces the free-space probe; used by tests to script disk pressure.
    pub fn with_disk(mut self, disk: Box<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    /// The absolute path a track is stored at.
    pub fn track_path(&self, track: &AudioTrack) -> PathBuf {
        self.download_dir.join(&track.file)
    }

    /// The `file://` uri the player will be handed for a track.
    pub fn playlist_item(&self, track: AudioTrack) -> PlaylistItem {
        let uri = format!("file://{}", self.track_path(&track).display());
        PlaylistItem { track, uri }
    }

    /// Ensures a track is on disk, evicting old files until it fits.
    ///
    /// A file that is already present is only re-stamped in the LRU. Any
    /// fetch or write failure raises [`DownloadFailed`] without stamping,
    /// and a partial file is not left behind.
    pub async fn download(&self, track: &AudioTrack) -> Result<(), DownloadFailed> {
        let path = self.track_path(track);

        if path.exists() {
            debug!("file {} already present in filesystem", track.file);
        } else {
            self.make_room_for(track).await?;
            if let Err(kind) = self.fetch(track, &path).await {
                let _ = fs::remove_file(&path).await;
                return Err(DownloadFailed {
                    track: track.clone(),
                    kind,
                });
            }
            debug!("downloaded file {}", track.file);
        }

        self.lru.touch(&track.file).await.map_err(|e| DownloadFailed {
            track: track.clone(),
            kind: e.into(),
        })
    }

    /// Loops until the free space fits the track above the safe floor.
    async fn make_room_for(&self, track: &AudioTrack) -> Result<(), DownloadFailed> {
        let failed = |kind: Kind| DownloadFailed {
            track: track.clone(),
            kind,
        };

        loop {
            let free = self
                .disk
                .free_bytes(&self.download_dir)
                .map_err(|e| failed(e.into()))?;
            if free >= SAFE_FREE_BYTES.saturating_add(track.size) {
                return Ok(());
            }

            debug!(
                "unable to download {}, insufficient free space ({free} bytes)",
                track.file
            );
            if !self.release_disk_space().await.map_err(|e| failed(e.into()))? {
                error!(
                    "download directory is out of space and the LRU index is empty; \
                     cannot make room for {}",
                    track.file
                );
            }
        }
    }

    /// Streams a track's url to its path.
    async fn fetch(&self, track: &AudioTrack, path: &Path) -> Result<(), Kind> {
        let response = self.http.get(&track.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Kind::Status(status));
        }

        let mut file = fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(())
    }

    /// Deletes the least recently used file and its LRU entry.
    ///
    /// Returns whether anything was evicted; an empty index is a no-op.
    /// Equal timestamps are broken by filename so eviction order is stable.
    pub async fn release_disk_space(&self) -> Result<bool, bus::Error> {
        let entries = self.lru.all().await?;
        let Some((filename, _)) = entries
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        else {
            return Ok(false);
        };

        self.delete_file(&filename).await?;
        Ok(true)
    }

    /// Unlinks a file and, once that succeeded, drops its LRU entry.
    async fn delete_file(&self, filename: &str) -> Result<(), bus::Error> {
        let path = self.download_dir.join(filename);
        debug!("evicting {} from the download directory", path.display());

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.lru.remove(filename).await
    }

    /// Best-effort removal of the files behind a set of tracks.
    pub async fn remove_tracks(&self, tracks: &[AudioTrack]) {
        for track in tracks {
            let path = self.track_path(track);
            debug!("removing {} from the download directory", path.display());
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    error!("unable to remove {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{DiskSpace, TrackStorage, SAFE_FREE_BYTES};
    use crate::bus::{MemoryBus, Store};
    use crate::model::{AudioTrack, TrackType};

    /// A probe that replays a scripted sequence of free-space readings.
    struct ScriptedDisk(Mutex<Vec<u64>>);

    impl ScriptedDisk {
        fn new(readings: &[u64]) -> Box<Self> {
            Box::new(Self(Mutex::new(readings.iter().rev().copied().collect())))
        }
    }

    impl DiskSpace for ScriptedDisk {
        fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
            let mut readings = self.0.lock().unwrap();
            Ok(readings.pop().unwrap_or(u64::MAX))
        }
    }

    /// A probe that always reports plenty of room.
    struct RoomyDisk;

    impl DiskSpace for RoomyDisk {
        fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    fn track(file: &str, url: &str, size: u64) -> AudioTrack {
        AudioTrack {
            id: 1,
            file: file.to_owned(),
            track_type: TrackType::Music,
            length: 60,
            size,
            url: url.to_owned(),
        }
    }

    async fn storage(store: Arc<MemoryBus>, dir: &Path) -> TrackStorage {
        TrackStorage::open(store, dir)
            .await
            .unwrap()
            .with_disk(Box::new(RoomyDisk))
    }

    #[tokio::test]
    async fn present_file_is_only_touched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hit.ogg"), b"cached").unwrap();

        let store = Arc::new(MemoryBus::new());
        let storage = storage(store.clone(), dir.path()).await;

        // The url is unroutable; reaching for it would fail the download.
        let track = track("hit.ogg", "http://invalid.invalid/hit.ogg", 6);
        let before = Utc::now().naive_utc();
        storage.download(&track).await.unwrap();

        let stamp = store.get("DL:hit.ogg").await.unwrap().unwrap();
        let stamp: chrono::NaiveDateTime =
            chrono::NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S").unwrap();
        assert!(stamp >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn download_writes_file_and_stamps_lru() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fresh.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBus::new());
        let storage = storage(store.clone(), dir.path()).await;

        let track = track("fresh.ogg", &format!("{}/fresh.ogg", server.uri()), 11);
        storage.download(&track).await.unwrap();

        let written = std::fs::read(dir.path().join("fresh.ogg")).unwrap();
        assert_eq!(written, b"audio-bytes");
        assert!(store.get("DL:fresh.ogg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_trace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.ogg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBus::new());
        let storage = storage(store.clone(), dir.path()).await;

        let track = track("gone.ogg", &format!("{}/gone.ogg", server.uri()), 9);
        let err = storage.download(&track).await.unwrap_err();

        assert_eq!(err.track.file, "gone.ogg");
        assert!(!dir.path().join("gone.ogg").exists());
        assert!(store.get("DL:gone.ogg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_removes_the_least_recently_used_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oldest.ogg"), b"a").unwrap();
        std::fs::write(dir.path().join("newer.ogg"), b"b").unwrap();

        let store = Arc::new(MemoryBus::new());
        store.set("DL:oldest.ogg", "2024-01-01 00:00:00").await.unwrap();
        store.set("DL:newer.ogg", "2024-01-02 00:00:00").await.unwrap();

        let storage = storage(store.clone(), dir.path()).await;
        assert!(storage.release_disk_space().await.unwrap());

        assert!(!dir.path().join("oldest.ogg").exists());
        assert!(dir.path().join("newer.ogg").exists());
        assert!(store.get("DL:oldest.ogg").await.unwrap().is_none());
        assert!(store.get("DL:newer.ogg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_lru_eviction_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBus::new());
        let storage = storage(store, dir.path()).await;

        assert!(!storage.release_disk_space().await.unwrap());
    }

    #[tokio::test]
    async fn download_evicts_until_the_floor_is_clear() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tight.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"z".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("victim.ogg"), b"old").unwrap();
        std::fs::write(dir.path().join("keeper.ogg"), b"new").unwrap();

        let store = Arc::new(MemoryBus::new());
        store.set("DL:victim.ogg", "2024-01-01 00:00:00").await.unwrap();
        store.set("DL:keeper.ogg", "2024-03-01 00:00:00").await.unwrap();

        let size = 1024 * 1024;
        // One reading just under the floor, then one that clears it.
        let storage = TrackStorage::open(store.clone(), dir.path())
            .await
            .unwrap()
            .with_disk(ScriptedDisk::new(&[
                SAFE_FREE_BYTES + size - 1,
                SAFE_FREE_BYTES + size,
            ]));

        let track = track("tight.ogg", &format!("{}/tight.ogg", server.uri()), size);
        storage.download(&track).await.unwrap();

        assert!(!dir.path().join("victim.ogg").exists());
        assert!(dir.path().join("keeper.ogg").exists());
        assert!(dir.path().join("tight.ogg").exists());
        assert!(store.get("DL:victim.ogg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_tracks_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("here.ogg"), b"x").unwrap();

        let store = Arc::new(MemoryBus::new());
        let storage = storage(store, dir.path()).await;

        let tracks = [
            track("here.ogg", "http://cdn.example/here.ogg", 1),
            track("missing.ogg", "http://cdn.example/missing.ogg", 1),
        ];
        storage.remove_tracks(&tracks).await;

        assert!(!dir.path().join("here.ogg").exists());
    }
}
