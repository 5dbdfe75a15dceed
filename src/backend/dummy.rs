//! A deterministic media backend: "plays" a track by reporting itself busy
//! for the track's length. The reference backend for tests and for running
//! the daemons on machines without audio hardware.

use tokio::time::{Duration, Instant};

use super::{Error, MediaBackend};
use crate::model::PlaylistItem;

/// A backend that plays silence of exactly the right duration.
#[derive(Default)]
pub struct DummyBackend {
    playing_until: Option<Instant>,
    volume: i64,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            playing_until: None,
            volume: 100,
        }
    }
}

impl MediaBackend for DummyBackend {
    fn play(&mut self, item: &PlaylistItem) -> Result<(), Error> {
        let length = Duration::from_secs(item.track.length.max(0) as u64);
        self.playing_until = Some(Instant::now() + length);
        Ok(())
    }

    fn stop(&mut self) {
        self.playing_until = None;
    }

    fn is_playing(&self) -> bool {
        self.playing_until.is_some_and(|until| Instant::now() < until)
    }

    fn set_volume(&mut self, volume: i64) {
        self.volume = volume.clamp(0, 100);
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Duration;

    use super::DummyBackend;
    use crate::backend::MediaBackend;
    use crate::model::{AudioTrack, PlaylistItem, TrackType};

    fn item(length: i64) -> PlaylistItem {
        PlaylistItem {
            track: AudioTrack {
                id: 1,
                file: "1.ogg".to_owned(),
                track_type: TrackType::Music,
                length,
                size: 16,
                url: "http://cdn.example/1.ogg".to_owned(),
            },
            uri: "file:///tmp/1.ogg".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_for_exactly_the_track_length() {
        let mut backend = DummyBackend::new();
        backend.play(&item(3)).unwrap();
        assert!(backend.is_playing());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.is_playing());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backend.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_playback() {
        let mut backend = DummyBackend::new();
        backend.play(&item(60)).unwrap();
        backend.stop();
        assert!(!backend.is_playing());
    }

    #[test]
    fn volume_is_clamped() {
        let mut backend = DummyBackend::new();
        backend.set_volume(180);
        assert_eq!(backend.volume, 100);
        backend.set_volume(-5);
        assert_eq!(backend.volume, 0);
    }
}
