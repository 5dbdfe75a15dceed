//! The real audio backend, decoding downloaded files through [`rodio`].

use std::fs::File;
use std::io::BufReader;

use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tracing::debug;

use super::{Error, MediaBackend};
use crate::model::PlaylistItem;

/// A backend playing through the default audio output.
pub struct RodioBackend {
    /// Keeps the output device alive for the sink.
    _stream: OutputStream,
    sink: Sink,
}

impl RodioBackend {
    pub fn new() -> Result<Self, Error> {
        let stream = OutputStreamBuilder::open_default_stream()?;
        let sink = Sink::connect_new(stream.mixer());
        Ok(Self {
            _stream: stream,
            sink,
        })
    }
}

impl MediaBackend for RodioBackend {
    fn play(&mut self, item: &PlaylistItem) -> Result<(), Error> {
        let path = item
            .uri
            .strip_prefix("file://")
            .ok_or_else(|| Error::Uri(item.uri.clone()))?;

        let file = File::open(path)?;
        let source = Decoder::new(BufReader::new(file))?;

        debug!("queueing {path} on the audio sink");
        self.sink.stop();
        self.sink.append(source);
        self.sink.play();
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.stop();
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    fn set_volume(&mut self, volume: i64) {
        self.sink.set_volume(volume.clamp(0, 100) as f32 / 100.0);
    }
}
