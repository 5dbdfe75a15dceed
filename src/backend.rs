//! The media backend contract the player daemon drives, and the loader
//! that picks an implementation by its configured name.

use crate::model::PlaylistItem;

pub mod dummy;
pub mod rodio;

/// Errors raised by a media backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown media backend `{0}`")]
    UnknownBackend(String),

    #[error("audio output unavailable: {0}")]
    Stream(#[from] ::rodio::StreamError),

    #[error("unable to read track file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to decode track: {0}")]
    Decode(#[from] ::rodio::decoder::DecoderError),

    #[error("track uri is not a local file: {0}")]
    Uri(String),
}

/// What the player needs from an audio backend.
pub trait MediaBackend {
    /// Starts playing a track, replacing whatever was queued.
    fn play(&mut self, item: &PlaylistItem) -> Result<(), Error>;

    /// Stops playback and drops the queued track.
    fn stop(&mut self);

    fn is_playing(&self) -> bool;

    /// Sets the output volume; values outside 0-100 are clamped.
    fn set_volume(&mut self, volume: i64);
}

/// Instantiates the backend a config names.
pub fn load(name: &str) -> Result<Box<dyn MediaBackend>, Error> {
    match name {
        "rodio" => Ok(Box::new(rodio::RodioBackend::new()?)),
        "dummy" => Ok(Box::new(dummy::DummyBackend::new())),
        other => Err(Error::UnknownBackend(other.to_owned())),
    }
}
