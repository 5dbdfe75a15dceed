//! The signal vocabulary the two daemons exchange over the bus.
//!
//! Wire format is a JSON array `[name, args]` where `args` is a positional
//! list. Decoding an unknown name yields [`Signal::Ignored`] so that a newer
//! peer cannot wedge an older one.

use serde_json::{json, Value};

use crate::model::PlaylistItem;

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Player channel: start playing a track.
    Play(PlaylistItem),

    /// Player channel: stop the current track and report it finished.
    Skip,

    /// Player channel: set the backend volume (0-100).
    SetVolume(i64),

    /// The player came up and subscribed to its channel.
    PlayerReady,

    /// Periodic heartbeat sent while the player has nothing to play.
    PlayerIdle,

    /// The backend accepted a track and playback started.
    TrackPlay(PlaylistItem),

    /// The current track ran out (or was skipped).
    TrackFinished(PlaylistItem),

    /// A device sync finished, successfully or not.
    DeviceSync,

    /// An ad generator draw produced a downloaded track.
    AdTrackDownloaded(PlaylistItem),

    /// A music generator draw produced a downloaded track.
    MusicTrackDownloaded(PlaylistItem),

    /// A music draw failed to download its track.
    MusicTrackDownloadFailed(PlaylistItem),

    /// The ad generator finished one draw-and-download pass.
    AdsGeneratorFinished,

    /// The music generator finished one draw-and-download pass.
    MusicGeneratorFinished,

    /// A well-formed message with a name this build does not know.
    Ignored(String),
}

/// Errors which occur when decoding a bus payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid signal payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signal `{0}` is missing its argument")]
    MissingArg(String),
}

impl Signal {
    /// The wire name of this signal.
    pub fn name(&self) -> &str {
        match self {
            Self::Play(_) => "PLAY",
            Self::Skip => "SKIP",
            Self::SetVolume(_) => "SET_VOLUME",
            Self::PlayerReady => "PLAYER_READY",
            Self::PlayerIdle => "PLAYER_IDLE",
            Self::TrackPlay(_) => "TRACK_PLAY",
            Self::TrackFinished(_) => "TRACK_FINISHED",
            Self::DeviceSync => "DEVICE_SYNC",
            Self::AdTrackDownloaded(_) => "AD_TRACK_DOWNLOADED",
            Self::MusicTrackDownloaded(_) => "MUSIC_TRACK_DOWNLOADED",
            Self::MusicTrackDownloadFailed(_) => "MUSIC_TRACK_DOWNLOAD_FAILED",
            Self::AdsGeneratorFinished => "ADS_GENERATOR_FINISHED",
            Self::MusicGeneratorFinished => "MUSIC_GENERATOR_FINISHED",
            Self::Ignored(name) => name,
        }
    }

    /// Serializes the signal to its wire form.
    pub fn encode(&self) -> String {
        let args = match self {
            Self::Play(item)
            | Self::TrackPlay(item)
            | Self::TrackFinished(item)
            | Self::AdTrackDownloaded(item)
            | Self::MusicTrackDownloaded(item)
            | Self::MusicTrackDownloadFailed(item) => json!([item]),
            Self::SetVolume(volume) => json!([volume]),
            _ => json!([]),
        };

        json!([self.name(), args]).to_string()
    }

    /// Parses a wire payload into a signal.
    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        let (name, args): (String, Vec<Value>) = serde_json::from_str(payload)?;

        let signal = match name.as_str() {
            "PLAY" => Self::Play(item_arg(args, &name)?),
            "SKIP" => Self::Skip,
            "SET_VOLUME" => {
                let value = first_arg(args, &name)?;
                Self::SetVolume(serde_json::from_value(value)?)
            }
            "PLAYER_READY" => Self::PlayerReady,
            "PLAYER_IDLE" => Self::PlayerIdle,
            "TRACK_PLAY" => Self::TrackPlay(item_arg(args, &name)?),
            "TRACK_FINISHED" => Self::TrackFinished(item_arg(args, &name)?),
            "DEVICE_SYNC" => Self::DeviceSync,
            "AD_TRACK_DOWNLOADED" => Self::AdTrackDownloaded(item_arg(args, &name)?),
            "MUSIC_TRACK_DOWNLOADED" => Self::MusicTrackDownloaded(item_arg(args, &name)?),
            "MUSIC_TRACK_DOWNLOAD_FAILED" => Self::MusicTrackDownloadFailed(item_arg(args, &name)?),
            "ADS_GENERATOR_FINISHED" => Self::AdsGeneratorFinished,
            "MUSIC_GENERATOR_FINISHED" => Self::MusicGeneratorFinished,
            _ => Self::Ignored(name),
        };

        Ok(signal)
    }
}

/// Pops the first positional argument of a signal.
fn first_arg(args: Vec<Value>, name: &str) -> Result<Value, DecodeError> {
    args.into_iter()
        .next()
        .ok_or_else(|| DecodeError::MissingArg(name.to_owned()))
}

/// Pops and parses a [`PlaylistItem`] argument.
fn item_arg(args: Vec<Value>, name: &str) -> Result<PlaylistItem, DecodeError> {
    Ok(serde_json::from_value(first_arg(args, name)?)?)
}
