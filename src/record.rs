//! Session Records
//!
//! Flat, copy-by-value projections of a live session's property objects,
//! safe to move across threads. Capturing never fails as a whole: a section
//! whose read fails is left empty and the record carries an error marker, so
//! a session with partially-available properties still surfaces what it can.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::source::SessionHandle;

/// Transport-control availability bits in [`PlaybackInfo::controls`]
pub const CONTROL_PLAY: u32 = 1 << 0;
pub const CONTROL_PAUSE: u32 = 1 << 1;
pub const CONTROL_STOP: u32 = 1 << 2;
pub const CONTROL_NEXT: u32 = 1 << 3;
pub const CONTROL_PREVIOUS: u32 = 1 << 4;

/// Media metadata for one session
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProperties {
    pub title: String,
    pub artist: String,
    pub album_title: String,
    pub album_artist: String,
    pub track_number: i32,
    pub album_track_count: i32,
    /// First genre reported by the source, empty when none
    pub genre: String,
    /// Playback-type code, -1 when the source does not report one
    pub playback_type: i32,
    /// Raw thumbnail bytes, when the source exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

// Thumbnail bytes are noise in logs; show a placeholder instead
impl fmt::Debug for MediaProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaProperties")
            .field("title", &self.title)
            .field("artist", &self.artist)
            .field("album_title", &self.album_title)
            .field("album_artist", &self.album_artist)
            .field("track_number", &self.track_number)
            .field("album_track_count", &self.album_track_count)
            .field("genre", &self.genre)
            .field("playback_type", &self.playback_type)
            .field(
                "thumbnail",
                &self.thumbnail.as_ref().map(|t| format!("[{} bytes]", t.len())),
            )
            .finish()
    }
}

/// Timeline properties for one session, all values in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineProperties {
    pub start_time: f64,
    pub end_time: f64,
    pub position: f64,
    pub min_seek_time: f64,
    pub max_seek_time: f64,
}

/// Playback state for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    /// Source-defined playback status code
    pub status: i32,
    /// Playback-type code, -1 when unknown
    pub playback_type: i32,
    /// Shuffle state, false when the source does not report one
    pub is_shuffle_active: bool,
    /// Repeat-mode code, -1 when unknown
    pub auto_repeat_mode: i32,
    /// Bitmask of available transport controls (see `CONTROL_*`)
    pub controls: u32,
}

impl Default for PlaybackInfo {
    fn default() -> Self {
        Self {
            status: 0,
            playback_type: -1,
            is_shuffle_active: false,
            auto_repeat_mode: -1,
            controls: 0,
        }
    }
}

impl PlaybackInfo {
    pub fn can_play(&self) -> bool {
        self.controls & CONTROL_PLAY != 0
    }

    pub fn can_pause(&self) -> bool {
        self.controls & CONTROL_PAUSE != 0
    }
}

/// Point-in-time projection of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable identity of the producing application
    pub identity: String,
    /// Media metadata, `None` when the read failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaProperties>,
    /// Timeline properties, `None` when the read failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineProperties>,
    /// Playback info, `None` when the read failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback: Option<PlaybackInfo>,
    /// When this record was captured
    pub captured_at: DateTime<Utc>,
    /// Error marker naming the section(s) that could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecord {
    /// Capture a record from a live session handle.
    ///
    /// Each section is read independently; a failing read empties that
    /// section and appends to the error marker instead of aborting the
    /// whole capture.
    pub fn capture(handle: &dyn SessionHandle) -> Self {
        let identity = handle.identity();
        let mut errors: Vec<String> = Vec::new();

        let media = match handle.media_properties() {
            Ok(props) => Some(props),
            Err(e) => {
                warn!("media properties read failed for {}: {}", identity, e);
                errors.push(format!("media: {}", e));
                None
            }
        };

        let timeline = match handle.timeline_properties() {
            Ok(props) => Some(props),
            Err(e) => {
                warn!("timeline properties read failed for {}: {}", identity, e);
                errors.push(format!("timeline: {}", e));
                None
            }
        };

        let playback = match handle.playback_info() {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("playback info read failed for {}: {}", identity, e);
                errors.push(format!("playback: {}", e));
                None
            }
        };

        Self {
            identity,
            media,
            timeline,
            playback,
            captured_at: Utc::now(),
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }
}
