//! Windows SMTC Backend
//!
//! [`SessionSource`] over the System Media Transport Controls session
//! manager. WinRT async property reads are bridged to sync with `.get()`;
//! notification handlers fire on WinRT callback threads, so everything handed
//! to them must be `Send + Sync` invocable. Native event registration tokens
//! are kept behind opaque [`SubscriptionToken`]s.

use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use windows::Foundation::{EventRegistrationToken, TimeSpan, TypedEventHandler};
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession, GlobalSystemMediaTransportControlsSessionManager,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus,
};
use windows::Media::MediaPlaybackType;
use windows::Storage::Streams::{Buffer, DataReader, InputStreamOptions};

use super::{
    ListChangedCallback, SessionChangedCallback, SessionHandle, SessionSource, SubscriptionToken,
};
use crate::error::{BridgeError, BridgeResult};
use crate::record::{
    MediaProperties, PlaybackInfo, TimelineProperties, CONTROL_NEXT, CONTROL_PAUSE, CONTROL_PLAY,
    CONTROL_PREVIOUS, CONTROL_STOP,
};

const THUMBNAIL_BUFFER_CAPACITY: u32 = 1024 * 1024;

// TimeSpan counts 100ns ticks
fn timespan_to_seconds(ts: TimeSpan) -> f64 {
    ts.Duration as f64 / 10_000_000.0
}

fn playback_status_code(status: GlobalSystemMediaTransportControlsSessionPlaybackStatus) -> i32 {
    match status {
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Closed => 0,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Opened => 1,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Changing => 2,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Stopped => 3,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Playing => 4,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Paused => 5,
        _ => 0,
    }
}

fn playback_type_code(playback_type: MediaPlaybackType) -> i32 {
    match playback_type {
        MediaPlaybackType::Unknown => 0,
        MediaPlaybackType::Music => 1,
        MediaPlaybackType::Video => 2,
        MediaPlaybackType::Image => 3,
        _ => -1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEventSlot {
    Playback,
    Timeline,
    Media,
}

/// One live SMTC session
pub struct SmtcSession {
    session: GlobalSystemMediaTransportControlsSession,
    tokens: DashMap<u64, (SessionEventSlot, EventRegistrationToken)>,
    next_token: Arc<AtomicU64>,
}

impl SmtcSession {
    fn new(
        session: GlobalSystemMediaTransportControlsSession,
        next_token: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session,
            tokens: DashMap::new(),
            next_token,
        }
    }

    fn read_thumbnail(
        props: &windows::Media::Control::GlobalSystemMediaTransportControlsSessionMediaProperties,
    ) -> Option<Vec<u8>> {
        let reference = props.Thumbnail().ok()?;
        let stream = reference.OpenReadAsync().ok()?.get().ok()?;
        let buffer = Buffer::Create(THUMBNAIL_BUFFER_CAPACITY).ok()?;
        let capacity = buffer.Capacity().ok()?;
        let read = stream
            .ReadAsync(&buffer, capacity, InputStreamOptions::None)
            .ok()?
            .get()
            .ok()?;
        let length = read.Length().ok()?;
        if length == 0 {
            return None;
        }
        let mut bytes = vec![0u8; length as usize];
        let reader = DataReader::FromBuffer(&read).ok()?;
        reader.ReadBytes(&mut bytes).ok()?;
        Some(bytes)
    }
}

impl SessionHandle for SmtcSession {
    fn identity(&self) -> String {
        self.session
            .SourceAppUserModelId()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    fn media_properties(&self) -> BridgeResult<MediaProperties> {
        let props = self
            .session
            .TryGetMediaPropertiesAsync()
            .and_then(|op| op.get())
            .map_err(|e| BridgeError::SessionRead(e.to_string()))?;

        let genre = props
            .Genres()
            .ok()
            .and_then(|genres| match genres.Size() {
                Ok(size) if size > 0 => genres.GetAt(0).ok().map(|g| g.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        let playback_type = props
            .PlaybackType()
            .ok()
            .and_then(|reference| reference.Value().ok())
            .map(playback_type_code)
            .unwrap_or(-1);

        Ok(MediaProperties {
            title: props.Title().map(|s| s.to_string()).unwrap_or_default(),
            artist: props.Artist().map(|s| s.to_string()).unwrap_or_default(),
            album_title: props.AlbumTitle().map(|s| s.to_string()).unwrap_or_default(),
            album_artist: props
                .AlbumArtist()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            track_number: props.TrackNumber().unwrap_or(0),
            album_track_count: props.AlbumTrackCount().unwrap_or(0),
            genre,
            playback_type,
            thumbnail: Self::read_thumbnail(&props),
        })
    }

    fn timeline_properties(&self) -> BridgeResult<TimelineProperties> {
        let props = self
            .session
            .GetTimelineProperties()
            .map_err(|e| BridgeError::SessionRead(e.to_string()))?;

        Ok(TimelineProperties {
            start_time: props.StartTime().map(timespan_to_seconds).unwrap_or(0.0),
            end_time: props.EndTime().map(timespan_to_seconds).unwrap_or(0.0),
            position: props.Position().map(timespan_to_seconds).unwrap_or(0.0),
            min_seek_time: props.MinSeekTime().map(timespan_to_seconds).unwrap_or(0.0),
            max_seek_time: props.MaxSeekTime().map(timespan_to_seconds).unwrap_or(0.0),
        })
    }

    fn playback_info(&self) -> BridgeResult<PlaybackInfo> {
        let info = self
            .session
            .GetPlaybackInfo()
            .map_err(|e| BridgeError::SessionRead(e.to_string()))?;

        let status = info
            .PlaybackStatus()
            .map(playback_status_code)
            .unwrap_or(0);
        let playback_type = info
            .PlaybackType()
            .ok()
            .and_then(|reference| reference.Value().ok())
            .map(playback_type_code)
            .unwrap_or(-1);
        let is_shuffle_active = info
            .IsShuffleActive()
            .ok()
            .and_then(|reference| reference.Value().ok())
            .unwrap_or(false);
        let auto_repeat_mode = info
            .AutoRepeatMode()
            .ok()
            .and_then(|reference| reference.Value().ok())
            .map(|mode| mode.0)
            .unwrap_or(-1);

        let mut controls = 0u32;
        if let Ok(available) = info.Controls() {
            if available.IsPlayEnabled().unwrap_or(false) {
                controls |= CONTROL_PLAY;
            }
            if available.IsPauseEnabled().unwrap_or(false) {
                controls |= CONTROL_PAUSE;
            }
            if available.IsStopEnabled().unwrap_or(false) {
                controls |= CONTROL_STOP;
            }
            if available.IsNextEnabled().unwrap_or(false) {
                controls |= CONTROL_NEXT;
            }
            if available.IsPreviousEnabled().unwrap_or(false) {
                controls |= CONTROL_PREVIOUS;
            }
        }

        Ok(PlaybackInfo {
            status,
            playback_type,
            is_shuffle_active,
            auto_repeat_mode,
            controls,
        })
    }

    fn on_playback_changed(
        &self,
        callback: SessionChangedCallback,
    ) -> BridgeResult<SubscriptionToken> {
        let native = self
            .session
            .PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
                callback();
                Ok(())
            }))
            .map_err(|e| BridgeError::Subscription(e.to_string()))?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.tokens.insert(token, (SessionEventSlot::Playback, native));
        Ok(SubscriptionToken(token))
    }

    fn on_timeline_changed(
        &self,
        callback: SessionChangedCallback,
    ) -> BridgeResult<SubscriptionToken> {
        let native = self
            .session
            .TimelinePropertiesChanged(&TypedEventHandler::new(move |_, _| {
                callback();
                Ok(())
            }))
            .map_err(|e| BridgeError::Subscription(e.to_string()))?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.tokens.insert(token, (SessionEventSlot::Timeline, native));
        Ok(SubscriptionToken(token))
    }

    fn on_media_changed(&self, callback: SessionChangedCallback) -> BridgeResult<SubscriptionToken> {
        let native = self
            .session
            .MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                callback();
                Ok(())
            }))
            .map_err(|e| BridgeError::Subscription(e.to_string()))?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.tokens.insert(token, (SessionEventSlot::Media, native));
        Ok(SubscriptionToken(token))
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BridgeResult<()> {
        let (_, (slot, native)) = self
            .tokens
            .remove(&token.0)
            .ok_or_else(|| BridgeError::Subscription("unknown subscription token".to_string()))?;
        let result = match slot {
            SessionEventSlot::Playback => self.session.RemovePlaybackInfoChanged(native),
            SessionEventSlot::Timeline => self.session.RemoveTimelinePropertiesChanged(native),
            SessionEventSlot::Media => self.session.RemoveMediaPropertiesChanged(native),
        };
        result.map_err(|e| BridgeError::Subscription(e.to_string()))
    }
}

/// Session source over the Windows SMTC session manager
pub struct SmtcSource {
    manager: GlobalSystemMediaTransportControlsSessionManager,
    list_tokens: DashMap<u64, EventRegistrationToken>,
    next_token: Arc<AtomicU64>,
}

impl SmtcSource {
    /// Request the system session manager.
    ///
    /// Fails with [`BridgeError::SourceUnavailable`] when the manager cannot
    /// be initialized.
    pub fn new() -> BridgeResult<Self> {
        let manager = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()
            .and_then(|op| op.get())
            .map_err(|e| BridgeError::SourceUnavailable(e.to_string()))?;
        debug!("SMTC session manager acquired");

        Ok(Self {
            manager,
            list_tokens: DashMap::new(),
            next_token: Arc::new(AtomicU64::new(1)),
        })
    }
}

impl SessionSource for SmtcSource {
    fn enumerate(&self) -> BridgeResult<Vec<Arc<dyn SessionHandle>>> {
        let sessions = self
            .manager
            .GetSessions()
            .map_err(|e| BridgeError::SourceUnavailable(e.to_string()))?;
        let size = sessions
            .Size()
            .map_err(|e| BridgeError::SourceUnavailable(e.to_string()))?;

        let mut handles: Vec<Arc<dyn SessionHandle>> = Vec::with_capacity(size as usize);
        for i in 0..size {
            if let Ok(session) = sessions.GetAt(i) {
                handles.push(Arc::new(SmtcSession::new(session, self.next_token.clone())));
            }
        }
        Ok(handles)
    }

    fn current_session(&self) -> BridgeResult<Option<Arc<dyn SessionHandle>>> {
        // The OS reports "no current session" as an error; map it to None
        Ok(self.manager.GetCurrentSession().ok().map(|session| {
            Arc::new(SmtcSession::new(session, self.next_token.clone())) as Arc<dyn SessionHandle>
        }))
    }

    fn on_list_changed(&self, callback: ListChangedCallback) -> BridgeResult<SubscriptionToken> {
        let handler = TypedEventHandler::new(move |_, _| {
            callback();
            Ok(())
        });
        let native = self
            .manager
            .SessionsChanged(&handler)
            .map_err(|e| BridgeError::Subscription(e.to_string()))?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.list_tokens.insert(token, native);
        Ok(SubscriptionToken(token))
    }

    fn remove_list_changed(&self, token: SubscriptionToken) -> BridgeResult<()> {
        let (_, native) = self
            .list_tokens
            .remove(&token.0)
            .ok_or_else(|| BridgeError::Subscription("unknown subscription token".to_string()))?;
        self.manager
            .RemoveSessionsChanged(native)
            .map_err(|e| BridgeError::Subscription(e.to_string()))
    }
}
