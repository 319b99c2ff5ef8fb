//! In-Memory Session Source
//!
//! A scriptable [`SessionSource`] for tests and demos. Sessions are added and
//! removed programmatically; property mutations fire the same notifications a
//! real OS backend would, on the calling thread. Test hooks cover the failure
//! paths a live source exhibits: property reads that fail mid-session and
//! unsubscribes against sessions the OS already tore down.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{
    ListChangedCallback, SessionChangedCallback, SessionHandle, SessionSource, SubscriptionToken,
};
use crate::error::{BridgeError, BridgeResult};
use crate::record::{MediaProperties, PlaybackInfo, TimelineProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Playback,
    Timeline,
    Media,
}

/// One scripted session
pub struct MockSession {
    identity: String,
    media: Mutex<MediaProperties>,
    timeline: Mutex<TimelineProperties>,
    playback: Mutex<PlaybackInfo>,
    fail_media: AtomicBool,
    fail_timeline: AtomicBool,
    fail_playback: AtomicBool,
    refuse_playback_watch: AtomicBool,
    /// Set when the source has torn the session down; reads and
    /// (un)subscribes fail from then on
    vanished: AtomicBool,
    watchers: DashMap<u64, (WatchKind, SessionChangedCallback)>,
    next_token: AtomicU64,
}

impl MockSession {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            media: Mutex::new(MediaProperties::default()),
            timeline: Mutex::new(TimelineProperties::default()),
            playback: Mutex::new(PlaybackInfo::default()),
            fail_media: AtomicBool::new(false),
            fail_timeline: AtomicBool::new(false),
            fail_playback: AtomicBool::new(false),
            refuse_playback_watch: AtomicBool::new(false),
            vanished: AtomicBool::new(false),
            watchers: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Replace the media properties and notify media watchers
    pub fn set_media(&self, props: MediaProperties) {
        *self.media.lock() = props;
        self.fire(WatchKind::Media);
    }

    /// Replace the timeline properties and notify timeline watchers
    pub fn set_timeline(&self, props: TimelineProperties) {
        *self.timeline.lock() = props;
        self.fire(WatchKind::Timeline);
    }

    /// Replace the playback info and notify playback watchers
    pub fn set_playback(&self, info: PlaybackInfo) {
        *self.playback.lock() = info;
        self.fire(WatchKind::Playback);
    }

    /// Fire a playback notification without changing state
    pub fn fire_playback_changed(&self) {
        self.fire(WatchKind::Playback);
    }

    /// Fire a timeline notification without changing state
    pub fn fire_timeline_changed(&self) {
        self.fire(WatchKind::Timeline);
    }

    /// Fire a media notification without changing state
    pub fn fire_media_changed(&self) {
        self.fire(WatchKind::Media);
    }

    /// Make subsequent media-property reads fail
    pub fn fail_media_reads(&self, fail: bool) {
        self.fail_media.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent timeline-property reads fail
    pub fn fail_timeline_reads(&self, fail: bool) {
        self.fail_timeline.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent playback-info reads fail
    pub fn fail_playback_reads(&self, fail: bool) {
        self.fail_playback.store(fail, Ordering::SeqCst);
    }

    /// Reject subsequent playback-change subscriptions
    pub fn refuse_playback_watch(&self, refuse: bool) {
        self.refuse_playback_watch.store(refuse, Ordering::SeqCst);
    }

    /// Number of live notification registrations on this session
    pub fn subscription_count(&self) -> usize {
        self.watchers.len()
    }

    fn fire(&self, kind: WatchKind) {
        if self.vanished.load(Ordering::SeqCst) {
            return;
        }
        for entry in self.watchers.iter() {
            if entry.value().0 == kind {
                (entry.value().1)();
            }
        }
    }

    fn check_live(&self) -> BridgeResult<()> {
        if self.vanished.load(Ordering::SeqCst) {
            Err(BridgeError::SessionRead(format!(
                "session {} is gone",
                self.identity
            )))
        } else {
            Ok(())
        }
    }

    fn watch(
        &self,
        kind: WatchKind,
        callback: SessionChangedCallback,
    ) -> BridgeResult<SubscriptionToken> {
        if self.vanished.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscription(format!(
                "session {} is gone",
                self.identity
            )));
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(token, (kind, callback));
        Ok(SubscriptionToken(token))
    }
}

impl SessionHandle for MockSession {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn media_properties(&self) -> BridgeResult<MediaProperties> {
        self.check_live()?;
        if self.fail_media.load(Ordering::SeqCst) {
            return Err(BridgeError::SessionRead("media read refused".to_string()));
        }
        Ok(self.media.lock().clone())
    }

    fn timeline_properties(&self) -> BridgeResult<TimelineProperties> {
        self.check_live()?;
        if self.fail_timeline.load(Ordering::SeqCst) {
            return Err(BridgeError::SessionRead("timeline read refused".to_string()));
        }
        Ok(self.timeline.lock().clone())
    }

    fn playback_info(&self) -> BridgeResult<PlaybackInfo> {
        self.check_live()?;
        if self.fail_playback.load(Ordering::SeqCst) {
            return Err(BridgeError::SessionRead("playback read refused".to_string()));
        }
        Ok(self.playback.lock().clone())
    }

    fn on_playback_changed(
        &self,
        callback: SessionChangedCallback,
    ) -> BridgeResult<SubscriptionToken> {
        if self.refuse_playback_watch.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscription(
                "playback watch refused".to_string(),
            ));
        }
        self.watch(WatchKind::Playback, callback)
    }

    fn on_timeline_changed(
        &self,
        callback: SessionChangedCallback,
    ) -> BridgeResult<SubscriptionToken> {
        self.watch(WatchKind::Timeline, callback)
    }

    fn on_media_changed(&self, callback: SessionChangedCallback) -> BridgeResult<SubscriptionToken> {
        self.watch(WatchKind::Media, callback)
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BridgeResult<()> {
        if self.vanished.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscription(format!(
                "session {} is gone",
                self.identity
            )));
        }
        self.watchers.remove(&token.0);
        Ok(())
    }
}

#[derive(Default)]
struct MockSourceInner {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    current: Mutex<Option<String>>,
    list_watchers: DashMap<u64, ListChangedCallback>,
    next_token: AtomicU64,
}

/// Scriptable in-memory session source
#[derive(Clone, Default)]
pub struct MockSource {
    inner: Arc<MockSourceInner>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session and fire the list-changed notification
    pub fn add_session(&self, identity: &str) -> Arc<MockSession> {
        let session = Arc::new(MockSession::new(identity));
        self.inner.sessions.lock().push(session.clone());
        self.notify_list_changed();
        session
    }

    /// Tear a session down (reads and unsubscribes against retained handles
    /// fail from here on) and fire the list-changed notification
    pub fn remove_session(&self, identity: &str) {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            let before = sessions.len();
            sessions.retain(|s| {
                if s.identity == identity {
                    s.vanished.store(true, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            });
            sessions.len() != before
        };
        if removed {
            self.notify_list_changed();
        }
    }

    /// Look up a still-live session by identity
    pub fn session(&self, identity: &str) -> Option<Arc<MockSession>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .find(|s| s.identity == identity)
            .cloned()
    }

    /// Set which session `current_session` reports
    pub fn set_current(&self, identity: Option<&str>) {
        *self.inner.current.lock() = identity.map(str::to_string);
    }

    /// Fire the list-changed notification without mutating the list
    pub fn notify_list_changed(&self) {
        for entry in self.inner.list_watchers.iter() {
            (entry.value())();
        }
    }

    /// Number of live manager-level registrations
    pub fn list_watcher_count(&self) -> usize {
        self.inner.list_watchers.len()
    }
}

impl SessionSource for MockSource {
    fn enumerate(&self) -> BridgeResult<Vec<Arc<dyn SessionHandle>>> {
        Ok(self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn SessionHandle>)
            .collect())
    }

    fn current_session(&self) -> BridgeResult<Option<Arc<dyn SessionHandle>>> {
        let current = self.inner.current.lock().clone();
        Ok(match current {
            Some(id) => self.session(&id).map(|s| s as Arc<dyn SessionHandle>),
            None => None,
        })
    }

    fn on_list_changed(&self, callback: ListChangedCallback) -> BridgeResult<SubscriptionToken> {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        self.inner.list_watchers.insert(token, callback);
        Ok(SubscriptionToken(token))
    }

    fn remove_list_changed(&self, token: SubscriptionToken) -> BridgeResult<()> {
        self.inner.list_watchers.remove(&token.0);
        Ok(())
    }
}
