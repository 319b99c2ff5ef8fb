//! Session Event Bridge
//!
//! Orchestrates session discovery, snapshot diffing, subscription
//! registration, and cross-thread event delivery over one [`SessionSource`].
//!
//! Every OS notification, on whatever thread the OS raises it, is reduced to
//! a small message and pushed into one unbounded channel. A single dispatcher
//! task consumes the channel, which serializes reconcile passes and preserves
//! per-session delivery order without ever blocking an OS callback thread on
//! bridge work.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::diff::SessionSnapshot;
use super::events::{BridgeEvent, BridgeMessage, EventKind};
use super::registry::EventTokenRegistry;
use super::slots::CallbackSlotTable;
use crate::error::{BridgeError, BridgeResult};
use crate::record::SessionRecord;
use crate::source::{SessionHandle, SessionSource, SubscriptionToken};

/// The single manager-level list-changed registration, shared by the
/// `sessionadded` and `sessionremoved` kinds and reference-counted by how
/// many of them currently have a live callback.
#[derive(Default)]
struct ManagerSubscription {
    refs: u32,
    token: Option<SubscriptionToken>,
}

/// State shared between the public API and the dispatcher task
struct BridgeShared {
    source: Arc<dyn SessionSource>,
    slots: CallbackSlotTable,
    registry: EventTokenRegistry,
    /// Previous snapshot; its lock also serializes reconcile passes, so two
    /// nearly-simultaneous manager notifications can never both react to a
    /// stale snapshot
    snapshot: Mutex<SessionSnapshot>,
    torn_down: AtomicBool,
}

impl BridgeShared {
    fn live_property_kinds(&self) -> Vec<EventKind> {
        self.slots
            .live_kinds()
            .into_iter()
            .filter(|kind| kind.is_per_session())
            .collect()
    }

    /// Enumerate, register every session, and optionally store the result as
    /// the new previous snapshot. Runs under the snapshot lock so it cannot
    /// interleave with a reconcile pass.
    fn sync_sessions(
        &self,
        tx: &UnboundedSender<BridgeMessage>,
        store_snapshot: bool,
    ) -> BridgeResult<Vec<Arc<dyn SessionHandle>>> {
        let mut stored = self.snapshot.lock();
        let handles = self.source.enumerate()?;
        let live = self.live_property_kinds();
        for handle in &handles {
            self.registry.register_session(handle.clone(), &live, tx);
        }
        if store_snapshot {
            *stored = SessionSnapshot::from_identities(handles.iter().map(|h| h.identity()));
        }
        Ok(handles)
    }

    /// One serialized fetch-snapshot → diff → react → store-snapshot pass.
    ///
    /// Additions are registered before they are announced, so a subscriber
    /// reacting to `sessionadded` immediately receives later property events;
    /// removals are announced before their subscriptions are torn down, so a
    /// subscriber may query the session one last time. The new snapshot
    /// replaces the stored one regardless of what the reactions do, so a
    /// transition is never re-reported.
    fn reconcile(&self, tx: &UnboundedSender<BridgeMessage>) {
        let mut added_events: Vec<BridgeEvent> = Vec::new();
        let removed: Vec<String>;
        {
            let mut stored = self.snapshot.lock();
            let handles = match self.source.enumerate() {
                Ok(handles) => handles,
                Err(e) => {
                    warn!("session enumeration failed during reconcile: {}", e);
                    return;
                }
            };
            let current = SessionSnapshot::from_identities(handles.iter().map(|h| h.identity()));
            let diff = stored.diff(&current);
            if !diff.is_empty() {
                debug!(
                    "session list changed: {} added, {} removed",
                    diff.added.len(),
                    diff.removed.len()
                );
            }

            let live = self.live_property_kinds();
            for handle in &handles {
                let identity = handle.identity();
                if diff.added.contains(&identity) {
                    self.registry.register_session(handle.clone(), &live, tx);
                    if self.slots.is_live(EventKind::SessionAdded) {
                        // Capture while the handle is at hand; the handle
                        // itself never leaves this pass
                        added_events.push(BridgeEvent {
                            kind: EventKind::SessionAdded,
                            identity,
                            record: Some(SessionRecord::capture(handle.as_ref())),
                        });
                    }
                }
            }
            removed = diff.removed;
            *stored = current;
        }

        // Deliveries run outside the pass lock so a handler can call back
        // into the bridge without deadlocking
        for event in added_events {
            self.slots.invoke(EventKind::SessionAdded, event);
        }
        for identity in removed {
            if self.slots.is_live(EventKind::SessionRemoved) {
                self.slots.invoke(
                    EventKind::SessionRemoved,
                    BridgeEvent {
                        kind: EventKind::SessionRemoved,
                        identity: identity.clone(),
                        record: None,
                    },
                );
            }
            self.registry.unregister_session(&identity);
        }
    }

    /// Deliver one per-session property notification: re-resolve the session
    /// by identity, capture a fresh record, invoke the slot.
    fn deliver_property(&self, kind: EventKind, identity: String) {
        if !self.slots.is_live(kind) {
            return;
        }
        let record = match self.source.enumerate() {
            Ok(handles) => handles
                .iter()
                .find(|h| h.identity() == identity)
                .map(|h| SessionRecord::capture(h.as_ref())),
            Err(e) => {
                debug!("could not resolve session {} for {}: {}", identity, kind, e);
                None
            }
        };
        self.slots.invoke(
            kind,
            BridgeEvent {
                kind,
                identity,
                record,
            },
        );
    }
}

/// Bridge from a [`SessionSource`] to a single subscriber interface
///
/// Construction requires a running tokio runtime (the dispatcher task is
/// spawned onto it). The bridge is `Ready` from construction until
/// [`shutdown`](Self::shutdown); teardown is terminal and idempotent, and is
/// also performed on drop.
pub struct SessionEventBridge {
    shared: Arc<BridgeShared>,
    tx: UnboundedSender<BridgeMessage>,
    manager_sub: Mutex<ManagerSubscription>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEventBridge {
    /// Create a bridge over `source` and start its dispatcher task
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        let shared = Arc::new(BridgeShared {
            source,
            slots: CallbackSlotTable::new(),
            registry: EventTokenRegistry::new(),
            snapshot: Mutex::new(SessionSnapshot::empty()),
            torn_down: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self::spawn_dispatcher(shared.clone(), tx.clone(), rx);

        Self {
            shared,
            tx,
            manager_sub: Mutex::new(ManagerSubscription::default()),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    fn spawn_dispatcher(
        shared: Arc<BridgeShared>,
        tx: UnboundedSender<BridgeMessage>,
        mut rx: UnboundedReceiver<BridgeMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if shared.torn_down.load(Ordering::SeqCst) {
                    break;
                }
                match message {
                    BridgeMessage::ListChanged => shared.reconcile(&tx),
                    BridgeMessage::Property { kind, identity } => {
                        shared.deliver_property(kind, identity)
                    }
                }
            }
            debug!("event dispatcher stopped");
        })
    }

    fn ensure_ready(&self) -> BridgeResult<()> {
        if self.shared.torn_down.load(Ordering::SeqCst) {
            Err(BridgeError::TornDown)
        } else {
            Ok(())
        }
    }

    /// Install `callback` for `kind`, superseding any previous callback for
    /// the same kind, and bring the prerequisite OS subscriptions up:
    /// manager-level kinds take a reference on the shared list-changed
    /// registration and adopt the current session set as the baseline
    /// snapshot; per-session kinds are wired onto every currently enumerated
    /// session. Subscription failures are logged, never propagated.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> BridgeResult<()>
    where
        F: Fn(BridgeEvent) + Send + Sync + 'static,
    {
        self.ensure_ready()?;
        let fresh = !self.shared.slots.install(kind, Box::new(callback));
        debug!("installed {} callback", kind);

        if kind.is_manager_level() && fresh {
            self.acquire_manager_subscription();
        }
        // Late subscribers still observe sessions that existed before they
        // subscribed: register everything currently live
        if let Err(e) = self.shared.sync_sessions(&self.tx, false) {
            warn!("session registration pass failed after {}: {}", kind, e);
        }
        Ok(())
    }

    /// Remove the callback for `kind`. After this returns, no further
    /// invocation of the removed callback occurs; a delivery already running
    /// may complete with it. Existing per-session OS subscriptions stay in
    /// place and no-op against the dead slot.
    pub fn off(&self, kind: EventKind) -> BridgeResult<()> {
        self.ensure_ready()?;
        let removed = self.shared.slots.remove(kind);
        if removed {
            debug!("removed {} callback", kind);
            if kind.is_manager_level() {
                self.release_manager_subscription();
            }
        }
        Ok(())
    }

    /// Records for every currently active session.
    ///
    /// The enumeration also keeps subscriptions current: sessions first seen
    /// here are registered for every kind that already has a live callback.
    pub fn list_sessions(&self) -> BridgeResult<Vec<SessionRecord>> {
        self.ensure_ready()?;
        let handles = self.shared.sync_sessions(&self.tx, false)?;
        Ok(handles
            .iter()
            .map(|handle| SessionRecord::capture(handle.as_ref()))
            .collect())
    }

    /// Record for the session the OS considers current, if any
    pub fn current_session(&self) -> BridgeResult<Option<SessionRecord>> {
        self.ensure_ready()?;
        let handle = match self.shared.source.current_session()? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let live = self.shared.live_property_kinds();
        self.shared
            .registry
            .register_session(handle.clone(), &live, &self.tx);
        Ok(Some(SessionRecord::capture(handle.as_ref())))
    }

    /// Record for the session with the given identity, if it is live
    pub fn session_by_id(&self, identity: &str) -> BridgeResult<Option<SessionRecord>> {
        self.ensure_ready()?;
        let handles = self.shared.sync_sessions(&self.tx, false)?;
        Ok(handles
            .iter()
            .find(|handle| handle.identity() == identity)
            .map(|handle| SessionRecord::capture(handle.as_ref())))
    }

    /// Tear the bridge down: unregister every session subscription, release
    /// the manager-level registration, release every callback slot, and stop
    /// the dispatcher. Idempotent; OS failures are swallowed so teardown
    /// always completes. The source handle itself is released when the bridge
    /// is dropped.
    pub fn shutdown(&self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            debug!("bridge already torn down");
            return;
        }
        info!("shutting down session event bridge");

        self.shared.registry.unregister_all();
        {
            let mut sub = self.manager_sub.lock();
            sub.refs = 0;
            if let Some(token) = sub.token.take() {
                if let Err(e) = self.shared.source.remove_list_changed(token) {
                    debug!("manager-level unsubscribe failed during teardown: {}", e);
                }
            }
        }
        self.shared.slots.clear();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    fn acquire_manager_subscription(&self) {
        let mut sub = self.manager_sub.lock();
        if sub.refs == 0 {
            // Adopt the current session set as the baseline before the
            // watcher exists: pre-existing sessions are never announced as
            // additions, and the first reconcile pass reports only
            // transitions from this point on
            if let Err(e) = self.shared.sync_sessions(&self.tx, true) {
                warn!("baseline session pass failed: {}", e);
            }
            let tx = self.tx.clone();
            match self
                .shared
                .source
                .on_list_changed(Box::new(move || {
                    let _ = tx.send(BridgeMessage::ListChanged);
                }))
            {
                Ok(token) => sub.token = Some(token),
                Err(e) => warn!("manager-level subscription failed: {}", e),
            }
        }
        sub.refs += 1;
    }

    fn release_manager_subscription(&self) {
        let mut sub = self.manager_sub.lock();
        if sub.refs == 0 {
            return;
        }
        sub.refs -= 1;
        if sub.refs == 0 {
            if let Some(token) = sub.token.take() {
                if let Err(e) = self.shared.source.remove_list_changed(token) {
                    debug!("manager-level unsubscribe failed: {}", e);
                }
            }
        }
    }
}

impl Drop for SessionEventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MediaProperties;
    use crate::source::mock::MockSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn bridge_over(source: &MockSource) -> SessionEventBridge {
        SessionEventBridge::new(Arc::new(source.clone()))
    }

    /// Poll `condition` until it holds or the bound elapses
    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    fn collector() -> (
        Arc<Mutex<Vec<BridgeEvent>>>,
        impl Fn(BridgeEvent) + Send + Sync + 'static,
    ) {
        let events: Arc<Mutex<Vec<BridgeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event| sink.lock().push(event))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_added_is_announced_once() {
        let source = MockSource::new();
        source.add_session("AppA");
        let bridge = bridge_over(&source);

        let (events, sink) = collector();
        bridge.on(EventKind::SessionAdded, sink).unwrap();

        source.add_session("AppB");
        assert!(wait_for(|| !events.lock().is_empty()).await);

        let seen = events.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::SessionAdded);
        assert_eq!(seen[0].identity, "AppB");
        assert_eq!(seen[0].record.as_ref().unwrap().identity, "AppB");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preexisting_sessions_are_not_announced() {
        let source = MockSource::new();
        source.add_session("AppA");
        let bridge = bridge_over(&source);

        let (events, sink) = collector();
        bridge.on(EventKind::SessionAdded, sink).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.lock().is_empty());
        drop(bridge);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_removed_then_absent_from_listing() {
        let source = MockSource::new();
        source.add_session("AppA");
        source.add_session("AppB");
        let bridge = bridge_over(&source);

        let (events, sink) = collector();
        bridge.on(EventKind::SessionRemoved, sink).unwrap();

        source.remove_session("AppA");
        assert!(wait_for(|| !events.lock().is_empty()).await);
        {
            let seen = events.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].identity, "AppA");
            assert!(seen[0].record.is_none());
        }

        let listed: Vec<String> = bridge
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|r| r.identity)
            .collect();
        assert_eq!(listed, vec!["AppB"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_callback_supersedes_older() {
        let source = MockSource::new();
        let session = source.add_session("AppA");
        let bridge = bridge_over(&source);

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        bridge
            .on(EventKind::PlaybackStateChanged, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let s = second.clone();
        bridge
            .on(EventKind::PlaybackStateChanged, move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        session.fire_playback_changed();
        assert!(wait_for(|| second.load(Ordering::SeqCst) == 1).await);
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_delivery_after_off() {
        let source = MockSource::new();
        let session = source.add_session("AppA");
        let bridge = bridge_over(&source);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bridge
            .on(EventKind::PlaybackStateChanged, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Storm the bridge from a foreign thread while off() races in
        let firing = {
            let session = session.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    session.fire_playback_changed();
                    std::thread::sleep(Duration::from_micros(200));
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge.off(EventKind::PlaybackStateChanged).unwrap();

        firing.join().unwrap();
        // Allow any delivery that was already executing to finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_is_idempotent_and_releases_everything() {
        let source = MockSource::new();
        let session = source.add_session("AppA");
        let bridge = bridge_over(&source);

        bridge.on(EventKind::SessionAdded, |_| {}).unwrap();
        bridge.on(EventKind::PlaybackStateChanged, |_| {}).unwrap();
        assert_eq!(source.list_watcher_count(), 1);
        assert!(wait_for(|| session.subscription_count() == 1).await);

        bridge.shutdown();
        assert_eq!(source.list_watcher_count(), 0);
        assert_eq!(session.subscription_count(), 0);
        assert!(matches!(
            bridge.on(EventKind::SessionAdded, |_| {}),
            Err(BridgeError::TornDown)
        ));
        assert!(matches!(bridge.list_sessions(), Err(BridgeError::TornDown)));

        // Second call: no error, nothing left to do
        bridge.shutdown();
        assert_eq!(source.list_watcher_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_tears_down() {
        let source = MockSource::new();
        source.add_session("AppA");
        let bridge = bridge_over(&source);
        bridge.on(EventKind::SessionRemoved, |_| {}).unwrap();
        assert_eq!(source.list_watcher_count(), 1);

        drop(bridge);
        assert_eq!(source.list_watcher_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manager_subscription_is_refcounted() {
        let source = MockSource::new();
        let bridge = bridge_over(&source);

        bridge.on(EventKind::SessionAdded, |_| {}).unwrap();
        bridge.on(EventKind::SessionRemoved, |_| {}).unwrap();
        assert_eq!(source.list_watcher_count(), 1);

        // Reinstalling an existing kind must not take a second reference
        bridge.on(EventKind::SessionAdded, |_| {}).unwrap();
        assert_eq!(source.list_watcher_count(), 1);

        bridge.off(EventKind::SessionAdded).unwrap();
        assert_eq!(source.list_watcher_count(), 1);
        bridge.off(EventKind::SessionRemoved).unwrap();
        assert_eq!(source.list_watcher_count(), 0);

        // Double-off must not underflow into a teardown of nothing
        bridge.off(EventKind::SessionRemoved).unwrap();
        assert_eq!(source.list_watcher_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_property_event_carries_fresh_record() {
        let source = MockSource::new();
        let session = source.add_session("AppA");
        let bridge = bridge_over(&source);

        let (events, sink) = collector();
        bridge.on(EventKind::MediaPropertiesChanged, sink).unwrap();

        session.set_media(MediaProperties {
            title: "New Track".into(),
            artist: "Someone".into(),
            ..Default::default()
        });

        assert!(wait_for(|| !events.lock().is_empty()).await);
        let seen = events.lock();
        assert_eq!(seen[0].kind, EventKind::MediaPropertiesChanged);
        assert_eq!(seen[0].identity, "AppA");
        let media = seen[0].record.as_ref().unwrap().media.as_ref().unwrap();
        assert_eq!(media.title, "New Track");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_plain_reads_catch_up_subscriptions() {
        let source = MockSource::new();
        let bridge = bridge_over(&source);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bridge
            .on(EventKind::PlaybackStateChanged, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Appears after the subscribe pass; no manager-level kind is live,
        // so only a read can pick it up
        let session = source.add_session("Late.App");
        session.fire_playback_changed();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bridge.list_sessions().unwrap();
        session.fire_playback_changed();
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_media_read_still_yields_record() {
        let source = MockSource::new();
        let session = source.add_session("Flaky.App");
        session.fail_media_reads(true);
        let bridge = bridge_over(&source);

        let record = bridge.session_by_id("Flaky.App").unwrap().unwrap();
        assert!(record.media.is_none());
        assert!(record.timeline.is_some());
        assert!(record.playback.is_some());
        assert!(record.error.unwrap().contains("media"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_by_unknown_id_is_none() {
        let source = MockSource::new();
        source.add_session("AppA");
        let bridge = bridge_over(&source);
        assert!(bridge.session_by_id("nope").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_current_session_projection() {
        let source = MockSource::new();
        source.add_session("AppA");
        let bridge = bridge_over(&source);

        assert!(bridge.current_session().unwrap().is_none());
        source.set_current(Some("AppA"));
        assert_eq!(
            bridge.current_session().unwrap().unwrap().identity,
            "AppA"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_vanish_and_return_fires_both_transitions() {
        let source = MockSource::new();
        source.add_session("AppA");
        source.add_session("Blinker");
        let bridge = bridge_over(&source);

        let (events, sink) = collector();
        bridge.on(EventKind::SessionRemoved, sink).unwrap();
        let (added, added_sink) = collector();
        bridge.on(EventKind::SessionAdded, added_sink).unwrap();

        source.remove_session("Blinker");
        assert!(wait_for(|| !events.lock().is_empty()).await);
        source.add_session("Blinker");
        assert!(wait_for(|| !added.lock().is_empty()).await);

        assert_eq!(events.lock()[0].identity, "Blinker");
        assert_eq!(added.lock()[0].identity, "Blinker");
    }
}
