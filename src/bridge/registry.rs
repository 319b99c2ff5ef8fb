//! Event Token Registry
//!
//! Per-session bookkeeping of live OS notification registrations, keyed by
//! session identity. Registration is deduplicating: an identity is reserved
//! in the map before any OS subscribe call is made, so two concurrent
//! registration passes can never double-wire a kind, and no OS call ever runs
//! while a map shard lock is held. Unregistration swallows failures from
//! sessions the OS already tore down and never raises to the caller.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::events::{BridgeMessage, EventKind};
use crate::source::{SessionHandle, SubscriptionToken};

struct TrackedSession {
    handle: Arc<dyn SessionHandle>,
    tokens: Vec<(EventKind, SubscriptionToken)>,
}

/// Registry of per-session notification subscriptions
pub struct EventTokenRegistry {
    sessions: DashMap<String, TrackedSession>,
}

impl EventTokenRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Wire per-session subscriptions for `handle`, covering exactly the
    /// per-session kinds in `live_kinds` that are not already wired for this
    /// identity. Kinds wired earlier are left untouched; re-registration never
    /// duplicates a subscription. Each wired OS callback copies only identity
    /// and kind into the delivery channel.
    ///
    /// Per-kind subscription failures are swallowed and logged: a session with
    /// partially-available properties still surfaces the events it can.
    pub fn register_session(
        &self,
        handle: Arc<dyn SessionHandle>,
        live_kinds: &[EventKind],
        tx: &UnboundedSender<BridgeMessage>,
    ) {
        let identity = handle.identity();

        // Reserve the identity and decide what is missing while holding the
        // map entry, without making any OS call under it.
        let (subscribe_handle, missing) = match self.sessions.entry(identity.clone()) {
            Entry::Occupied(entry) => {
                let tracked = entry.get();
                let missing: Vec<EventKind> = live_kinds
                    .iter()
                    .copied()
                    .filter(|kind| {
                        kind.is_per_session()
                            && !tracked.tokens.iter().any(|(wired, _)| wired == kind)
                    })
                    .collect();
                (tracked.handle.clone(), missing)
            }
            Entry::Vacant(entry) => {
                let missing: Vec<EventKind> = live_kinds
                    .iter()
                    .copied()
                    .filter(|kind| kind.is_per_session())
                    .collect();
                entry.insert(TrackedSession {
                    handle: handle.clone(),
                    tokens: Vec::new(),
                });
                (handle, missing)
            }
        };

        if missing.is_empty() {
            return;
        }

        let mut wired: Vec<(EventKind, SubscriptionToken)> = Vec::with_capacity(missing.len());
        for kind in missing {
            let sender = tx.clone();
            let id = identity.clone();
            let callback: Box<dyn Fn() + Send + Sync> = Box::new(move || {
                let _ = sender.send(BridgeMessage::Property {
                    kind,
                    identity: id.clone(),
                });
            });
            let result = match kind {
                EventKind::PlaybackStateChanged => subscribe_handle.on_playback_changed(callback),
                EventKind::TimelinePropertiesChanged => {
                    subscribe_handle.on_timeline_changed(callback)
                }
                EventKind::MediaPropertiesChanged => subscribe_handle.on_media_changed(callback),
                _ => unreachable!("manager-level kinds are not wired per session"),
            };
            match result {
                Ok(token) => wired.push((kind, token)),
                Err(e) => warn!("could not wire {} for {}: {}", kind, identity, e),
            }
        }

        // Store the fresh tokens. If the session was unregistered while we
        // were subscribing, or a concurrent pass won the race for a kind,
        // undo the now-orphaned subscriptions once the map lock is gone.
        let mut orphaned: Vec<SubscriptionToken> = Vec::new();
        match self.sessions.get_mut(&identity) {
            Some(mut tracked) => {
                for (kind, token) in wired {
                    if tracked.tokens.iter().any(|(existing, _)| *existing == kind) {
                        orphaned.push(token);
                    } else {
                        tracked.tokens.push((kind, token));
                    }
                }
            }
            None => orphaned.extend(wired.into_iter().map(|(_, token)| token)),
        }
        for token in orphaned {
            drop_token(&*subscribe_handle, &identity, token);
        }
    }

    /// Tear down every subscription for `identity` and forget it.
    ///
    /// Unsubscribe failures are swallowed: the OS may have destroyed the
    /// session before we got to the explicit unsubscribe. Never raises.
    pub fn unregister_session(&self, identity: &str) {
        if let Some((_, tracked)) = self.sessions.remove(identity) {
            debug!("unregistering session {}", identity);
            for (_, token) in tracked.tokens {
                drop_token(&*tracked.handle, identity, token);
            }
        }
    }

    /// Tear down every tracked session; used only during bridge teardown
    pub fn unregister_all(&self) {
        let identities: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for identity in identities {
            self.unregister_session(&identity);
        }
    }

    /// Whether `identity` is currently tracked
    pub fn is_tracked(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Number of tracked sessions
    pub fn tracked_count(&self) -> usize {
        self.sessions.len()
    }

    /// Kinds currently wired for `identity`, for inspection
    pub fn wired_kinds(&self, identity: &str) -> Vec<EventKind> {
        self.sessions
            .get(identity)
            .map(|s| s.tokens.iter().map(|(kind, _)| *kind).collect())
            .unwrap_or_default()
    }
}

impl Default for EventTokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn drop_token(handle: &dyn SessionHandle, identity: &str, token: SubscriptionToken) {
    if let Err(e) = handle.unsubscribe(token) {
        debug!("unsubscribe for {} failed (session gone?): {}", identity, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::MockSource;
    use crate::source::SessionSource;
    use tokio::sync::mpsc;

    const ALL_PROPERTY_KINDS: [EventKind; 3] = [
        EventKind::PlaybackStateChanged,
        EventKind::TimelinePropertiesChanged,
        EventKind::MediaPropertiesChanged,
    ];

    fn setup(id: &str) -> (MockSource, Arc<dyn SessionHandle>) {
        let source = MockSource::new();
        source.add_session(id);
        let handle = source.enumerate().unwrap().remove(0);
        (source, handle)
    }

    #[test]
    fn test_register_wires_only_live_kinds() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &[EventKind::PlaybackStateChanged], &tx);

        assert!(registry.is_tracked("A"));
        assert_eq!(registry.wired_kinds("A"), vec![EventKind::PlaybackStateChanged]);
        assert_eq!(source.session("A").unwrap().subscription_count(), 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle.clone(), &ALL_PROPERTY_KINDS, &tx);
        registry.register_session(handle, &ALL_PROPERTY_KINDS, &tx);

        assert_eq!(registry.wired_kinds("A").len(), 3);
        assert_eq!(source.session("A").unwrap().subscription_count(), 3);
    }

    #[test]
    fn test_register_tops_up_newly_live_kinds() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle.clone(), &[EventKind::PlaybackStateChanged], &tx);
        registry.register_session(
            handle,
            &[EventKind::PlaybackStateChanged, EventKind::MediaPropertiesChanged],
            &tx,
        );

        let mut wired = registry.wired_kinds("A");
        wired.sort_by_key(|kind| kind.index());
        assert_eq!(
            wired,
            vec![EventKind::PlaybackStateChanged, EventKind::MediaPropertiesChanged]
        );
        assert_eq!(source.session("A").unwrap().subscription_count(), 2);
    }

    #[test]
    fn test_manager_kinds_track_without_wiring() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &[EventKind::SessionAdded, EventKind::SessionRemoved], &tx);

        assert!(registry.is_tracked("A"));
        assert!(registry.wired_kinds("A").is_empty());
        assert_eq!(source.session("A").unwrap().subscription_count(), 0);
    }

    #[test]
    fn test_one_refused_kind_does_not_block_others() {
        let (source, handle) = setup("A");
        source.session("A").unwrap().refuse_playback_watch(true);
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &ALL_PROPERTY_KINDS, &tx);

        let mut wired = registry.wired_kinds("A");
        wired.sort_by_key(|kind| kind.index());
        assert_eq!(
            wired,
            vec![
                EventKind::TimelinePropertiesChanged,
                EventKind::MediaPropertiesChanged
            ]
        );
    }

    #[test]
    fn test_wired_callback_sends_identity_and_kind() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &[EventKind::TimelinePropertiesChanged], &tx);
        source.session("A").unwrap().fire_timeline_changed();

        match rx.try_recv().unwrap() {
            BridgeMessage::Property { kind, identity } => {
                assert_eq!(kind, EventKind::TimelinePropertiesChanged);
                assert_eq!(identity, "A");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unregister_releases_subscriptions() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &ALL_PROPERTY_KINDS, &tx);
        assert_eq!(source.session("A").unwrap().subscription_count(), 3);

        registry.unregister_session("A");
        assert!(!registry.is_tracked("A"));
        assert_eq!(source.session("A").unwrap().subscription_count(), 0);
    }

    #[test]
    fn test_unregister_vanished_session_never_raises() {
        let (source, handle) = setup("A");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register_session(handle, &ALL_PROPERTY_KINDS, &tx);
        source.remove_session("A");

        registry.unregister_session("A");
        assert!(!registry.is_tracked("A"));
    }

    #[test]
    fn test_unregister_unknown_identity_is_silent() {
        let registry = EventTokenRegistry::new();
        registry.unregister_session("ghost");
        assert_eq!(registry.tracked_count(), 0);
    }

    #[test]
    fn test_unregister_all() {
        let source = MockSource::new();
        source.add_session("A");
        source.add_session("B");
        let registry = EventTokenRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        for handle in source.enumerate().unwrap() {
            registry.register_session(handle, &ALL_PROPERTY_KINDS, &tx);
        }
        assert_eq!(registry.tracked_count(), 2);

        registry.unregister_all();
        assert_eq!(registry.tracked_count(), 0);
        assert_eq!(source.session("A").unwrap().subscription_count(), 0);
        assert_eq!(source.session("B").unwrap().subscription_count(), 0);
    }
}
