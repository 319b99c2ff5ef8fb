//! Session Source Abstraction
//!
//! Provides a unified interface over OS session managers:
//! - SMTC (Windows, primary backend)
//! - In-memory mock (tests and demos)
//!
//! The source is an inherently asynchronous, multi-threaded producer: it
//! raises notifications on its own callback threads, concurrently with
//! everything else. Implementations only promise that registered callbacks
//! are `Send + Sync` invocable; they make no ordering promises across
//! sessions.

pub mod mock;

#[cfg(windows)]
pub mod smtc;

use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};
use crate::record::{MediaProperties, PlaybackInfo, TimelineProperties};

/// Opaque handle for one registered notification callback.
///
/// Backends map it to whatever their native registration token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Callback invoked when the manager-level session list changes
pub type ListChangedCallback = Box<dyn Fn() + Send + Sync>;

/// Callback invoked when one session's properties change
pub type SessionChangedCallback = Box<dyn Fn() + Send + Sync>;

/// A manager of OS-level media sessions
pub trait SessionSource: Send + Sync {
    /// Enumerate the currently active sessions
    fn enumerate(&self) -> BridgeResult<Vec<Arc<dyn SessionHandle>>>;

    /// The session the OS considers current, if any
    fn current_session(&self) -> BridgeResult<Option<Arc<dyn SessionHandle>>>;

    /// Register for manager-level session-list changes
    fn on_list_changed(&self, callback: ListChangedCallback) -> BridgeResult<SubscriptionToken>;

    /// Remove a manager-level registration
    fn remove_list_changed(&self, token: SubscriptionToken) -> BridgeResult<()>;
}

/// One live media session
///
/// Handles are cheap to clone via `Arc` and are valid only as long as the
/// underlying session lives; property reads and unsubscribes against a
/// vanished session fail with [`BridgeError::SessionRead`] /
/// [`BridgeError::Subscription`].
pub trait SessionHandle: Send + Sync {
    /// Stable identity of the producing application
    fn identity(&self) -> String;

    /// Read the session's media metadata
    fn media_properties(&self) -> BridgeResult<MediaProperties>;

    /// Read the session's timeline properties
    fn timeline_properties(&self) -> BridgeResult<TimelineProperties>;

    /// Read the session's playback info
    fn playback_info(&self) -> BridgeResult<PlaybackInfo>;

    /// Register for playback-info changes
    fn on_playback_changed(&self, callback: SessionChangedCallback)
        -> BridgeResult<SubscriptionToken>;

    /// Register for timeline-property changes
    fn on_timeline_changed(&self, callback: SessionChangedCallback)
        -> BridgeResult<SubscriptionToken>;

    /// Register for media-property changes
    fn on_media_changed(&self, callback: SessionChangedCallback)
        -> BridgeResult<SubscriptionToken>;

    /// Remove a per-session registration
    fn unsubscribe(&self, token: SubscriptionToken) -> BridgeResult<()>;
}

/// Create the session source native to this platform.
///
/// Fails with [`BridgeError::SourceUnavailable`] on platforms without a
/// supported session manager.
pub fn platform_source() -> BridgeResult<Arc<dyn SessionSource>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(smtc::SmtcSource::new()?))
    }
    #[cfg(not(windows))]
    {
        Err(BridgeError::SourceUnavailable(
            "no media session manager on this platform".to_string(),
        ))
    }
}
