//! Bridge Events
//!
//! The closed set of subscribable event kinds and the payload delivered to
//! subscriber callbacks. Dispatch is table-driven off `EventKind` rather than
//! open-ended string lookups, so an unknown kind is rejected at the boundary
//! instead of being silently ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;
use crate::record::SessionRecord;

/// Logical event kinds a subscriber can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A session appeared in the manager-level session list
    SessionAdded,
    /// A session disappeared from the manager-level session list
    SessionRemoved,
    /// A session's playback info changed (status, shuffle, repeat, controls)
    PlaybackStateChanged,
    /// A session's timeline properties changed (position, seek range)
    TimelinePropertiesChanged,
    /// A session's media properties changed (title, artist, album)
    MediaPropertiesChanged,
}

impl EventKind {
    /// Number of event kinds; sizes the callback slot table
    pub const COUNT: usize = 5;

    /// Every kind, in slot order
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::SessionAdded,
        EventKind::SessionRemoved,
        EventKind::PlaybackStateChanged,
        EventKind::TimelinePropertiesChanged,
        EventKind::MediaPropertiesChanged,
    ];

    /// Slot index for this kind
    pub fn index(self) -> usize {
        match self {
            Self::SessionAdded => 0,
            Self::SessionRemoved => 1,
            Self::PlaybackStateChanged => 2,
            Self::TimelinePropertiesChanged => 3,
            Self::MediaPropertiesChanged => 4,
        }
    }

    /// Wire name as exposed to subscribers
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionAdded => "sessionadded",
            Self::SessionRemoved => "sessionremoved",
            Self::PlaybackStateChanged => "playbackstatechanged",
            Self::TimelinePropertiesChanged => "timelinepropertieschanged",
            Self::MediaPropertiesChanged => "mediapropertieschanged",
        }
    }

    /// Kinds backed by the single manager-level list-changed registration
    pub fn is_manager_level(self) -> bool {
        matches!(self, Self::SessionAdded | Self::SessionRemoved)
    }

    /// Kinds backed by a per-session registration
    pub fn is_per_session(self) -> bool {
        !self.is_manager_level()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sessionadded" => Ok(Self::SessionAdded),
            "sessionremoved" => Ok(Self::SessionRemoved),
            "playbackstatechanged" => Ok(Self::PlaybackStateChanged),
            "timelinepropertieschanged" => Ok(Self::TimelinePropertiesChanged),
            "mediapropertieschanged" => Ok(Self::MediaPropertiesChanged),
            other => Err(BridgeError::InvalidEventKind(other.to_string())),
        }
    }
}

/// Payload delivered to a subscriber callback
///
/// `sessionremoved` carries no record (the session is already gone); the other
/// kinds carry a best-effort snapshot that is `None` if the session vanished
/// before its properties could be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Which logical event fired
    pub kind: EventKind,
    /// Identity of the session the event belongs to
    pub identity: String,
    /// Snapshot of the session at delivery time, when one could be captured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<SessionRecord>,
}

/// Callback type for subscriber event delivery
pub type EventCallback = Box<dyn Fn(BridgeEvent) + Send + Sync>;

/// Internal message pushed from OS callback threads into the delivery channel.
///
/// OS callbacks copy only identity + kind; session handles never travel
/// through the channel.
#[derive(Debug, Clone)]
pub(crate) enum BridgeMessage {
    /// The manager-level session list changed; run a reconcile pass
    ListChanged,
    /// A per-session property notification fired
    Property { kind: EventKind, identity: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = "sessionchanged".parse::<EventKind>().unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEventKind(ref s) if s == "sessionchanged"));
    }

    #[test]
    fn test_slot_indices_are_dense() {
        let mut seen = [false; EventKind::COUNT];
        for kind in EventKind::ALL {
            assert!(!seen[kind.index()]);
            seen[kind.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_manager_level_split() {
        assert!(EventKind::SessionAdded.is_manager_level());
        assert!(EventKind::SessionRemoved.is_manager_level());
        assert!(EventKind::PlaybackStateChanged.is_per_session());
        assert!(EventKind::TimelinePropertiesChanged.is_per_session());
        assert!(EventKind::MediaPropertiesChanged.is_per_session());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&EventKind::TimelinePropertiesChanged).unwrap();
        assert_eq!(json, "\"timelinepropertieschanged\"");
    }
}
