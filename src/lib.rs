//! Bridge from OS media-playback sessions to a single subscriber interface.
//!
//! Sessions appear and disappear as applications start and stop producing
//! media, and every session raises property-change notifications on its own
//! OS callback thread. The [`SessionEventBridge`] turns that into one calm
//! surface: enumerate sessions, look one up by identity, and subscribe at
//! most one callback per event kind, with delivery funneled through a single
//! dispatcher regardless of which thread the OS fired on.

pub mod bridge;
pub mod error;
pub mod record;
pub mod source;

pub use bridge::{BridgeEvent, EventKind, SessionEventBridge};
pub use error::{BridgeError, BridgeResult};
pub use record::{MediaProperties, PlaybackInfo, SessionRecord, TimelineProperties};
pub use source::{platform_source, SessionHandle, SessionSource};
