//! Session Event Bridge Module
//!
//! Bridges a live, mutable set of OS media sessions to one subscriber:
//! - Snapshot diffing for add/remove detection
//! - Deduplicated per-session event subscriptions
//! - At most one live callback per event kind
//! - Single-channel cross-thread delivery with strict teardown guarantees

pub mod core;
pub mod diff;
pub mod events;
pub mod registry;
pub mod slots;

pub use self::core::SessionEventBridge;
pub use diff::{SessionSnapshot, SnapshotDiff};
pub use events::{BridgeEvent, EventCallback, EventKind};
pub use registry::EventTokenRegistry;
pub use slots::CallbackSlotTable;
