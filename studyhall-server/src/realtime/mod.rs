//! In-process real-time plumbing: the connection registry, the
//! broadcaster that fans domain events out over it, and the presence
//! tracker. None of these touch the store.

pub mod broadcaster;
pub mod presence;
pub mod registry;

pub use broadcaster::Broadcaster;
pub use presence::{PresenceTracker, TouchOutcome};
pub use registry::{ConnectionHandle, ConnectionRegistry, Scope};
