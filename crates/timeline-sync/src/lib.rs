//! Sync runtime for conversation timelines.
//!
//! [`spawn_controller`] starts one controller task per conversation. It pulls
//! snapshots and pages from an [`EventSource`], applies live events to the
//! timeline store and broadcasts [`timeline_core::ControllerEvent`]s to
//! presentation subscribers.

/// Per-conversation controller runtime and handle.
pub mod controller;
/// In-process conversation simulator.
pub mod memory;
/// Event source contract and live subscription handle.
pub mod source;

pub use controller::{
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, SyncConfig, SyncControllerHandle, bounded_page_size,
    spawn_controller,
};
pub use memory::{DEFAULT_GAP_THRESHOLD, InMemoryEventSource, SourceOp};
pub use source::{EventSource, Subscription, SubscriptionPublisher};
