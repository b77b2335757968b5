//! Core timeline contract shared by sync runtimes and presentation consumers.
//!
//! This crate defines the item model, the ordered timeline store, the
//! controller lifecycle, command/event channels and live-delta helpers.

/// Async command/event channel primitives.
pub mod channel;
/// Stable timeline error types.
pub mod error;
/// Live-delta normalization helpers.
pub mod normalization;
/// Controller lifecycle state machine.
pub mod state_machine;
/// Ordered timeline store.
pub mod timeline;
/// Item model, commands, events and source contract types.
pub mod types;

pub use channel::{ControllerChannelError, ControllerChannels, EventEmitter, EventStream};
pub use error::{TimelineError, TimelineErrorKind};
pub use normalization::{
    AddedBatch, RemovalPlan, error_event, normalize_load_error, partition_added, plan_removal,
};
pub use state_machine::SyncStateMachine;
pub use timeline::{ContentsListener, TimelineMergeError, TimelineStore, validate_batch};
pub use types::{
    ControllerCommand, ControllerEvent, ConversationInfo, CursorPair, ItemKey, PageBoundary,
    PageCursor, PageDirection, RemovalReason, SendingStatus, SourceEvent, StartPoint, SyncState,
    TimelineItem, TimelinePage, TimelinePayload, TimelineSlice, TimelineSnapshot,
};
