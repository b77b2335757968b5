use serde::{Deserialize, Serialize};

use crate::error::TimelineError;

/// Delivery state of a timeline item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SendingStatus {
    /// Local item that has not been acknowledged by the server yet.
    Pending,
    /// Item accepted by the server.
    Succeeded,
    /// Local send attempt failed.
    Failed,
}

/// Opaque message content carried by a timeline item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelinePayload {
    /// Plain text message.
    Text {
        /// Message body.
        body: String,
    },
    /// Any other message kind (polls, files, admin notices, ...).
    Custom {
        /// Source-defined kind tag.
        kind: String,
        /// Source-defined serialized data.
        data: String,
    },
}

impl TimelinePayload {
    /// Convenience constructor for text payloads.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }
}

/// One message/event in a conversation's ordered history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineItem {
    /// Server-assigned ID, unique within the conversation.
    ///
    /// `None` while a local send is still pending.
    pub id: Option<String>,
    /// Locally assigned request ID used before the server ID is known.
    pub client_request_id: Option<String>,
    /// Sender identifier.
    pub sender: String,
    /// Creation timestamp in milliseconds. Not guaranteed strictly increasing.
    pub created_at: i64,
    /// Message content.
    pub payload: TimelinePayload,
    /// Delivery state.
    pub sending_status: SendingStatus,
}

impl TimelineItem {
    /// Build a server-confirmed item.
    pub fn confirmed(
        id: impl Into<String>,
        sender: impl Into<String>,
        created_at: i64,
        payload: TimelinePayload,
    ) -> Self {
        Self {
            id: Some(id.into()),
            client_request_id: None,
            sender: sender.into(),
            created_at,
            payload,
            sending_status: SendingStatus::Succeeded,
        }
    }

    /// Build a locally created item that is waiting for server acknowledgement.
    pub fn pending(
        client_request_id: impl Into<String>,
        sender: impl Into<String>,
        created_at: i64,
        payload: TimelinePayload,
    ) -> Self {
        Self {
            id: None,
            client_request_id: Some(client_request_id.into()),
            sender: sender.into(),
            created_at,
            payload,
            sending_status: SendingStatus::Pending,
        }
    }

    /// Attach a client request ID.
    pub fn with_client_request_id(mut self, client_request_id: impl Into<String>) -> Self {
        self.client_request_id = Some(client_request_id.into());
        self
    }

    /// Whether the item carries at least one lookup key.
    pub fn has_key(&self) -> bool {
        self.id.is_some() || self.client_request_id.is_some()
    }

    /// Whether `key` addresses this item.
    pub fn matches_key(&self, key: &ItemKey) -> bool {
        match key {
            ItemKey::Id(id) => self.id.as_deref() == Some(id.as_str()),
            ItemKey::ClientRequest(request_id) => {
                self.client_request_id.as_deref() == Some(request_id.as_str())
            }
        }
    }

    /// Whether `other` represents the same message, by server ID or client request ID.
    pub fn same_message(&self, other: &TimelineItem) -> bool {
        let same_id = matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b);
        let same_request = matches!(
            (&self.client_request_id, &other.client_request_id),
            (Some(a), Some(b)) if a == b
        );
        same_id || same_request
    }
}

/// Key addressing a single timeline item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemKey {
    /// Server-assigned item ID.
    Id(String),
    /// Locally assigned client request ID.
    ClientRequest(String),
}

impl ItemKey {
    /// Preferred key for an item: server ID when present, client request ID otherwise.
    pub fn for_item(item: &TimelineItem) -> Option<Self> {
        item.id
            .clone()
            .map(Self::Id)
            .or_else(|| item.client_request_id.clone().map(Self::ClientRequest))
    }
}

/// Immutable copy of a conversation timeline handed to presentation code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineSnapshot {
    /// Conversation the snapshot belongs to.
    pub conversation_id: String,
    /// Items in display order (oldest first).
    pub items: Vec<TimelineItem>,
}

/// Pagination boundary on one side of the loaded window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageBoundary {
    /// Opaque token for the next request in this direction.
    pub token: Option<String>,
    /// Whether more items exist in this direction.
    pub has_more: bool,
}

impl PageBoundary {
    /// Boundary with more items behind `token`.
    pub fn more(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            has_more: true,
        }
    }

    /// Boundary with nothing further in this direction.
    pub fn exhausted() -> Self {
        Self::default()
    }
}

/// Older/newer cursor pair of the active subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPair {
    /// Boundary before the oldest loaded item.
    pub older: PageBoundary,
    /// Boundary after the newest loaded item.
    pub newer: PageBoundary,
}

impl CursorPair {
    pub fn has_older(&self) -> bool {
        self.older.has_more
    }

    pub fn has_newer(&self) -> bool {
        self.newer.has_more
    }

    /// Forget both boundaries.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Boundary for `direction`.
    pub fn boundary(&self, direction: PageDirection) -> &PageBoundary {
        match direction {
            PageDirection::Older => &self.older,
            PageDirection::Newer => &self.newer,
        }
    }

    /// Overwrite the boundary for `direction`.
    pub fn set_boundary(&mut self, direction: PageDirection, boundary: PageBoundary) {
        match direction {
            PageDirection::Older => self.older = boundary,
            PageDirection::Newer => self.newer = boundary,
        }
    }
}

/// Paging direction relative to the loaded window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PageDirection {
    Older,
    Newer,
}

/// Request for one page of history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCursor {
    /// Token returned by the previous page or snapshot.
    pub token: Option<String>,
    /// Maximum number of items to return.
    pub limit: u16,
}

/// Page of items returned by older/newer pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelinePage {
    /// Items sorted by `created_at` ascending.
    pub items: Vec<TimelineItem>,
    /// Boundary for the following request in the same direction.
    pub boundary: PageBoundary,
}

/// Initial window returned by cache and authoritative snapshot requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineSlice {
    /// Items sorted by `created_at` ascending.
    pub items: Vec<TimelineItem>,
    /// Cursors surrounding the window.
    pub cursors: CursorPair,
}

/// Where a timeline subscription resumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StartPoint {
    /// Start from the newest messages.
    Latest,
    /// Start around the given timestamp (milliseconds).
    At(i64),
}

impl StartPoint {
    /// Resume point for an optional checkpoint value.
    pub fn from_checkpoint(last_seen: Option<i64>) -> Self {
        last_seen.map_or(Self::Latest, Self::At)
    }
}

/// Why the source removed items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemovalReason {
    /// Server confirmed deletion.
    Confirmed,
    /// Local send failed; the optimistic item should disappear.
    SendFailed,
    /// Any other status reported by the source.
    Other,
}

/// Conversation metadata forwarded from the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    /// Conversation identifier.
    pub conversation_id: String,
    /// Best-effort display name.
    pub name: Option<String>,
    /// Number of members.
    pub member_count: u64,
    /// Unread message count for the local user.
    pub unread_count: u64,
}

/// Live event delivered by a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceEvent {
    /// New items at the tail (or server echoes of pending items).
    Added(Vec<TimelineItem>),
    /// Existing items changed.
    Updated(Vec<TimelineItem>),
    /// Items were removed.
    Removed {
        /// Keys of removed items.
        keys: Vec<ItemKey>,
        /// Removal reason.
        reason: RemovalReason,
    },
    /// Too many live events were missed; incremental repair is not possible.
    GapDetected,
    /// Conversation metadata changed.
    ChannelUpdated(ConversationInfo),
    /// Conversation was deleted.
    ChannelDeleted {
        /// Deleted conversation identifier.
        conversation_id: String,
    },
}

/// Lifecycle state of a sync controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing loaded yet, or the last initial load failed.
    Idle,
    /// Initial cache/authoritative load is running.
    LoadingInitial,
    /// Live subscription is open and no page request is in flight.
    Ready,
    /// At least one page request is in flight.
    Paging,
    /// Full resynchronization after a gap.
    Reconnecting,
    /// Terminal state.
    Disposed,
}

/// Commands accepted by a sync controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Run the cache + authoritative initial load and subscribe.
    LoadInitial,
    /// Load one page of older history.
    LoadOlder,
    /// Load one page of newer history.
    LoadNewer,
    /// Send a read receipt.
    MarkRead,
    /// Tear everything down.
    Dispose,
}

impl ControllerCommand {
    /// Stable name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadInitial => "load_initial",
            Self::LoadOlder => "load_older",
            Self::LoadNewer => "load_newer",
            Self::MarkRead => "mark_read",
            Self::Dispose => "dispose",
        }
    }
}

/// Notifications emitted to presentation code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Controller lifecycle transition.
    StateChanged {
        /// New state.
        state: SyncState,
    },
    /// Timeline contents changed.
    ContentsChanged(TimelineSnapshot),
    /// Conversation metadata changed.
    ChannelUpdated(ConversationInfo),
    /// Conversation was deleted. The timeline is left as is.
    ChannelDeleted {
        /// Deleted conversation identifier.
        conversation_id: String,
    },
    /// A user-visible operation failed.
    Error(TimelineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_items_by_either_key() {
        let pending = TimelineItem::pending("req-1", "alice", 10, TimelinePayload::text("hi"));
        let echoed = TimelineItem::confirmed("m-1", "alice", 10, TimelinePayload::text("hi"))
            .with_client_request_id("req-1");

        assert!(pending.same_message(&echoed));
        assert!(echoed.matches_key(&ItemKey::Id("m-1".into())));
        assert!(pending.matches_key(&ItemKey::ClientRequest("req-1".into())));
        assert!(!pending.matches_key(&ItemKey::Id("m-1".into())));
    }

    #[test]
    fn keyless_items_never_match() {
        let mut a = TimelineItem::confirmed("m-1", "alice", 1, TimelinePayload::text("a"));
        a.id = None;
        let b = a.clone();
        assert!(!a.has_key());
        assert!(!a.same_message(&b));
        assert_eq!(ItemKey::for_item(&a), None);
    }

    #[test]
    fn start_point_follows_checkpoint() {
        assert_eq!(StartPoint::from_checkpoint(None), StartPoint::Latest);
        assert_eq!(StartPoint::from_checkpoint(Some(42)), StartPoint::At(42));
    }

    #[test]
    fn cursor_reset_clears_both_sides() {
        let mut cursors = CursorPair {
            older: PageBoundary::more("o"),
            newer: PageBoundary::more("n"),
        };
        assert!(cursors.has_older() && cursors.has_newer());
        cursors.reset();
        assert!(!cursors.has_older());
        assert_eq!(cursors.boundary(PageDirection::Newer), &PageBoundary::exhausted());
    }

    #[test]
    fn events_serialize_with_snapshot() {
        let event = ControllerEvent::ContentsChanged(TimelineSnapshot {
            conversation_id: "c-1".into(),
            items: vec![TimelineItem::confirmed(
                "m-1",
                "alice",
                5,
                TimelinePayload::text("hello"),
            )],
        });
        let encoded = serde_json::to_string(&event).expect("event should serialize");
        let decoded: ControllerEvent =
            serde_json::from_str(&encoded).expect("event should deserialize");
        assert_eq!(decoded, event);
    }
}
