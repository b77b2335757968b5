use std::{collections::HashSet, fmt};

use thiserror::Error;

use crate::types::{ItemKey, SendingStatus, TimelineItem, TimelineSnapshot};

/// Synchronous callback invoked after every mutation that changed the contents.
pub type ContentsListener = Box<dyn FnMut(&TimelineSnapshot) + Send>;

/// Errors that can occur while applying timeline mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// A newer batch starts before the current timeline tail.
    #[error("batch starting at {earliest} is older than timeline tail at {latest}")]
    OutOfOrder { earliest: i64, latest: i64 },
    /// Input was not sorted by `created_at`.
    #[error("items are not sorted by created_at (first violation at index {index})")]
    InvalidOrder { index: usize },
    /// Two input items share the same server ID.
    #[error("item id '{0}' appears more than once")]
    DuplicateId(String),
    /// An item has neither a server ID nor a client request ID.
    #[error("item at index {index} has neither id nor client_request_id")]
    Malformed { index: usize },
}

/// Ordered, deduplicated message list for one conversation.
///
/// Items are kept sorted by `created_at` ascending with ties in insertion
/// order. Only `prepend_older` skips the ordering check, since historical pages
/// are assumed to be internally sorted and non-overlapping.
pub struct TimelineStore {
    conversation_id: String,
    items: Vec<TimelineItem>,
    listener: Option<ContentsListener>,
}

impl fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineStore")
            .field("conversation_id", &self.conversation_id)
            .field("items", &self.items)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl TimelineStore {
    /// Create an empty store for a conversation.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            items: Vec::new(),
            listener: None,
        }
    }

    /// Register the contents listener, replacing any previous one.
    pub fn set_listener(&mut self, listener: ContentsListener) {
        self.listener = Some(listener);
    }

    /// Drop the contents listener.
    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current timeline items in display order.
    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn latest_created_at(&self) -> Option<i64> {
        self.items.last().map(|item| item.created_at)
    }

    /// Whether an item with the given client request ID is present.
    pub fn contains_client_request(&self, client_request_id: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.client_request_id.as_deref() == Some(client_request_id))
    }

    /// Immutable copy of the current contents.
    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            conversation_id: self.conversation_id.clone(),
            items: self.items.clone(),
        }
    }

    /// Replace the entire contents. Used for initial load and gap recovery only.
    pub fn seed(&mut self, items: Vec<TimelineItem>) -> Result<(), TimelineMergeError> {
        validate_batch(&items)?;
        self.items = items;
        self.notify();
        Ok(())
    }

    /// Replace the contents but keep local pending items the new contents do not know about.
    ///
    /// Surviving items are merged by `created_at`, after any equal timestamps.
    /// Returns the number of preserved items.
    pub fn seed_preserving_pending(
        &mut self,
        items: Vec<TimelineItem>,
    ) -> Result<usize, TimelineMergeError> {
        validate_batch(&items)?;

        let survivors: Vec<TimelineItem> = self
            .items
            .iter()
            .filter(|existing| existing.sending_status == SendingStatus::Pending)
            .filter(|existing| !items.iter().any(|incoming| incoming.same_message(existing)))
            .cloned()
            .collect();
        let preserved = survivors.len();

        let mut merged = items;
        for item in survivors {
            let at = merged.partition_point(|it| it.created_at <= item.created_at);
            merged.insert(at, item);
        }

        self.items = merged;
        self.notify();
        Ok(preserved)
    }

    /// Append a batch of newer items at the tail.
    ///
    /// The batch is rejected when its earliest item is older than the current
    /// tail. Items whose ID is already present move from their old slot to the
    /// tail instead of being duplicated. Returns the number of items appended.
    pub fn append_newer(&mut self, items: Vec<TimelineItem>) -> Result<usize, TimelineMergeError> {
        let Some(first) = items.first() else {
            return Ok(0);
        };
        validate_batch(&items)?;

        if let Some(latest) = self.latest_created_at()
            && first.created_at < latest
        {
            return Err(TimelineMergeError::OutOfOrder {
                earliest: first.created_at,
                latest,
            });
        }

        let count = items.len();
        for item in items {
            if let Some(idx) = self.position_by_id(&item) {
                self.items.remove(idx);
            }
            self.items.push(item);
        }
        self.notify();
        Ok(count)
    }

    /// Insert a page of older items at the head without an ordering check.
    ///
    /// Items whose ID is already present are skipped. Returns the number inserted.
    pub fn prepend_older(&mut self, items: Vec<TimelineItem>) -> usize {
        let fresh: Vec<TimelineItem> = items
            .into_iter()
            .filter(|item| self.position_by_id(item).is_none())
            .collect();
        if fresh.is_empty() {
            return 0;
        }

        let count = fresh.len();
        self.items.splice(0..0, fresh);
        self.notify();
        count
    }

    /// Overwrite existing entries matched by ID or client request ID, in place.
    ///
    /// Unmatched items are ignored. Returns the number of replaced entries.
    pub fn replace(&mut self, items: Vec<TimelineItem>) -> usize {
        let mut replaced = 0;
        for item in items {
            if let Some(existing) = self.items.iter_mut().find(|it| it.same_message(&item)) {
                *existing = item;
                replaced += 1;
            }
        }

        if replaced > 0 {
            self.notify();
        }
        replaced
    }

    /// Delete entries addressed by any of `keys`. Returns the number removed.
    pub fn remove(&mut self, keys: &[ItemKey]) -> usize {
        let before = self.items.len();
        self.items
            .retain(|item| !keys.iter().any(|key| item.matches_key(key)));
        let removed = before - self.items.len();

        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// Put back previously captured contents, notifying only if anything differs.
    pub fn rollback_to(&mut self, items: Vec<TimelineItem>) {
        if self.items == items {
            return;
        }
        self.items = items;
        self.notify();
    }

    fn position_by_id(&self, item: &TimelineItem) -> Option<usize> {
        let id = item.id.as_deref()?;
        self.items
            .iter()
            .position(|it| it.id.as_deref() == Some(id))
    }

    fn notify(&mut self) {
        if self.listener.is_none() {
            return;
        }
        let snapshot = self.snapshot();
        if let Some(listener) = self.listener.as_mut() {
            listener(&snapshot);
        }
    }
}

/// Check that a batch is keyed, sorted by `created_at` and free of duplicate IDs.
pub fn validate_batch(items: &[TimelineItem]) -> Result<(), TimelineMergeError> {
    let mut seen_ids = HashSet::new();
    let mut previous: Option<i64> = None;

    for (index, item) in items.iter().enumerate() {
        if !item.has_key() {
            return Err(TimelineMergeError::Malformed { index });
        }
        if let Some(previous) = previous
            && item.created_at < previous
        {
            return Err(TimelineMergeError::InvalidOrder { index });
        }
        if let Some(id) = item.id.as_deref()
            && !seen_ids.insert(id)
        {
            return Err(TimelineMergeError::DuplicateId(id.to_owned()));
        }
        previous = Some(item.created_at);
    }

    Ok(())
}
