//! In-process conversation simulator implementing [`EventSource`].
//!
//! Holds a server-side history and a separate (possibly stale) local cache,
//! pages with item-key tokens, publishes live events to subscribers, and
//! counts events missed while offline to decide between a catch-up batch and
//! a gap signal.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use timeline_core::{
    ConversationInfo, CursorPair, ItemKey, PageBoundary, PageCursor, RemovalReason, SourceEvent,
    StartPoint, TimelineError, TimelineItem, TimelinePage, TimelineSlice,
};
use tracing::{debug, trace};

use crate::source::{EventSource, Subscription, SubscriptionPublisher};

/// Missed-event count above which the source reports a gap instead of catching up.
pub const DEFAULT_GAP_THRESHOLD: usize = 300;
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Source operations, recorded for inspection and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOp {
    Cache,
    Authoritative,
    Older,
    Newer,
    Subscribe,
    MarkRead,
}

#[derive(Debug)]
struct MemoryState {
    conversation: ConversationInfo,
    server: Vec<TimelineItem>,
    cache: Vec<TimelineItem>,
    publishers: Vec<SubscriptionPublisher>,
    offline: bool,
    missed: Vec<TimelineItem>,
    failures: HashMap<SourceOp, TimelineError>,
    calls: Vec<SourceOp>,
    read_receipts: u64,
}

/// Conversation simulator backed by in-memory vectors.
#[derive(Debug)]
pub struct InMemoryEventSource {
    state: Mutex<MemoryState>,
    gap_threshold: usize,
    subscription_buffer: usize,
}

impl InMemoryEventSource {
    pub fn new(conversation: ConversationInfo) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                conversation,
                server: Vec::new(),
                cache: Vec::new(),
                publishers: Vec::new(),
                offline: false,
                missed: Vec::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                read_receipts: 0,
            }),
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }

    /// Override the missed-event threshold that triggers a gap signal.
    pub fn with_gap_threshold(mut self, gap_threshold: usize) -> Self {
        self.gap_threshold = gap_threshold;
        self
    }

    /// Replace server history and cache. Items must be sorted by `created_at`.
    pub fn seed_history(&self, items: Vec<TimelineItem>) -> Result<(), TimelineError> {
        let mut state = self.lock()?;
        state.cache = items.clone();
        state.server = items;
        Ok(())
    }

    /// Replace only the local cache, e.g. to simulate a stale cache.
    pub fn set_cache(&self, items: Vec<TimelineItem>) -> Result<(), TimelineError> {
        self.lock()?.cache = items;
        Ok(())
    }

    /// Make the next call of `op` fail with `error`.
    pub fn inject_failure(&self, op: SourceOp, error: TimelineError) -> Result<(), TimelineError> {
        self.lock()?.failures.insert(op, error);
        Ok(())
    }

    /// Operations served so far, in call order.
    pub fn calls(&self) -> Result<Vec<SourceOp>, TimelineError> {
        Ok(self.lock()?.calls.clone())
    }

    pub fn read_receipts(&self) -> Result<u64, TimelineError> {
        Ok(self.lock()?.read_receipts)
    }

    pub fn server_items(&self) -> Result<Vec<TimelineItem>, TimelineError> {
        Ok(self.lock()?.server.clone())
    }

    /// Number of live subscriptions that are still open.
    pub fn subscriber_count(&self) -> Result<usize, TimelineError> {
        let mut state = self.lock()?;
        state.publishers.retain(|publisher| !publisher.is_closed());
        Ok(state.publishers.len())
    }

    /// Append new items on the server and deliver them live (or buffer them while offline).
    pub async fn publish_added(&self, items: Vec<TimelineItem>) -> Result<(), TimelineError> {
        let publishers = {
            let mut state = self.lock()?;
            for item in &items {
                upsert(&mut state.server, item);
                upsert(&mut state.cache, item);
            }
            if state.offline {
                state.missed.extend(items);
                return Ok(());
            }
            live_publishers(&mut state)
        };
        deliver(publishers, SourceEvent::Added(items)).await;
        Ok(())
    }

    /// Replace matching server items and deliver the update live.
    pub async fn publish_updated(&self, items: Vec<TimelineItem>) -> Result<(), TimelineError> {
        let publishers = {
            let mut state = self.lock()?;
            for item in &items {
                if let Some(existing) = state.server.iter_mut().find(|it| it.same_message(item)) {
                    *existing = item.clone();
                }
            }
            live_publishers(&mut state)
        };
        deliver(publishers, SourceEvent::Updated(items)).await;
        Ok(())
    }

    /// Remove items (confirmed deletions also leave server history) and deliver the removal.
    pub async fn publish_removed(
        &self,
        keys: Vec<ItemKey>,
        reason: RemovalReason,
    ) -> Result<(), TimelineError> {
        let publishers = {
            let mut state = self.lock()?;
            if reason == RemovalReason::Confirmed {
                state
                    .server
                    .retain(|item| !keys.iter().any(|key| item.matches_key(key)));
                state
                    .cache
                    .retain(|item| !keys.iter().any(|key| item.matches_key(key)));
            }
            live_publishers(&mut state)
        };
        deliver(publishers, SourceEvent::Removed { keys, reason }).await;
        Ok(())
    }

    pub async fn publish_channel_updated(
        &self,
        conversation: ConversationInfo,
    ) -> Result<(), TimelineError> {
        let publishers = {
            let mut state = self.lock()?;
            state.conversation = conversation.clone();
            live_publishers(&mut state)
        };
        deliver(publishers, SourceEvent::ChannelUpdated(conversation)).await;
        Ok(())
    }

    pub async fn publish_channel_deleted(&self) -> Result<(), TimelineError> {
        let (publishers, conversation_id) = {
            let mut state = self.lock()?;
            let conversation_id = state.conversation.conversation_id.clone();
            (live_publishers(&mut state), conversation_id)
        };
        deliver(publishers, SourceEvent::ChannelDeleted { conversation_id }).await;
        Ok(())
    }

    /// Stop live delivery; subsequent additions are counted as missed.
    pub fn go_offline(&self) -> Result<(), TimelineError> {
        self.lock()?.offline = true;
        Ok(())
    }

    /// Resume live delivery.
    ///
    /// Missed items are delivered as one catch-up batch, or replaced by a gap
    /// signal when more than the gap threshold were missed.
    pub async fn reconnect(&self) -> Result<(), TimelineError> {
        let (publishers, missed) = {
            let mut state = self.lock()?;
            state.offline = false;
            let missed = std::mem::take(&mut state.missed);
            (live_publishers(&mut state), missed)
        };

        if missed.is_empty() {
            return Ok(());
        }
        if missed.len() > self.gap_threshold {
            debug!(
                missed = missed.len(),
                threshold = self.gap_threshold,
                "missed events exceed threshold; signalling gap"
            );
            deliver(publishers, SourceEvent::GapDetected).await;
        } else {
            deliver(publishers, SourceEvent::Added(missed)).await;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, TimelineError> {
        self.state
            .lock()
            .map_err(|_| TimelineError::sync("poisoned_lock", "in-memory source lock poisoned"))
    }

    fn begin(&self, op: SourceOp) -> Result<(), TimelineError> {
        let mut state = self.lock()?;
        state.calls.push(op);
        trace!(?op, "in-memory source call");
        match state.failures.remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn fetch_cache(
        &self,
        start: StartPoint,
        limit: u16,
    ) -> Result<TimelineSlice, TimelineError> {
        self.begin(SourceOp::Cache)?;
        let state = self.lock()?;
        Ok(window(&state.cache, start, usize::from(limit)))
    }

    async fn fetch_authoritative(
        &self,
        start: StartPoint,
        limit: u16,
    ) -> Result<TimelineSlice, TimelineError> {
        self.begin(SourceOp::Authoritative)?;
        let state = self.lock()?;
        Ok(window(&state.server, start, usize::from(limit)))
    }

    async fn fetch_older(&self, cursor: &PageCursor) -> Result<TimelinePage, TimelineError> {
        self.begin(SourceOp::Older)?;
        let state = self.lock()?;
        let end = locate(&state.server, cursor)?;
        let start = end.saturating_sub(usize::from(cursor.limit.max(1)));

        let boundary = if start > 0 {
            boundary_at(&state.server, start)
        } else {
            PageBoundary::exhausted()
        };
        Ok(TimelinePage {
            items: state.server[start..end].to_vec(),
            boundary,
        })
    }

    async fn fetch_newer(&self, cursor: &PageCursor) -> Result<TimelinePage, TimelineError> {
        self.begin(SourceOp::Newer)?;
        let state = self.lock()?;
        let start = locate(&state.server, cursor)? + 1;
        let end = (start + usize::from(cursor.limit.max(1))).min(state.server.len());

        let boundary = if end < state.server.len() {
            boundary_at(&state.server, end - 1)
        } else {
            PageBoundary::exhausted()
        };
        Ok(TimelinePage {
            items: state.server[start..end].to_vec(),
            boundary,
        })
    }

    async fn subscribe(&self, start: StartPoint) -> Result<Subscription, TimelineError> {
        self.begin(SourceOp::Subscribe)?;
        let (publisher, subscription) = Subscription::channel(self.subscription_buffer);
        let mut state = self.lock()?;
        state.publishers.retain(|publisher| !publisher.is_closed());
        state.publishers.push(publisher);
        debug!(?start, subscribers = state.publishers.len(), "subscription opened");
        Ok(subscription)
    }

    async fn mark_read(&self) -> Result<(), TimelineError> {
        self.begin(SourceOp::MarkRead)?;
        let mut state = self.lock()?;
        state.read_receipts += 1;
        state.conversation.unread_count = 0;
        Ok(())
    }
}

/// Server echoes take over the slot of the local item they acknowledge.
fn upsert(items: &mut Vec<TimelineItem>, item: &TimelineItem) {
    match items.iter_mut().find(|existing| existing.same_message(item)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

fn live_publishers(state: &mut MemoryState) -> Vec<SubscriptionPublisher> {
    state.publishers.retain(|publisher| !publisher.is_closed());
    state.publishers.clone()
}

async fn deliver(publishers: Vec<SubscriptionPublisher>, event: SourceEvent) {
    for publisher in publishers {
        if !publisher.publish(event.clone()).await {
            trace!("skipping closed subscription");
        }
    }
}

fn window(items: &[TimelineItem], start: StartPoint, limit: usize) -> TimelineSlice {
    let limit = limit.max(1);
    let (from, to) = match start {
        StartPoint::Latest => (items.len().saturating_sub(limit), items.len()),
        StartPoint::At(timestamp) => {
            let anchor = items.partition_point(|item| item.created_at <= timestamp);
            (
                anchor.saturating_sub(limit),
                (anchor + limit).min(items.len()),
            )
        }
    };

    let older = if from > 0 {
        boundary_at(items, from)
    } else {
        PageBoundary::exhausted()
    };
    let newer = if to < items.len() && to > 0 {
        boundary_at(items, to - 1)
    } else {
        PageBoundary::exhausted()
    };

    TimelineSlice {
        items: items[from..to].to_vec(),
        cursors: CursorPair { older, newer },
    }
}

fn boundary_at(items: &[TimelineItem], index: usize) -> PageBoundary {
    PageBoundary {
        token: items.get(index).and_then(encode_token),
        has_more: true,
    }
}

fn encode_token(item: &TimelineItem) -> Option<String> {
    match ItemKey::for_item(item)? {
        ItemKey::Id(id) => Some(format!("id:{id}")),
        ItemKey::ClientRequest(request_id) => Some(format!("req:{request_id}")),
    }
}

fn decode_token(token: &str) -> Option<ItemKey> {
    if let Some(id) = token.strip_prefix("id:") {
        return Some(ItemKey::Id(id.to_owned()));
    }
    token
        .strip_prefix("req:")
        .map(|request_id| ItemKey::ClientRequest(request_id.to_owned()))
}

fn locate(items: &[TimelineItem], cursor: &PageCursor) -> Result<usize, TimelineError> {
    let token = cursor
        .token
        .as_deref()
        .ok_or_else(|| TimelineError::sync("missing_cursor", "page request without a token"))?;
    let key = decode_token(token).ok_or_else(|| {
        TimelineError::sync("invalid_cursor", format!("unrecognized cursor token: {token}"))
    })?;
    items
        .iter()
        .position(|item| item.matches_key(&key))
        .ok_or_else(|| TimelineError::sync("stale_cursor", format!("cursor no longer valid: {token}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline_core::TimelinePayload;

    fn conversation() -> ConversationInfo {
        ConversationInfo {
            conversation_id: "conv-1".into(),
            name: Some("general".into()),
            member_count: 3,
            unread_count: 2,
        }
    }

    fn history(count: i64) -> Vec<TimelineItem> {
        (1..=count)
            .map(|ts| TimelineItem::confirmed(format!("m{ts}"), "bob", ts, TimelinePayload::text("x")))
            .collect()
    }

    fn timestamps(items: &[TimelineItem]) -> Vec<i64> {
        items.iter().map(|item| item.created_at).collect()
    }

    #[tokio::test]
    async fn latest_window_pages_backwards_to_the_start() {
        let source = InMemoryEventSource::new(conversation());
        source.seed_history(history(7)).unwrap();

        let slice = source.fetch_authoritative(StartPoint::Latest, 3).await.unwrap();
        assert_eq!(timestamps(&slice.items), vec![5, 6, 7]);
        assert!(slice.cursors.has_older());
        assert!(!slice.cursors.has_newer());

        let page = source
            .fetch_older(&PageCursor {
                token: slice.cursors.older.token.clone(),
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(timestamps(&page.items), vec![2, 3, 4]);
        assert!(page.boundary.has_more);

        let last = source
            .fetch_older(&PageCursor {
                token: page.boundary.token.clone(),
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(timestamps(&last.items), vec![1]);
        assert!(!last.boundary.has_more);
    }

    #[tokio::test]
    async fn checkpoint_window_pages_forward() {
        let source = InMemoryEventSource::new(conversation());
        source.seed_history(history(10)).unwrap();

        let slice = source.fetch_authoritative(StartPoint::At(4), 2).await.unwrap();
        assert_eq!(timestamps(&slice.items), vec![3, 4, 5, 6]);
        assert!(slice.cursors.has_newer());

        let page = source
            .fetch_newer(&PageCursor {
                token: slice.cursors.newer.token.clone(),
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(timestamps(&page.items), vec![7, 8, 9, 10]);
        assert!(!page.boundary.has_more);
    }

    #[tokio::test]
    async fn cache_can_be_stale() {
        let source = InMemoryEventSource::new(conversation());
        source.seed_history(history(4)).unwrap();
        source.set_cache(history(2)).unwrap();

        let cache = source.fetch_cache(StartPoint::Latest, 10).await.unwrap();
        let server = source.fetch_authoritative(StartPoint::Latest, 10).await.unwrap();
        assert_eq!(cache.items.len(), 2);
        assert_eq!(server.items.len(), 4);
        assert_eq!(
            source.calls().unwrap(),
            vec![SourceOp::Cache, SourceOp::Authoritative]
        );
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let source = InMemoryEventSource::new(conversation());
        source
            .inject_failure(SourceOp::MarkRead, TimelineError::sync("network", "offline"))
            .unwrap();

        assert!(source.mark_read().await.is_err());
        source.mark_read().await.expect("second call should succeed");
        assert_eq!(source.read_receipts().unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_cursor_is_a_sync_error() {
        let source = InMemoryEventSource::new(conversation());
        source.seed_history(history(3)).unwrap();
        let err = source
            .fetch_older(&PageCursor {
                token: Some("id:gone".into()),
                limit: 5,
            })
            .await
            .expect_err("unknown cursor must fail");
        assert_eq!(err.code, "stale_cursor");
    }

    #[tokio::test]
    async fn small_outage_catches_up_and_large_outage_signals_gap() {
        let source = InMemoryEventSource::new(conversation()).with_gap_threshold(2);
        let mut subscription = source.subscribe(StartPoint::Latest).await.unwrap();

        source.go_offline().unwrap();
        source.publish_added(history(2)).await.unwrap();
        source.reconnect().await.unwrap();
        match subscription.next().await {
            Some(SourceEvent::Added(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected event: {other:?}"),
        }

        source.go_offline().unwrap();
        source.publish_added(history(3)).await.unwrap();
        source.reconnect().await.unwrap();
        assert_eq!(subscription.next().await, Some(SourceEvent::GapDetected));
    }

    #[tokio::test]
    async fn echo_replaces_pending_item_in_history() {
        let source = InMemoryEventSource::new(conversation());
        source.seed_history(history(2)).unwrap();

        let pending = TimelineItem::pending("req-1", "alice", 3, TimelinePayload::text("hi"));
        let echo = TimelineItem::confirmed("m3", "alice", 3, TimelinePayload::text("hi"))
            .with_client_request_id("req-1");
        source.publish_added(vec![pending]).await.unwrap();
        source.publish_added(vec![echo.clone()]).await.unwrap();

        let server = source.server_items().unwrap();
        assert_eq!(server.len(), 3);
        assert_eq!(server.last(), Some(&echo));
    }

    #[tokio::test]
    async fn closed_subscriptions_are_pruned() {
        let source = InMemoryEventSource::new(conversation());
        let subscription = source.subscribe(StartPoint::Latest).await.unwrap();
        assert_eq!(source.subscriber_count().unwrap(), 1);
        drop(subscription);
        assert_eq!(source.subscriber_count().unwrap(), 0);
    }
}
