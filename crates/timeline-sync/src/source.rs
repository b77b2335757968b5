//! Event source contract consumed by the sync controller.

use async_trait::async_trait;
use timeline_core::{
    PageCursor, SourceEvent, StartPoint, TimelineError, TimelinePage, TimelineSlice,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// External chat backend: snapshots, pagination, live events and read receipts.
///
/// Timeouts and retries are the implementation's business; the controller
/// treats every returned error as final for that request.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Best-effort local snapshot around `start`. May be stale.
    async fn fetch_cache(
        &self,
        start: StartPoint,
        limit: u16,
    ) -> Result<TimelineSlice, TimelineError>;

    /// Server snapshot around `start`. Supersedes the cache snapshot.
    async fn fetch_authoritative(
        &self,
        start: StartPoint,
        limit: u16,
    ) -> Result<TimelineSlice, TimelineError>;

    /// Page of items older than the cursor.
    async fn fetch_older(&self, cursor: &PageCursor) -> Result<TimelinePage, TimelineError>;

    /// Page of items newer than the cursor.
    async fn fetch_newer(&self, cursor: &PageCursor) -> Result<TimelinePage, TimelineError>;

    /// Open a live event stream.
    async fn subscribe(&self, start: StartPoint) -> Result<Subscription, TimelineError>;

    /// Mark the conversation as read.
    async fn mark_read(&self) -> Result<(), TimelineError>;
}

/// Receiving end of a live event stream.
///
/// Closing or dropping the subscription cancels it; the source side observes
/// this through [`SubscriptionPublisher::is_closed`].
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<SourceEvent>,
    cancel: CancellationToken,
}

/// Sending end held by the event source.
#[derive(Debug, Clone)]
pub struct SubscriptionPublisher {
    events: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a connected publisher/subscription pair.
    pub fn channel(buffer: usize) -> (SubscriptionPublisher, Subscription) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            SubscriptionPublisher {
                events: tx,
                cancel: cancel.clone(),
            },
            Subscription { events: rx, cancel },
        )
    }

    /// Next live event; `None` once closed from either side.
    pub async fn next(&mut self) -> Option<SourceEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Tear the subscription down.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionPublisher {
    /// Deliver an event. Returns `false` when the subscription is gone.
    pub async fn publish(&self, event: SourceEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// End the stream from the source side.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_events_in_order() {
        let (publisher, mut subscription) = Subscription::channel(4);
        assert!(publisher.publish(SourceEvent::GapDetected).await);
        assert!(
            publisher
                .publish(SourceEvent::ChannelDeleted {
                    conversation_id: "c".into()
                })
                .await
        );

        assert_eq!(subscription.next().await, Some(SourceEvent::GapDetected));
        assert!(matches!(
            subscription.next().await,
            Some(SourceEvent::ChannelDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn dropping_subscription_closes_publisher() {
        let (publisher, subscription) = Subscription::channel(4);
        drop(subscription);
        assert!(publisher.is_closed());
        assert!(!publisher.publish(SourceEvent::GapDetected).await);
    }

    #[tokio::test]
    async fn closing_from_source_ends_stream() {
        let (publisher, mut subscription) = Subscription::channel(4);
        publisher.close();
        assert_eq!(subscription.next().await, None);
        assert!(subscription.is_closed());
    }
}
