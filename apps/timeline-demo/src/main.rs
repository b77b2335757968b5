mod config;
mod logging;

use std::{
    error::Error,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use config::DemoConfig;
use timeline_checkpoint::{FileCheckpointStore, TimestampCheckpoint};
use timeline_core::{
    ControllerEvent, ConversationInfo, EventStream, SyncState, TimelineItem, TimelinePayload,
};
use timeline_sync::{InMemoryEventSource, spawn_controller};
use tokio::{sync::broadcast, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STEP_TIMEOUT: Duration = Duration::from_secs(3);
const DEMO_SENDERS: [&str; 3] = ["alice", "bob", "carol"];
const LOCAL_USER: &str = "demo-user";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let config = DemoConfig::from_env()?;
    info!(
        conversation_id = %config.conversation_id,
        page_size = config.page_size,
        checkpoint = %config.checkpoint_path.display(),
        "starting timeline-demo"
    );

    let source = Arc::new(
        InMemoryEventSource::new(ConversationInfo {
            conversation_id: config.conversation_id.clone(),
            name: Some("Demo channel".to_owned()),
            member_count: DEMO_SENDERS.len() as u64 + 1,
            unread_count: 0,
        })
        .with_gap_threshold(config.gap_threshold),
    );
    source.seed_history(seed_history(config.seed_messages, now_millis()))?;

    let checkpoint = TimestampCheckpoint::new(Arc::new(FileCheckpointStore::new(
        config.checkpoint_path.clone(),
    )));
    resume_point(&checkpoint, &config.conversation_id).await;

    let handle = spawn_controller(source.clone(), checkpoint, config.sync_config());
    let mut events = handle.subscribe();

    handle.load_initial().await?;
    if !wait_for_state(&mut events, SyncState::Ready).await {
        warn!("initial load did not complete");
        handle.dispose().await?;
        return Ok(());
    }

    handle.load_older().await?;
    wait_for_state(&mut events, SyncState::Ready).await;
    handle.load_newer().await?;
    wait_for_state(&mut events, SyncState::Ready).await;

    // Optimistic send followed by the server echo.
    let request_id = Uuid::new_v4().to_string();
    source
        .publish_added(vec![TimelineItem::pending(
            &request_id,
            LOCAL_USER,
            now_millis(),
            TimelinePayload::text("hello from the demo"),
        )])
        .await?;
    let echo = TimelineItem::confirmed(
        format!("srv-{}", Uuid::new_v4()),
        LOCAL_USER,
        now_millis(),
        TimelinePayload::text("hello from the demo"),
    )
    .with_client_request_id(&request_id);
    source.publish_added(vec![echo]).await?;
    handle.mark_read().await?;

    // Miss more events than the source can replay to force a resynchronization.
    source.go_offline()?;
    let base = now_millis();
    let missed: Vec<TimelineItem> = (0..=config.gap_threshold)
        .map(|offset| {
            TimelineItem::confirmed(
                format!("srv-{}", Uuid::new_v4()),
                DEMO_SENDERS[offset % DEMO_SENDERS.len()],
                base + offset as i64,
                TimelinePayload::text(format!("missed message {offset}")),
            )
        })
        .collect();
    source.publish_added(missed).await?;
    source.reconnect().await?;
    if wait_for_state(&mut events, SyncState::Reconnecting).await {
        wait_for_state(&mut events, SyncState::Ready).await;
    }

    handle.dispose().await?;
    wait_for_state(&mut events, SyncState::Disposed).await;
    info!(
        server_items = source.server_items()?.len(),
        read_receipts = source.read_receipts()?,
        "timeline-demo finished"
    );
    Ok(())
}

/// Log where the controller will resume from. Read failures fall back to the latest page.
async fn resume_point(checkpoint: &TimestampCheckpoint, conversation_id: &str) -> Option<i64> {
    match checkpoint.last_seen(conversation_id).await {
        Ok(Some(last_seen)) => {
            info!(last_seen, "resuming from checkpoint");
            Some(last_seen)
        }
        Ok(None) => {
            debug!("no checkpoint; starting from latest");
            None
        }
        Err(err) => {
            warn!(%conversation_id, error = %err, "checkpoint read failed");
            None
        }
    }
}

/// Log events until the controller reports `target`. Returns `false` on timeout.
async fn wait_for_state(events: &mut EventStream, target: SyncState) -> bool {
    loop {
        match timeout(STEP_TIMEOUT, events.recv()).await {
            Ok(Ok(event)) => {
                log_event(&event);
                if event == (ControllerEvent::StateChanged { state: target }) {
                    return true;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(skipped, "event stream lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return false,
            Err(_) => {
                debug!(?target, "no state change before timeout");
                return false;
            }
        }
    }
}

fn log_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::StateChanged { state } => info!(?state, "state changed"),
        ControllerEvent::ContentsChanged(snapshot) => info!(
            items = snapshot.items.len(),
            first = ?snapshot.items.first().map(|item| item.created_at),
            last = ?snapshot.items.last().map(|item| item.created_at),
            "contents changed"
        ),
        ControllerEvent::ChannelUpdated(info) => info!(?info, "channel updated"),
        ControllerEvent::ChannelDeleted { conversation_id } => {
            info!(%conversation_id, "channel deleted")
        }
        ControllerEvent::Error(err) => warn!(code = %err.code, error = %err, "controller error"),
    }
}

fn seed_history(count: usize, now: i64) -> Vec<TimelineItem> {
    (0..count)
        .map(|index| {
            let age = (count - index) as i64 * 1_000;
            TimelineItem::confirmed(
                format!("seed-{index}"),
                DEMO_SENDERS[index % DEMO_SENDERS.len()],
                now - age,
                TimelinePayload::text(format!("message {index}")),
            )
        })
        .collect()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[tokio::test]
    async fn resume_point_reads_recorded_checkpoint() {
        let checkpoint = TimestampCheckpoint::in_memory();
        assert_eq!(resume_point(&checkpoint, "demo").await, None);

        checkpoint.update("demo", 42).await.expect("update");
        assert_eq!(resume_point(&checkpoint, "demo").await, Some(42));
    }

    #[tokio::test]
    async fn resume_point_falls_back_on_unreadable_checkpoint() {
        let dir = env::temp_dir().join(format!("timeline-demo-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("checkpoints.json");
        std::fs::write(&path, b"not json").expect("write corrupt document");

        let checkpoint = TimestampCheckpoint::new(Arc::new(FileCheckpointStore::new(&path)));
        assert!(checkpoint.last_seen("demo").await.is_err());
        assert_eq!(resume_point(&checkpoint, "demo").await, None);

        let _ = std::fs::remove_dir_all(dir);
    }
}
