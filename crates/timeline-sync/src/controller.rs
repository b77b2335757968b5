//! Per-conversation sync controller runtime.
//!
//! A single task owns the [`TimelineStore`] and serializes commands, request
//! completions and live events with `tokio::select!`. Source requests run in
//! spawned tasks tagged with a generation number; completions from an older
//! generation are dropped.

use std::{
    future::Future,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use timeline_checkpoint::TimestampCheckpoint;
use timeline_core::{
    ControllerChannels, ControllerCommand, ControllerEvent, CursorPair, EventEmitter, EventStream,
    ItemKey,
    PageCursor, PageDirection, RemovalPlan, SendingStatus, SourceEvent, StartPoint, SyncState,
    SyncStateMachine, TimelineError, TimelineItem, TimelineMergeError, TimelinePage,
    TimelineSlice, TimelineStore, error_event, normalize_load_error, partition_added,
    plan_removal,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{EventSource, Subscription};

pub const DEFAULT_PAGE_SIZE: u16 = 30;
pub const MAX_PAGE_SIZE: u16 = 100;
const DEFAULT_COMMAND_BUFFER: usize = 64;
const DEFAULT_EVENT_BUFFER: usize = 256;
const COMPLETION_BUFFER: usize = 32;

/// Controller settings for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub conversation_id: String,
    /// Items requested per snapshot or page, within `1..=MAX_PAGE_SIZE`.
    pub page_size: u16,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Keep local pending items that a snapshot does not know about yet.
    pub preserve_pending: bool,
}

impl SyncConfig {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            page_size: DEFAULT_PAGE_SIZE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            preserve_pending: true,
        }
    }

    pub fn with_page_size(mut self, page_size: u16) -> Self {
        self.page_size = bounded_page_size(page_size);
        self
    }

    pub fn with_preserve_pending(mut self, preserve_pending: bool) -> Self {
        self.preserve_pending = preserve_pending;
        self
    }
}

/// Clamp a requested page size to what a single request may ask for.
pub fn bounded_page_size(requested: u16) -> u16 {
    requested.clamp(1, MAX_PAGE_SIZE)
}

/// Presentation-side handle to a running controller.
///
/// Commands are queued to the runtime; failures of the operations themselves
/// arrive as [`ControllerEvent::Error`]. Every call after `dispose` fails
/// with a disposed error.
#[derive(Clone, Debug)]
pub struct SyncControllerHandle {
    channels: ControllerChannels,
    disposed: Arc<AtomicBool>,
    conversation_id: Arc<str>,
}

impl SyncControllerHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub async fn load_initial(&self) -> Result<(), TimelineError> {
        self.send(ControllerCommand::LoadInitial).await
    }

    pub async fn load_older(&self) -> Result<(), TimelineError> {
        self.send(ControllerCommand::LoadOlder).await
    }

    pub async fn load_newer(&self) -> Result<(), TimelineError> {
        self.send(ControllerCommand::LoadNewer).await
    }

    pub async fn mark_read(&self) -> Result<(), TimelineError> {
        self.send(ControllerCommand::MarkRead).await
    }

    /// Tear the controller down. Only the first call succeeds.
    pub async fn dispose(&self) -> Result<(), TimelineError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(TimelineError::disposed("dispose"));
        }
        self.channels
            .send_command(ControllerCommand::Dispose)
            .await
            .map_err(|_| TimelineError::disposed("dispose"))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn send(&self, command: ControllerCommand) -> Result<(), TimelineError> {
        let action = command.name();
        if self.is_disposed() {
            return Err(TimelineError::disposed(action));
        }
        self.channels
            .send_command(command)
            .await
            .map_err(|_| TimelineError::disposed(action))
    }
}

/// Start a controller runtime on the current tokio runtime.
pub fn spawn_controller(
    source: Arc<dyn EventSource>,
    checkpoint: TimestampCheckpoint,
    config: SyncConfig,
) -> SyncControllerHandle {
    let (channels, command_rx) = ControllerChannels::new(config.command_buffer, config.event_buffer);
    let conversation_id: Arc<str> = Arc::from(config.conversation_id.as_str());
    let runtime = ControllerRuntime::new(source, checkpoint, config, channels.emitter());

    tokio::spawn(async move {
        runtime.run(command_rx).await;
    });

    SyncControllerHandle {
        channels,
        disposed: Arc::new(AtomicBool::new(false)),
        conversation_id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotStage {
    Cache,
    Authoritative,
}

enum Completion {
    Snapshot {
        generation: u64,
        stage: SnapshotStage,
        start: StartPoint,
        result: Result<TimelineSlice, TimelineError>,
    },
    Subscribed {
        generation: u64,
        result: Result<Subscription, TimelineError>,
    },
    Page {
        generation: u64,
        direction: PageDirection,
        result: Result<TimelinePage, TimelineError>,
    },
}

/// Bookkeeping for a running initial load or gap resynchronization.
struct InitialLoad {
    start: StartPoint,
    rollback: Vec<TimelineItem>,
}

struct ControllerRuntime {
    source: Arc<dyn EventSource>,
    checkpoint: TimestampCheckpoint,
    config: SyncConfig,
    events: EventEmitter,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    machine: SyncStateMachine,
    store: TimelineStore,
    cursors: CursorPair,
    subscription: Option<Subscription>,
    generation: u64,
    in_flight: CancellationToken,
    initial_load: Option<InitialLoad>,
}

impl ControllerRuntime {
    fn new(
        source: Arc<dyn EventSource>,
        checkpoint: TimestampCheckpoint,
        config: SyncConfig,
        events: EventEmitter,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_BUFFER);
        let mut store = TimelineStore::new(config.conversation_id.clone());
        let contents = events.clone();
        store.set_listener(Box::new(move |snapshot| {
            contents.emit(ControllerEvent::ContentsChanged(snapshot.clone()));
        }));

        Self {
            source,
            checkpoint,
            config,
            events,
            completion_tx,
            completion_rx,
            machine: SyncStateMachine::default(),
            store,
            cursors: CursorPair::default(),
            subscription: None,
            generation: 0,
            in_flight: CancellationToken::new(),
            initial_load: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ControllerCommand>) {
        debug!(conversation_id = %self.config.conversation_id, "controller runtime started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!(
                            conversation_id = %self.config.conversation_id,
                            "all handles dropped; shutting down"
                        );
                        self.dispose();
                        break;
                    }
                },
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                event = next_source_event(&mut self.subscription) => match event {
                    Some(event) => self.handle_source_event(event).await,
                    None => {
                        warn!(
                            conversation_id = %self.config.conversation_id,
                            "live subscription closed by source"
                        );
                        self.subscription = None;
                    }
                },
            }
        }
        debug!(conversation_id = %self.config.conversation_id, "controller runtime stopped");
    }

    fn handle_command(&mut self, command: ControllerCommand) -> ControlFlow<()> {
        debug!(
            conversation_id = %self.config.conversation_id,
            command = command.name(),
            state = ?self.machine.state(),
            "handling command"
        );
        match command {
            ControllerCommand::LoadInitial => self.load_initial(),
            ControllerCommand::LoadOlder => self.start_page(PageDirection::Older),
            ControllerCommand::LoadNewer => self.start_page(PageDirection::Newer),
            ControllerCommand::MarkRead => self.mark_read(),
            ControllerCommand::Dispose => {
                self.dispose();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Snapshot {
                generation,
                stage,
                start,
                result,
            } => self.on_snapshot(generation, stage, start, result).await,
            Completion::Subscribed { generation, result } => {
                self.on_subscribed(generation, result)
            }
            Completion::Page {
                generation,
                direction,
                result,
            } => self.on_page(generation, direction, result).await,
        }
    }

    fn load_initial(&mut self) {
        // Reconnecting reuses the initial-load transition internally only.
        if self.machine.state() == SyncState::Reconnecting {
            self.emit(error_event(TimelineError::invalid_state(
                SyncState::Reconnecting,
                "load_initial",
            )));
            return;
        }
        match self.machine.begin_initial_load() {
            Ok(events) => {
                self.emit_all(events);
                self.start_initial_load();
            }
            Err(err) => self.emit(error_event(err)),
        }
    }

    fn start_initial_load(&mut self) {
        let generation = self.begin_generation();
        self.initial_load = Some(InitialLoad {
            start: StartPoint::Latest,
            rollback: self.store.items().to_vec(),
        });
        info!(
            conversation_id = %self.config.conversation_id,
            generation,
            "starting initial load"
        );

        let source = Arc::clone(&self.source);
        let checkpoint = self.checkpoint.clone();
        let conversation_id = self.config.conversation_id.clone();
        let limit = self.config.page_size;
        self.spawn_request(
            async move {
                let last_seen = match checkpoint.last_seen(&conversation_id).await {
                    Ok(last_seen) => last_seen,
                    Err(err) => {
                        warn!(%conversation_id, error = %err, "checkpoint read failed");
                        None
                    }
                };
                let start = StartPoint::from_checkpoint(last_seen);
                (start, source.fetch_cache(start, limit).await)
            },
            move |(start, result)| Completion::Snapshot {
                generation,
                stage: SnapshotStage::Cache,
                start,
                result,
            },
        );
    }

    async fn on_snapshot(
        &mut self,
        generation: u64,
        stage: SnapshotStage,
        start: StartPoint,
        result: Result<TimelineSlice, TimelineError>,
    ) {
        if generation != self.generation || self.initial_load.is_none() {
            debug!(generation, current = self.generation, ?stage, "discarding stale snapshot");
            return;
        }

        let slice = match result {
            Ok(slice) => slice,
            Err(err) => {
                self.fail_initial_load(normalize_load_error(err));
                return;
            }
        };

        let count = slice.items.len();
        if let Err(err) = self.seed(slice.items) {
            self.fail_initial_load(err.into());
            return;
        }
        self.cursors = slice.cursors;
        debug!(
            conversation_id = %self.config.conversation_id,
            generation,
            ?stage,
            count,
            "seeded snapshot"
        );

        let source = Arc::clone(&self.source);
        match stage {
            SnapshotStage::Cache => {
                if let Some(load) = self.initial_load.as_mut() {
                    load.start = start;
                }
                let limit = self.config.page_size;
                self.spawn_request(
                    async move { source.fetch_authoritative(start, limit).await },
                    move |result| Completion::Snapshot {
                        generation,
                        stage: SnapshotStage::Authoritative,
                        start,
                        result,
                    },
                );
            }
            SnapshotStage::Authoritative => {
                self.record_checkpoint().await;
                self.spawn_request(
                    async move { source.subscribe(start).await },
                    move |result| Completion::Subscribed { generation, result },
                );
            }
        }
    }

    fn on_subscribed(&mut self, generation: u64, result: Result<Subscription, TimelineError>) {
        if generation != self.generation || self.initial_load.is_none() {
            debug!(generation, current = self.generation, "discarding stale subscription");
            return;
        }

        match result {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                let start = self.initial_load.take().map(|load| load.start);
                match self.machine.finish_initial_load(true) {
                    Ok(events) => self.emit_all(events),
                    Err(err) => self.emit(error_event(err)),
                }
                info!(
                    conversation_id = %self.config.conversation_id,
                    generation,
                    ?start,
                    items = self.store.len(),
                    "timeline ready"
                );
            }
            Err(err) => self.fail_initial_load(normalize_load_error(err)),
        }
    }

    fn fail_initial_load(&mut self, error: TimelineError) {
        warn!(
            conversation_id = %self.config.conversation_id,
            generation = self.generation,
            code = %error.code,
            error = %error,
            "initial load failed"
        );
        self.in_flight.cancel();
        self.close_subscription();
        if let Some(load) = self.initial_load.take() {
            self.store.rollback_to(load.rollback);
        }
        self.cursors.reset();

        match self.machine.finish_initial_load(false) {
            Ok(events) => self.emit_all(events),
            Err(err) => debug!(error = %err, "initial load already finished"),
        }
        self.emit(error_event(error));
    }

    fn start_page(&mut self, direction: PageDirection) {
        let boundary = self.cursors.boundary(direction).clone();
        if !boundary.has_more {
            debug!(?direction, "no more items in this direction");
            return;
        }

        match self.machine.begin_page(direction) {
            Ok(Some(events)) => self.emit_all(events),
            Ok(None) => {
                debug!(?direction, state = ?self.machine.state(), "page request skipped");
                return;
            }
            Err(err) => {
                self.emit(error_event(err));
                return;
            }
        }

        let generation = self.generation;
        let source = Arc::clone(&self.source);
        let cursor = PageCursor {
            token: boundary.token,
            limit: self.config.page_size,
        };
        self.spawn_request(
            async move {
                match direction {
                    PageDirection::Older => source.fetch_older(&cursor).await,
                    PageDirection::Newer => source.fetch_newer(&cursor).await,
                }
            },
            move |result| Completion::Page {
                generation,
                direction,
                result,
            },
        );
    }

    async fn on_page(
        &mut self,
        generation: u64,
        direction: PageDirection,
        result: Result<TimelinePage, TimelineError>,
    ) {
        if generation != self.generation || !self.machine.is_in_flight(direction) {
            debug!(generation, current = self.generation, ?direction, "discarding stale page");
            return;
        }

        match result {
            Ok(page) => {
                let count = page.items.len();
                match direction {
                    PageDirection::Older => {
                        let inserted = self.store.prepend_older(page.items);
                        debug!(count, inserted, "prepended older page");
                    }
                    PageDirection::Newer => self.append_newer(page.items, "page").await,
                }
                self.cursors.set_boundary(direction, page.boundary);
            }
            Err(err) => {
                warn!(?direction, error = %err, "page request failed");
                self.emit(error_event(normalize_load_error(err)));
            }
        }

        let events = self.machine.finish_page(direction);
        self.emit_all(events);
    }

    async fn append_newer(&mut self, items: Vec<TimelineItem>, origin: &'static str) {
        match self.store.append_newer(items) {
            Ok(0) => {}
            Ok(count) => {
                debug!(count, origin, "appended newer items");
                self.record_checkpoint().await;
            }
            Err(TimelineMergeError::OutOfOrder { earliest, latest }) => {
                warn!(earliest, latest, origin, "dropping out-of-order batch");
            }
            Err(err) => warn!(error = %err, origin, "dropping malformed batch"),
        }
    }

    async fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Added(items) => match partition_added(&self.store, items) {
                Ok(batch) => {
                    if !batch.replacements.is_empty() {
                        let replaced = self.store.replace(batch.replacements);
                        debug!(replaced, "applied local echoes");
                        if replaced > 0 && batch.appends.is_empty() {
                            self.record_checkpoint().await;
                        }
                    }
                    self.append_newer(batch.appends, "live").await;
                }
                Err(TimelineMergeError::OutOfOrder { earliest, latest }) => {
                    warn!(earliest, latest, "dropping out-of-order added event");
                }
                Err(err) => warn!(error = %err, "skipping malformed added event"),
            },
            SourceEvent::Updated(items) => {
                let replaced = self.store.replace(items);
                debug!(replaced, "applied live update");
            }
            SourceEvent::Removed { keys, reason } => match plan_removal(keys, reason) {
                RemovalPlan::Delete(keys) => {
                    let removed = self.store.remove(&keys);
                    debug!(removed, "applied live removal");
                }
                RemovalPlan::DropFailedSends(keys) => {
                    let failed: Vec<ItemKey> = keys
                        .into_iter()
                        .filter(|key| {
                            self.store.items().iter().any(|item| {
                                item.matches_key(key)
                                    && item.sending_status != SendingStatus::Succeeded
                            })
                        })
                        .collect();
                    let removed = self.store.remove(&failed);
                    warn!(removed, "dropping failed sends");
                }
                RemovalPlan::Ignore => debug!(?reason, "ignoring removal"),
            },
            SourceEvent::GapDetected => self.resynchronize(),
            SourceEvent::ChannelUpdated(info) => self.emit(ControllerEvent::ChannelUpdated(info)),
            SourceEvent::ChannelDeleted { conversation_id } => {
                if conversation_id != self.config.conversation_id {
                    debug!(%conversation_id, "ignoring deletion of another conversation");
                    return;
                }
                self.emit(ControllerEvent::ChannelDeleted { conversation_id });
            }
        }
    }

    fn resynchronize(&mut self) {
        let Some(events) = self.machine.on_gap_detected() else {
            debug!(state = ?self.machine.state(), "ignoring gap signal");
            return;
        };
        info!(
            conversation_id = %self.config.conversation_id,
            "gap detected; resynchronizing"
        );
        self.emit_all(events);
        self.close_subscription();
        self.cursors.reset();

        match self.machine.begin_initial_load() {
            Ok(events) => {
                self.emit_all(events);
                self.start_initial_load();
            }
            Err(err) => self.emit(error_event(err)),
        }
    }

    fn mark_read(&mut self) {
        if let Err(err) = self.machine.ensure_active("mark_read") {
            self.emit(error_event(err));
            return;
        }
        let source = Arc::clone(&self.source);
        let conversation_id = self.config.conversation_id.clone();
        tokio::spawn(async move {
            if let Err(err) = source.mark_read().await {
                warn!(%conversation_id, error = %err, "mark read failed");
            }
        });
    }

    fn dispose(&mut self) {
        self.begin_generation();
        self.in_flight.cancel();
        self.close_subscription();
        self.initial_load = None;
        self.store.clear_listener();
        match self.machine.dispose() {
            Ok(events) => self.emit_all(events),
            Err(err) => debug!(error = %err, "controller already disposed"),
        }
        info!(conversation_id = %self.config.conversation_id, "controller disposed");
    }

    async fn record_checkpoint(&mut self) {
        let Some(latest) = self.store.latest_created_at() else {
            return;
        };
        match self
            .checkpoint
            .update(&self.config.conversation_id, latest)
            .await
        {
            Ok(true) => debug!(latest, "checkpoint advanced"),
            Ok(false) => {}
            Err(err) => warn!(latest, error = %err, "checkpoint update failed"),
        }
    }

    fn seed(&mut self, items: Vec<TimelineItem>) -> Result<(), TimelineMergeError> {
        if self.config.preserve_pending {
            let preserved = self.store.seed_preserving_pending(items)?;
            if preserved > 0 {
                debug!(preserved, "kept pending items across snapshot");
            }
            Ok(())
        } else {
            self.store.seed(items)
        }
    }

    /// Invalidate outstanding requests and return the new generation.
    fn begin_generation(&mut self) -> u64 {
        self.in_flight.cancel();
        self.in_flight = CancellationToken::new();
        self.generation += 1;
        self.generation
    }

    fn close_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    fn spawn_request<T, Fut, Wrap>(&self, request: Fut, wrap: Wrap)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        Wrap: FnOnce(T) -> Completion + Send + 'static,
    {
        let cancel = self.in_flight.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                output = request => {
                    let _ = completions.send(wrap(output)).await;
                }
            }
        });
    }

    fn emit(&self, event: ControllerEvent) {
        self.events.emit(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ControllerEvent>) {
        self.events.emit_all(events);
    }
}

async fn next_source_event(subscription: &mut Option<Subscription>) -> Option<SourceEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
