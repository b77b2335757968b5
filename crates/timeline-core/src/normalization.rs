use crate::{
    error::{TimelineError, TimelineErrorKind},
    timeline::{TimelineMergeError, TimelineStore, validate_batch},
    types::{ControllerEvent, ItemKey, RemovalReason, TimelineItem},
};

/// Live `Added` batch split by how it should be applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedBatch {
    /// Server echoes of local items, applied with `replace`.
    pub replacements: Vec<TimelineItem>,
    /// New items, applied with `append_newer`.
    pub appends: Vec<TimelineItem>,
}

/// What a `Removed` event should do to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalPlan {
    /// Confirmed deletion of these items.
    Delete(Vec<ItemKey>),
    /// Drop these locally failed sends.
    DropFailedSends(Vec<ItemKey>),
    /// Leave the store alone.
    Ignore,
}

/// Split an `Added` batch into echoes of local items and genuinely new items.
///
/// An item is an echo when its client request ID is already in the store.
/// The batch is rejected as a whole when an item is keyless, or when the new
/// items are unsorted or start before the current tail, so that neither half
/// is applied on its own.
pub fn partition_added(
    store: &TimelineStore,
    items: Vec<TimelineItem>,
) -> Result<AddedBatch, TimelineMergeError> {
    if let Some(index) = items.iter().position(|item| !item.has_key()) {
        return Err(TimelineMergeError::Malformed { index });
    }

    let mut batch = AddedBatch::default();
    for item in items {
        let is_echo = item
            .client_request_id
            .as_deref()
            .is_some_and(|request_id| store.contains_client_request(request_id));
        if is_echo {
            batch.replacements.push(item);
        } else {
            batch.appends.push(item);
        }
    }

    validate_batch(&batch.appends)?;
    if let (Some(first), Some(latest)) = (batch.appends.first(), store.latest_created_at())
        && first.created_at < latest
    {
        return Err(TimelineMergeError::OutOfOrder {
            earliest: first.created_at,
            latest,
        });
    }
    Ok(batch)
}

/// Decide how a removal should be applied.
pub fn plan_removal(keys: Vec<ItemKey>, reason: RemovalReason) -> RemovalPlan {
    if keys.is_empty() {
        return RemovalPlan::Ignore;
    }
    match reason {
        RemovalReason::Confirmed => RemovalPlan::Delete(keys),
        RemovalReason::SendFailed => RemovalPlan::DropFailedSends(keys),
        RemovalReason::Other => RemovalPlan::Ignore,
    }
}

/// Normalize an error raised while loading from the event source.
///
/// Consistency errors keep their kind; everything else becomes a sync error.
pub fn normalize_load_error(error: TimelineError) -> TimelineError {
    match error.kind {
        TimelineErrorKind::Sync
        | TimelineErrorKind::InvalidOrder
        | TimelineErrorKind::Disposed => error,
        _ => TimelineError::sync(error.code, error.message),
    }
}

/// Convert an error into the presentation-facing notification.
pub fn error_event(error: TimelineError) -> ControllerEvent {
    ControllerEvent::Error(error)
}
