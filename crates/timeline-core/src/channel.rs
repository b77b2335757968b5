use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ControllerCommand, ControllerEvent};

/// Broadcast event stream type used by presentation subscribers.
pub type EventStream = broadcast::Receiver<ControllerEvent>;

/// Errors returned by controller channel operations.
#[derive(Debug, Error)]
pub enum ControllerChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Sending half of the event stream, held by the runtime and its contents listener.
///
/// Emission is best-effort; lagged subscribers are handled by `broadcast`.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl EventEmitter {
    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Emit several events in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = ControllerEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

/// Command/event channel pair shared by a controller runtime and its handles.
#[derive(Clone, Debug)]
pub struct ControllerChannels {
    command_tx: mpsc::Sender<ControllerCommand>,
    events: EventEmitter,
}

impl ControllerChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ControllerCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                events: EventEmitter { event_tx },
            },
            command_rx,
        )
    }

    /// Event emitter without the command side, so holders do not keep the
    /// command channel open.
    pub fn emitter(&self) -> EventEmitter {
        self.events.clone()
    }

    /// Subscribe to emitted controller events.
    pub fn subscribe(&self) -> EventStream {
        self.events.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(
        &self,
        command: ControllerCommand,
    ) -> Result<(), ControllerChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ControllerChannelError::CommandChannelClosed)
    }
}
