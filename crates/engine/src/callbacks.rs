//! Commands, events and the client callback interface.
//!
//! All callbacks are invoked on the worker thread, one at a time, in the
//! order the worker produced them.

use crossbeam::channel::{self, Receiver, Sender};

use venc_common::{BufferFlags, ComponentState, EngineError, MarkTag, PortIndex, PortScope};

use crate::buffer::BufferDescriptor;

/// Client command accepted by `Component::send_command`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetState(ComponentState),
    Flush(PortScope),
    DisablePort(PortScope),
    EnablePort(PortScope),
    /// Tag the stream; the tag comes back on the next filled output buffer.
    /// Valid on the input port only.
    MarkBuffer(PortIndex, MarkTag),
}

/// Command whose asynchronous completion is being reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletedCommand {
    StateSet(ComponentState),
    Flush(PortIndex),
    PortDisabled(PortIndex),
    PortEnabled(PortIndex),
    MarkBuffer(PortIndex),
}

/// Event delivered through `ComponentCallbacks::on_event`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentEvent {
    CommandComplete(CompletedCommand),
    /// Asynchronous error. `Hardware` is reported at most once per component.
    Error(EngineError),
    /// A filled output buffer carried `flags` (end of stream).
    BufferFlag { port: PortIndex, flags: BufferFlags },
    /// A buffer marked by `Command::MarkBuffer` left the component.
    Mark(MarkTag),
}

/// Receiver of everything the component reports to its client.
pub trait ComponentCallbacks: Send {
    fn on_event(&mut self, event: ComponentEvent);

    /// An input buffer is back with the client (consumed, flushed or rejected).
    fn on_input_returned(&mut self, buffer: BufferDescriptor);

    /// An output buffer is back with the client, filled or flushed.
    fn on_output_filled(&mut self, buffer: BufferDescriptor);
}

/// Everything a `ChannelCallbacks` forwards.
#[derive(Debug)]
pub enum Notification {
    Event(ComponentEvent),
    InputReturned(BufferDescriptor),
    OutputFilled(BufferDescriptor),
}

/// Callbacks that forward into a channel, for clients that prefer to drain
/// notifications on their own thread.
pub struct ChannelCallbacks {
    tx: Sender<Notification>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}

impl ComponentCallbacks for ChannelCallbacks {
    fn on_event(&mut self, event: ComponentEvent) {
        self.forward(Notification::Event(event));
    }

    fn on_input_returned(&mut self, buffer: BufferDescriptor) {
        self.forward(Notification::InputReturned(buffer));
    }

    fn on_output_filled(&mut self, buffer: BufferDescriptor) {
        self.forward(Notification::OutputFilled(buffer));
    }
}
