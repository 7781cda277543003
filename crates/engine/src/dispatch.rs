//! Three-lane message dispatcher feeding the worker thread.
//!
//! Client calls and device completions are posted as [`Message`]s into one
//! of three FIFO lanes. The worker always drains the highest-priority
//! non-empty lane first:
//!
//! 1. **Control**: commands, allocation, probes, device state notifications
//! 2. **Output**: output submissions, output completions, output flush-done
//! 3. **Input**: input submissions, input completions, input flush-done
//!
//! A port's flush-done travels in the same lane as that port's buffer
//! completions, so it can never overtake a buffer the device returned
//! before it. The lane mutex is held only to push or pop, never while a
//! message is handled.

use std::collections::VecDeque;
use std::fmt;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use venc_common::{BufferIndex, CompletionStatus, EngineError, PortIndex, SharedMemory};
use venc_device::{DeviceEvent, OutputCompletion};

use crate::buffer::BufferDescriptor;
use crate::callbacks::Command;

/// Priority lane of a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lane {
    Control,
    Output,
    Input,
}

impl Lane {
    pub fn of_port(port: PortIndex) -> Self {
        match port {
            PortIndex::Input => Self::Input,
            PortIndex::Output => Self::Output,
        }
    }
}

/// Per-call completion channel of a synchronous client call.
pub struct Reply<T>(Sender<Result<T, EngineError>>);

impl<T> Reply<T> {
    pub fn new(tx: Sender<Result<T, EngineError>>) -> Self {
        Self(tx)
    }

    pub fn send(self, result: Result<T, EngineError>) {
        if self.0.send(result).is_err() {
            // Caller stopped waiting (bounded wait elapsed).
            debug!("Reply dropped: caller no longer waiting");
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// Device state notifications (control lane).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceNotice {
    StartDone,
    StopDone,
    PauseDone,
    ResumeDone,
    HardwareError(String),
}

/// Unit of work for the worker thread.
#[derive(Debug)]
pub enum Message {
    // ── Control lane ──
    Command {
        command: Command,
        reply: Option<Reply<()>>,
    },
    Allocate {
        port: PortIndex,
        size: usize,
        /// Client-provided memory (`use_existing_buffer`); `None` to allocate.
        memory: Option<SharedMemory>,
        reply: Reply<BufferDescriptor>,
    },
    Free {
        buffer: BufferDescriptor,
        reply: Option<Reply<()>>,
    },
    SetBufferCount {
        port: PortIndex,
        count: u32,
        reply: Reply<()>,
    },
    ProbeCodecHeader {
        reply: Reply<Vec<u8>>,
    },
    /// The probing caller stopped waiting.
    CancelProbe,
    Device(DeviceNotice),
    Shutdown {
        reply: Reply<()>,
    },

    // ── Port lanes ──
    SubmitInput(BufferDescriptor),
    SubmitOutput(BufferDescriptor),
    InputDone {
        index: BufferIndex,
        status: CompletionStatus,
    },
    OutputDone(OutputCompletion),
    FlushDone(PortIndex),
}

impl Message {
    pub fn lane(&self) -> Lane {
        match self {
            Self::SubmitInput(_) | Self::InputDone { .. } => Lane::Input,
            Self::SubmitOutput(_) | Self::OutputDone(_) => Lane::Output,
            Self::FlushDone(port) => Lane::of_port(*port),
            _ => Lane::Control,
        }
    }

    /// Buffer-done message from the device.
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::InputDone { .. } | Self::OutputDone(_))
    }

    /// Buffer carried by the message, if any.
    pub fn into_buffer(self) -> Option<BufferDescriptor> {
        match self {
            Self::SubmitInput(buffer) | Self::SubmitOutput(buffer) | Self::Free { buffer, .. } => {
                Some(buffer)
            }
            _ => None,
        }
    }

    /// Translate a device event. `Closed` has no message.
    pub fn from_device(event: DeviceEvent) -> Option<Self> {
        Some(match event {
            DeviceEvent::InputDone { index, status } => Self::InputDone { index, status },
            DeviceEvent::OutputDone(completion) => Self::OutputDone(completion),
            DeviceEvent::FlushDone(port) => Self::FlushDone(port),
            DeviceEvent::StartDone => Self::Device(DeviceNotice::StartDone),
            DeviceEvent::StopDone => Self::Device(DeviceNotice::StopDone),
            DeviceEvent::PauseDone => Self::Device(DeviceNotice::PauseDone),
            DeviceEvent::ResumeDone => Self::Device(DeviceNotice::ResumeDone),
            DeviceEvent::HardwareError(reason) => {
                Self::Device(DeviceNotice::HardwareError(reason))
            }
            DeviceEvent::Closed => return None,
        })
    }
}

#[derive(Default)]
struct Lanes {
    control: VecDeque<Message>,
    output: VecDeque<Message>,
    input: VecDeque<Message>,
    closed: bool,
}

impl Lanes {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<Message> {
        match lane {
            Lane::Control => &mut self.control,
            Lane::Output => &mut self.output,
            Lane::Input => &mut self.input,
        }
    }

    fn pop(&mut self) -> Option<Message> {
        self.control
            .pop_front()
            .or_else(|| self.output.pop_front())
            .or_else(|| self.input.pop_front())
    }
}

/// Lane depths, for diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LaneDepths {
    pub control: usize,
    pub output: usize,
    pub input: usize,
}

/// Shared by every producer and the single worker consumer.
#[derive(Default)]
pub struct Dispatcher {
    lanes: Mutex<Lanes>,
    wake: Condvar,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `message` on its lane and wake the worker. Hands the message
    /// back once the dispatcher is closed.
    pub fn post(&self, message: Message) -> Result<(), Message> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return Err(message);
        }
        let lane = message.lane();
        lanes.lane_mut(lane).push_back(message);
        drop(lanes);
        self.wake.notify_one();
        Ok(())
    }

    /// Highest-priority message, blocking until one arrives. `None` once
    /// closed.
    pub fn next(&self) -> Option<Message> {
        let mut lanes = self.lanes.lock();
        loop {
            if lanes.closed {
                return None;
            }
            if let Some(message) = lanes.pop() {
                return Some(message);
            }
            self.wake.wait(&mut lanes);
        }
    }

    pub fn try_next(&self) -> Option<Message> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return None;
        }
        lanes.pop()
    }

    /// Remove every queued message of `lane`, in FIFO order.
    pub fn drain_lane(&self, lane: Lane) -> Vec<Message> {
        self.lanes.lock().lane_mut(lane).drain(..).collect()
    }

    /// Remove queued buffer completions from both port lanes (output first),
    /// leaving every other message in place.
    pub fn take_completions(&self) -> Vec<Message> {
        let mut lanes = self.lanes.lock();
        let mut taken = Vec::new();
        for lane in [Lane::Output, Lane::Input] {
            let queue = lanes.lane_mut(lane);
            let mut kept = VecDeque::with_capacity(queue.len());
            for message in queue.drain(..) {
                if message.is_completion() {
                    taken.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            *queue = kept;
        }
        taken
    }

    /// Refuse further posts and hand back whatever was still queued,
    /// control lane first.
    pub fn close(&self) -> Vec<Message> {
        let mut lanes = self.lanes.lock();
        lanes.closed = true;
        let mut left: Vec<Message> = lanes.control.drain(..).collect();
        left.extend(lanes.output.drain(..));
        left.extend(lanes.input.drain(..));
        drop(lanes);
        self.wake.notify_all();
        left
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    pub fn depths(&self) -> LaneDepths {
        let lanes = self.lanes.lock();
        LaneDepths {
            control: lanes.control.len(),
            output: lanes.output.len(),
            input: lanes.input.len(),
        }
    }
}
