//! Shared fixture for the engine integration tests: a `Component` over a
//! `LoopbackDevice`, with every callback recorded through a channel.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use venc_common::{ComponentState, EngineConfig, PortIndex};
use venc_device::{LoopbackDevice, LoopbackOptions};
use venc_engine::{
    BufferDescriptor, ChannelCallbacks, Command, CompletedCommand, Component, ComponentEvent,
    Notification,
};

/// Upper bound on any single wait for a notification.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long the recorder waits before deciding nothing else is coming.
pub const QUIET: Duration = Duration::from_millis(150);

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub struct Recorder {
    rx: Receiver<Notification>,
}

impl Recorder {
    pub fn next(&self) -> Notification {
        match self.rx.recv_timeout(WAIT) {
            Ok(notification) => notification,
            Err(RecvTimeoutError::Timeout) => panic!("no notification within {WAIT:?}"),
            Err(RecvTimeoutError::Disconnected) => panic!("component callbacks dropped"),
        }
    }

    /// Every notification up to and including the first one `done` accepts.
    pub fn until(&self, mut done: impl FnMut(&Notification) -> bool) -> Vec<Notification> {
        let mut seen = Vec::new();
        loop {
            let notification = self.next();
            let finished = done(&notification);
            seen.push(notification);
            if finished {
                return seen;
            }
        }
    }

    pub fn until_event(&self, expected: &ComponentEvent) -> Vec<Notification> {
        self.until(|n| matches!(n, Notification::Event(e) if e == expected))
    }

    /// Collect `count` returned input buffers, plus whatever arrived in
    /// between.
    pub fn until_inputs(&self, count: usize) -> Vec<Notification> {
        let mut left = count;
        self.until(|n| {
            if matches!(n, Notification::InputReturned(_)) {
                left -= 1;
            }
            left == 0
        })
    }

    pub fn until_outputs(&self, count: usize) -> Vec<Notification> {
        let mut left = count;
        self.until(|n| {
            if matches!(n, Notification::OutputFilled(_)) {
                left -= 1;
            }
            left == 0
        })
    }

    /// Wait until at least `inputs` returned inputs and `outputs` filled
    /// outputs have arrived, in any interleaving.
    pub fn until_buffers(&self, inputs: usize, outputs: usize) -> Vec<Notification> {
        if inputs == 0 && outputs == 0 {
            return Vec::new();
        }
        let (mut seen_inputs, mut seen_outputs) = (0, 0);
        self.until(|n| {
            match n {
                Notification::InputReturned(_) => seen_inputs += 1,
                Notification::OutputFilled(_) => seen_outputs += 1,
                Notification::Event(_) => {}
            }
            seen_inputs >= inputs && seen_outputs >= outputs
        })
    }

    /// Everything that arrives until the component has been quiet for
    /// `QUIET`.
    pub fn settle(&self) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(notification) = self.rx.recv_timeout(QUIET) {
            seen.push(notification);
        }
        seen
    }

    /// Everything left once the component has shut down.
    pub fn remaining(&self) -> Vec<Notification> {
        self.rx.try_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Notification helpers
// ---------------------------------------------------------------------------

pub fn events(notifications: &[Notification]) -> Vec<ComponentEvent> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::Event(e) => Some(e.clone()),
            _ => None,
        })
        .collect()
}

/// Split into (events, returned inputs, filled outputs), each in arrival
/// order.
pub fn split(
    notifications: Vec<Notification>,
) -> (Vec<ComponentEvent>, Vec<BufferDescriptor>, Vec<BufferDescriptor>) {
    let mut events = Vec::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for n in notifications {
        match n {
            Notification::Event(e) => events.push(e),
            Notification::InputReturned(b) => inputs.push(b),
            Notification::OutputFilled(b) => outputs.push(b),
        }
    }
    (events, inputs, outputs)
}

pub fn state_set(state: ComponentState) -> ComponentEvent {
    ComponentEvent::CommandComplete(CompletedCommand::StateSet(state))
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub fn test_config() -> EngineConfig {
    EngineConfig {
        event_poll_ms: 10,
        probe_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub component: Component,
    pub device: Arc<LoopbackDevice>,
    pub rec: Recorder,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(test_config(), LoopbackOptions::default())
    }

    pub fn with(config: EngineConfig, options: LoopbackOptions) -> Self {
        venc_common::logging::init("warn");
        let device = Arc::new(LoopbackDevice::new(options));
        let (callbacks, rx) = ChannelCallbacks::new();
        let component = Component::new(config, device.clone(), Box::new(callbacks))
            .expect("component creation");
        Self {
            component,
            device,
            rec: Recorder { rx },
        }
    }

    /// Request `state` and wait for its completion event.
    pub fn set_state(&self, state: ComponentState) -> Vec<Notification> {
        self.component
            .send_command(Command::SetState(state))
            .expect("state request accepted");
        self.rec.until_event(&state_set(state))
    }

    /// Loaded -> Idle with both ports fully allocated.
    pub fn to_idle(&self) -> (Vec<BufferDescriptor>, Vec<BufferDescriptor>) {
        self.component
            .send_command(Command::SetState(ComponentState::Idle))
            .expect("idle request accepted");
        let inputs = self
            .component
            .allocate_port_buffers(PortIndex::Input)
            .expect("input buffers");
        let outputs = self
            .component
            .allocate_port_buffers(PortIndex::Output)
            .expect("output buffers");
        self.rec.until_event(&state_set(ComponentState::Idle));
        (inputs, outputs)
    }

    /// Loaded -> Idle -> Executing.
    pub fn to_executing(&self) -> (Vec<BufferDescriptor>, Vec<BufferDescriptor>) {
        let buffers = self.to_idle();
        self.set_state(ComponentState::Executing);
        buffers
    }

    /// Executing/Paused -> Idle -> Loaded, freeing `buffers` plus any buffer
    /// returned on the way.
    pub fn unload(&self, buffers: Vec<BufferDescriptor>) {
        let (_, inputs, outputs) = split(self.set_state(ComponentState::Idle));
        self.component
            .send_command(Command::SetState(ComponentState::Loaded))
            .expect("loaded request accepted");
        for buffer in buffers.into_iter().chain(inputs).chain(outputs) {
            let port = buffer.port();
            self.component.free_buffer(port, buffer).expect("free");
        }
        self.rec.until_event(&state_set(ComponentState::Loaded));
    }
}

/// Poll `cond` until it holds, panicking after `WAIT`.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {WAIT:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Fill `buffer` with `data` and stamp it.
pub fn fill(buffer: &mut BufferDescriptor, data: &[u8], timestamp_us: i64) {
    buffer.write_payload(data).expect("payload fits");
    buffer.timestamp = venc_common::Timestamp(timestamp_us);
}
