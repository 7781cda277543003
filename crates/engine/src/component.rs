//! Client-facing component handle.
//!
//! `Component` validates every call against the published snapshot, then
//! posts a message to the worker. State-changing and allocation calls wait
//! on a per-call reply channel until the worker has handled that exact
//! request; buffer submissions return as soon as the buffer is queued and
//! come back later through the callbacks.
//!
//! Calls made from inside a callback run on the worker thread. Commands and
//! frees made from there are queued without waiting for a reply; calls that
//! need a result (allocation, probe) are refused with `InvalidState`.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use venc_common::{
    ComponentState, EngineConfig, EngineError, EngineResult, HeapAllocator, InputMode,
    MemoryAllocator, PortIndex, SharedMemory,
};
use venc_device::{DeviceAdapter, DeviceSettings};

use crate::buffer::BufferDescriptor;
use crate::callbacks::{Command, ComponentCallbacks};
use crate::dispatch::{Dispatcher, Message, Reply};
use crate::error::SubmitError;
use crate::event_thread::EventThread;
use crate::ports::{PortDefinition, PortState};
use crate::shared::{Shared, Snapshot};
use crate::state::PendingFlags;
use crate::stats::ComponentStats;
use crate::worker::{Worker, WorkerParts};

/// A running encoder component: one worker thread, one device event thread.
pub struct Component {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    events: Option<EventThread>,
}

impl Component {
    /// Open `device` for `config` and start the component in `Loaded`,
    /// allocating buffer memory from the process heap.
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn DeviceAdapter>,
        callbacks: Box<dyn ComponentCallbacks>,
    ) -> EngineResult<Self> {
        Self::with_allocator(config, device, Arc::new(HeapAllocator::new()), callbacks)
    }

    pub fn with_allocator(
        config: EngineConfig,
        device: Arc<dyn DeviceAdapter>,
        allocator: Arc<dyn MemoryAllocator>,
        callbacks: Box<dyn ComponentCallbacks>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let ports = match open_device(&config, device.as_ref()) {
            Ok(ports) => ports,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };
        info!(
            codec = config.codec.display_name(),
            width = config.frame.width,
            height = config.frame.height,
            input_mode = ?config.input_mode,
            input_buffers = ports[0].actual_count,
            output_buffers = ports[1].actual_count,
            "Creating encoder component"
        );

        let dispatcher = Arc::new(Dispatcher::new());
        let shared = Arc::new(Shared::default());
        let worker = Worker::new(WorkerParts {
            input_mode: config.input_mode,
            dispatcher: Arc::clone(&dispatcher),
            shared: Arc::clone(&shared),
            device: Arc::clone(&device),
            allocator,
            callbacks,
            ports,
        })
        .spawn()?;

        let mut component = Self {
            config,
            dispatcher,
            shared,
            worker: Some(worker),
            events: None,
        };
        component.events = Some(EventThread::spawn(
            device,
            Arc::clone(&component.dispatcher),
            component.config.event_poll_interval(),
        )?);
        Ok(component)
    }

    // ── Queries ──

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> ComponentState {
        self.shared.state()
    }

    pub fn pending(&self) -> PendingFlags {
        self.shared.snapshot().pending
    }

    pub fn port_definition(&self, port: PortIndex) -> PortDefinition {
        self.shared.snapshot().port(port).clone()
    }

    pub fn stats(&self) -> ComponentStats {
        self.shared.snapshot().stats
    }

    /// Consistent view of state, ports and statistics.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot()
    }

    // ── Commands ──

    /// Validate and hand `command` to the worker. Returns once the worker
    /// has accepted or refused it; completion arrives as a
    /// `CommandComplete` event.
    pub fn send_command(&self, command: Command) -> EngineResult<()> {
        if let Command::MarkBuffer(port, _) = command {
            if port != PortIndex::Input {
                return Err(EngineError::BadPortIndex);
            }
        }
        self.ensure_valid()?;
        if self.shared.on_worker_thread() {
            debug!(?command, "Command queued from a callback");
            return self.post(Message::Command {
                command,
                reply: None,
            });
        }
        self.call(|reply| Message::Command {
            command,
            reply: Some(reply),
        })
    }

    // ── Buffer management ──

    /// Set the actual buffer count of `port`. Only while `Loaded` or with
    /// the port disabled, and before any buffer is allocated on it.
    pub fn set_buffer_count(&self, port: PortIndex, count: u32) -> EngineResult<()> {
        self.ensure_valid()?;
        self.call(|reply| Message::SetBufferCount { port, count, reply })
    }

    /// Allocate one buffer of at least the port's buffer size, backed by
    /// component-owned memory.
    pub fn allocate_buffer(&self, port: PortIndex, size: usize) -> EngineResult<BufferDescriptor> {
        self.ensure_valid()?;
        self.call(|reply| Message::Allocate {
            port,
            size,
            memory: None,
            reply,
        })
    }

    /// Wrap client-owned `memory` as a buffer of `port`.
    pub fn use_existing_buffer(
        &self,
        port: PortIndex,
        size: usize,
        memory: SharedMemory,
    ) -> EngineResult<BufferDescriptor> {
        self.ensure_valid()?;
        self.call(|reply| Message::Allocate {
            port,
            size,
            memory: Some(memory),
            reply,
        })
    }

    /// Allocate every buffer of `port` at its configured size. On failure
    /// the buffers allocated so far are freed again.
    pub fn allocate_port_buffers(&self, port: PortIndex) -> EngineResult<Vec<BufferDescriptor>> {
        let definition = self.port_definition(port);
        let mut buffers = Vec::with_capacity(definition.actual_count as usize);
        for _ in 0..definition.actual_count {
            match self.allocate_buffer(port, definition.buffer_size) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    warn!(%port, allocated = buffers.len(), error = %e, "Port allocation failed; rolling back");
                    for buffer in buffers {
                        if let Err(free_err) = self.free_buffer(port, buffer) {
                            warn!(%port, error = %free_err, "Rollback free failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// Free a buffer the client owns.
    pub fn free_buffer(&self, port: PortIndex, buffer: BufferDescriptor) -> EngineResult<()> {
        if buffer.port() != port {
            return Err(EngineError::BadPortIndex);
        }
        if self.shared.on_worker_thread() {
            return self.post(Message::Free {
                buffer,
                reply: None,
            });
        }
        self.call(|reply| Message::Free {
            buffer,
            reply: Some(reply),
        })
    }

    // ── Buffer exchange ──

    /// Queue a filled input buffer for encoding. It comes back through
    /// `on_input_returned`.
    pub fn submit_input(&self, buffer: BufferDescriptor) -> Result<(), SubmitError> {
        let buffer = self.check_submission(PortIndex::Input, buffer)?;
        self.post_buffer(Message::SubmitInput(buffer))
    }

    /// Queue an empty output buffer. It comes back filled through
    /// `on_output_filled`.
    pub fn submit_output(&self, buffer: BufferDescriptor) -> Result<(), SubmitError> {
        let buffer = self.check_submission(PortIndex::Output, buffer)?;
        self.post_buffer(Message::SubmitOutput(buffer))
    }

    fn check_submission(
        &self,
        port: PortIndex,
        buffer: BufferDescriptor,
    ) -> Result<BufferDescriptor, SubmitError> {
        let refuse = |error: EngineError, buffer: BufferDescriptor| SubmitError { error, buffer };
        if buffer.port() != port {
            return Err(refuse(EngineError::BadPortIndex, buffer));
        }
        if !buffer.payload_in_bounds() {
            let reason = format!(
                "payload {}+{} exceeds the {}-byte buffer",
                buffer.offset,
                buffer.filled_len,
                buffer.alloc_len()
            );
            return Err(refuse(EngineError::BadParameter(reason), buffer));
        }
        let snapshot = self.shared.snapshot();
        let definition = snapshot.port(port);
        if !snapshot.state.is_streaming() || !definition.enabled || definition.pending_enable {
            return Err(refuse(EngineError::InvalidState, buffer));
        }
        // Staged payloads must fit a staging buffer, which is one port buffer.
        let staged = port == PortIndex::Input && self.config.input_mode == InputMode::Staged;
        if staged && buffer.filled_len > definition.buffer_size {
            let reason = format!(
                "payload of {} bytes exceeds the {}-byte staging buffer",
                buffer.filled_len, definition.buffer_size
            );
            return Err(refuse(EngineError::BadParameter(reason), buffer));
        }
        Ok(buffer)
    }

    fn post_buffer(&self, message: Message) -> Result<(), SubmitError> {
        match self.dispatcher.post(message) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.into_buffer() {
                Some(buffer) => Err(SubmitError {
                    error: EngineError::InvalidState,
                    buffer,
                }),
                None => Ok(()),
            },
        }
    }

    // ── Codec header ──

    /// Start the device just long enough to read the codec configuration
    /// header (e.g. SPS/PPS), then stop it again. `Loaded` only; waits at
    /// most `probe_timeout_ms`.
    pub fn probe_codec_header(&self) -> EngineResult<Vec<u8>> {
        if self.state() != ComponentState::Loaded || self.shared.on_worker_thread() {
            return Err(EngineError::InvalidState);
        }
        let (tx, rx) = channel::bounded(1);
        self.post(Message::ProbeCodecHeader {
            reply: Reply::new(tx),
        })?;
        let timeout = self.config.probe_timeout();
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "Codec header probe timed out");
                if self.dispatcher.post(Message::CancelProbe).is_err() {
                    debug!("Probe cancel not posted: component shut down");
                }
                Err(EngineError::Timeout(format!(
                    "codec header not available within {} ms",
                    timeout.as_millis()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::InvalidState),
        }
    }

    // ── Teardown ──

    /// Return every outstanding buffer, release the device and join both
    /// threads.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.shared.on_worker_thread() {
            error!("Component dropped from its own callback; worker not joined");
            let (tx, _rx) = channel::bounded(1);
            let _ = self.dispatcher.post(Message::Shutdown {
                reply: Reply::new(tx),
            });
            return;
        }

        let (tx, rx) = channel::bounded(1);
        if self
            .dispatcher
            .post(Message::Shutdown {
                reply: Reply::new(tx),
            })
            .is_ok()
        {
            let _ = rx.recv();
        }
        if worker.join().is_err() {
            error!("Worker thread panicked");
        }
        if let Some(mut events) = self.events.take() {
            events.stop_and_join();
        }
        info!("Encoder component shut down");
    }

    // ── Plumbing ──

    fn ensure_valid(&self) -> EngineResult<()> {
        if self.state() == ComponentState::Invalid {
            return Err(EngineError::InvalidState);
        }
        Ok(())
    }

    fn post(&self, message: Message) -> EngineResult<()> {
        self.dispatcher
            .post(message)
            .map_err(|_| EngineError::InvalidState)
    }

    /// Post a request and block until the worker answers it.
    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Message) -> EngineResult<T> {
        if self.shared.on_worker_thread() {
            return Err(EngineError::InvalidState);
        }
        let (tx, rx) = channel::bounded(1);
        self.post(build(Reply::new(tx)))?;
        rx.recv().map_err(|_| EngineError::InvalidState)?
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn open_device(config: &EngineConfig, device: &dyn DeviceAdapter) -> EngineResult<[PortState; 2]> {
    device.open(&config.codec)?;
    device.configure(&DeviceSettings {
        frame: config.frame.clone(),
        rate: config.rate,
    })?;
    let port = |port: PortIndex| -> EngineResult<PortState> {
        let overrides = match port {
            PortIndex::Input => &config.input,
            PortIndex::Output => &config.output,
        };
        PortState::from_requirements(
            port,
            device.buffer_requirements(port)?,
            overrides.buffer_count,
        )
    };
    Ok([port(PortIndex::Input)?, port(PortIndex::Output)?])
}
