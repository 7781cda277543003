//! Worker thread: the single owner of component state.
//!
//! The worker pops messages from the [`Dispatcher`] in priority order and is
//! the only code that mutates the state machine, the port pools, the flush
//! controller and the staging buffers. It is also the only thread that
//! invokes client callbacks, so the client sees events and buffer returns in
//! exactly the order the worker produced them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use venc_common::{
    BufferFlags, BufferIndex, CompletionStatus, ComponentState, EngineError, EngineResult,
    InputMode, MarkTag, MemoryAllocator, PortIndex, PortScope, SharedMemory,
};
use venc_device::{DeviceAdapter, InputFrame, OutputCompletion};

use crate::buffer::BufferDescriptor;
use crate::callbacks::{Command, CompletedCommand, ComponentCallbacks, ComponentEvent};
use crate::dispatch::{DeviceNotice, Dispatcher, Message, Reply};
use crate::flush::FlushController;
use crate::pool::BufferPool;
use crate::ports::{PortDefinition, PortState};
use crate::shared::{Shared, Snapshot};
use crate::staging::StagingPool;
use crate::state::{PendingFlags, StateMachine, TransitionPlan};
use crate::stats::ComponentStats;

/// Codec-header probe waiting for the device to start and stop.
struct PendingProbe {
    reply: Reply<Vec<u8>>,
    header: Option<EngineResult<Vec<u8>>>,
}

/// Everything the worker needs, assembled by `Component`.
pub struct WorkerParts {
    pub input_mode: InputMode,
    pub dispatcher: Arc<Dispatcher>,
    pub shared: Arc<Shared>,
    pub device: Arc<dyn DeviceAdapter>,
    pub allocator: Arc<dyn MemoryAllocator>,
    pub callbacks: Box<dyn ComponentCallbacks>,
    pub ports: [PortState; 2],
}

pub struct Worker {
    pub(crate) input_mode: InputMode,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) device: Arc<dyn DeviceAdapter>,
    pub(crate) allocator: Arc<dyn MemoryAllocator>,
    callbacks: Box<dyn ComponentCallbacks>,
    pub(crate) machine: StateMachine,
    pub(crate) ports: [PortState; 2],
    pub(crate) pools: [BufferPool; 2],
    pub(crate) flush: FlushController,
    pub(crate) staging: StagingPool,
    marks: VecDeque<MarkTag>,
    probe: Option<PendingProbe>,
    /// Device stop issued for a pending Idle transition.
    pub(crate) stop_requested: bool,
    pub(crate) stats: ComponentStats,
    finished: bool,
}

impl Worker {
    pub fn new(parts: WorkerParts) -> Self {
        Self {
            input_mode: parts.input_mode,
            dispatcher: parts.dispatcher,
            shared: parts.shared,
            device: parts.device,
            allocator: parts.allocator,
            callbacks: parts.callbacks,
            machine: StateMachine::new(),
            ports: parts.ports,
            pools: [
                BufferPool::new(PortIndex::Input),
                BufferPool::new(PortIndex::Output),
            ],
            flush: FlushController::new(),
            staging: StagingPool::new(),
            marks: VecDeque::new(),
            probe: None,
            stop_requested: false,
            stats: ComponentStats::default(),
            finished: false,
        }
    }

    pub fn spawn(self) -> EngineResult<JoinHandle<()>> {
        self.publish();
        thread::Builder::new()
            .name("venc-worker".into())
            .spawn(move || self.run())
            .map_err(|e| {
                EngineError::InsufficientResources(format!("failed to spawn worker thread: {e}"))
            })
    }

    fn run(mut self) {
        self.shared.register_worker();
        info!("Worker thread started");
        while let Some(message) = self.dispatcher.next() {
            self.handle(message);
            self.publish();
            if self.finished {
                break;
            }
        }
        info!(
            inputs = self.stats.inputs_submitted,
            outputs = self.stats.outputs_returned,
            bytes = self.stats.output_bytes,
            "Worker thread exiting"
        );
    }

    pub(crate) fn handle(&mut self, message: Message) {
        match message {
            Message::Command { command, reply } => {
                let result = self.handle_command(command);
                self.publish();
                match reply {
                    Some(reply) => reply.send(result),
                    None => {
                        if let Err(e) = result {
                            warn!(?command, error = %e, "Command rejected");
                        }
                    }
                }
            }
            Message::Allocate {
                port,
                size,
                memory,
                reply,
            } => {
                let result = self.allocate(port, size, memory);
                let allocated = result.is_ok();
                self.publish();
                reply.send(result);
                if allocated {
                    self.after_allocation(port);
                }
            }
            Message::Free { buffer, reply } => {
                let port = buffer.port();
                let result = self.free(buffer);
                let freed = result.is_ok();
                self.publish();
                match reply {
                    Some(reply) => reply.send(result),
                    None => {
                        if let Err(e) = result {
                            warn!(%port, error = %e, "Free rejected");
                        }
                    }
                }
                if freed {
                    self.after_release(port);
                }
            }
            Message::SetBufferCount { port, count, reply } => {
                let result = self.set_buffer_count(port, count);
                self.publish();
                reply.send(result);
            }
            Message::ProbeCodecHeader { reply } => self.begin_probe(reply),
            Message::CancelProbe => self.cancel_probe(),
            Message::Device(notice) => self.handle_device_notice(notice),
            Message::Shutdown { reply } => {
                self.teardown();
                reply.send(Ok(()));
                self.finished = true;
            }
            Message::SubmitInput(buffer) => self.submit_input(buffer),
            Message::SubmitOutput(buffer) => self.submit_output(buffer),
            Message::InputDone { index, status } => self.input_done(index, status),
            Message::OutputDone(completion) => self.output_done(completion),
            Message::FlushDone(port) => self.flush_done(port),
        }
    }

    // ── Callbacks ──

    // The snapshot is published before every callback so a client reacting
    // to a callback observes the state that produced it.
    pub(crate) fn emit(&mut self, event: ComponentEvent) {
        debug!(?event, "Event");
        self.publish();
        self.callbacks.on_event(event);
    }

    /// Hand a buffer back to the client.
    pub(crate) fn deliver(&mut self, mut buffer: BufferDescriptor, status: CompletionStatus) {
        buffer.set_status(status);
        match buffer.port() {
            PortIndex::Input => {
                self.stats.inputs_returned += 1;
                self.publish();
                self.callbacks.on_input_returned(buffer);
            }
            PortIndex::Output => {
                self.stats.outputs_returned += 1;
                self.publish();
                self.callbacks.on_output_filled(buffer);
            }
        }
    }

    fn commit_state(&mut self, state: ComponentState) {
        let from = self.machine.state();
        self.machine.commit(state);
        info!(%from, to = %state, "State transition complete");
        self.emit(ComponentEvent::CommandComplete(CompletedCommand::StateSet(state)));
    }

    /// One-shot component-wide error. Fatal errors also move the component
    /// to `Invalid`.
    pub(crate) fn report_error(&mut self, err: EngineError) {
        error!(error = %err, state = %self.machine.state(), "Component error");
        let fatal = err.is_fatal() && self.machine.state() != ComponentState::Invalid;
        if fatal {
            self.machine.commit(ComponentState::Invalid);
            self.flush.cancel_all();
        }
        if self.shared.raise_error() {
            self.emit(ComponentEvent::Error(err.clone()));
        } else {
            debug!("Error already reported once; not reporting again");
        }
        if fatal {
            self.finish_probe(Err(err));
        }
    }

    /// Report `err` if it is fatal; return it either way.
    pub(crate) fn escalate(&mut self, err: EngineError) -> EngineError {
        if err.is_fatal() {
            self.report_error(err.clone());
        }
        err
    }

    fn publish(&self) {
        let ports = PortIndex::ALL.map(|port| self.port_definition(port));
        self.shared.publish(Snapshot {
            state: self.machine.state(),
            pending: self.machine.pending(),
            ports,
            stats: self.stats.clone(),
        });
    }

    fn port_definition(&self, port: PortIndex) -> PortDefinition {
        let state = &self.ports[port.as_usize()];
        let pool = &self.pools[port.as_usize()];
        PortDefinition {
            port,
            enabled: state.enabled,
            populated: pool.is_populated(state.actual()),
            min_count: state.min_count,
            actual_count: state.actual_count,
            buffer_size: state.buffer_size,
            allocated: pool.allocated_count(),
            pending_enable: self.machine.is_pending(PendingFlags::enable(port)),
            pending_disable: self.machine.is_pending(PendingFlags::disable(port)),
        }
    }

    // ── Commands ──

    fn handle_command(&mut self, command: Command) -> EngineResult<()> {
        if self.machine.state() == ComponentState::Invalid {
            return Err(EngineError::InvalidState);
        }
        match command {
            Command::SetState(target) => self.request_state(target),
            Command::Flush(scope) => self.flush_command(scope),
            Command::DisablePort(scope) => {
                for &port in scope.ports() {
                    self.disable_port(port)?;
                }
                Ok(())
            }
            Command::EnablePort(scope) => {
                for &port in scope.ports() {
                    self.enable_port(port);
                }
                Ok(())
            }
            Command::MarkBuffer(port, tag) => {
                if port != PortIndex::Input {
                    return Err(EngineError::BadPortIndex);
                }
                self.marks.push_back(tag);
                self.emit(ComponentEvent::CommandComplete(CompletedCommand::MarkBuffer(port)));
                Ok(())
            }
        }
    }

    fn request_state(&mut self, target: ComponentState) -> EngineResult<()> {
        let plan = self.machine.plan(target)?;
        info!(from = %self.machine.state(), to = %target, ?plan, "State transition requested");

        match plan {
            TransitionPlan::Complete => self.commit_state(target),
            TransitionPlan::AwaitPopulated => {
                if self.ready_for_idle() {
                    self.commit_state(ComponentState::Idle);
                } else {
                    debug!("Idle deferred until enabled ports are populated");
                    self.machine.set_pending(PendingFlags::IDLE);
                }
            }
            TransitionPlan::AwaitReleased => {
                if self.all_released() {
                    self.commit_state(ComponentState::Loaded);
                } else {
                    debug!("Loaded deferred until every buffer is freed");
                    self.machine.set_pending(PendingFlags::LOADING);
                }
            }
            TransitionPlan::StartDevice { then_pause } => {
                let flag = if then_pause {
                    PendingFlags::PAUSE
                } else {
                    PendingFlags::EXECUTE
                };
                self.machine.set_pending(flag);
                if let Err(e) = self.device.start() {
                    self.machine.clear_pending(flag);
                    return Err(self.escalate(e.into()));
                }
            }
            TransitionPlan::PauseDevice => {
                self.machine.set_pending(PendingFlags::PAUSE);
                if let Err(e) = self.device.pause() {
                    self.machine.clear_pending(PendingFlags::PAUSE);
                    return Err(self.escalate(e.into()));
                }
            }
            TransitionPlan::ResumeDevice => {
                self.machine.set_pending(PendingFlags::EXECUTE);
                if let Err(e) = self.device.resume() {
                    self.machine.clear_pending(PendingFlags::EXECUTE);
                    return Err(self.escalate(e.into()));
                }
            }
            TransitionPlan::FlushAndStop => {
                self.machine.set_pending(PendingFlags::IDLE);
                self.stop_requested = false;
                if let Err(e) = self.begin_flush(PortScope::Both) {
                    self.machine.clear_pending(PendingFlags::IDLE);
                    return Err(e);
                }
                self.maybe_stop_after_flush();
            }
        }
        Ok(())
    }

    fn ready_for_idle(&self) -> bool {
        PortIndex::ALL.iter().all(|&port| {
            let state = &self.ports[port.as_usize()];
            !state.enabled || self.pools[port.as_usize()].is_populated(state.actual())
        })
    }

    fn all_released(&self) -> bool {
        self.pools.iter().all(BufferPool::is_released)
    }

    fn disable_port(&mut self, port: PortIndex) -> EngineResult<()> {
        let i = port.as_usize();
        self.ports[i].enabled = false;
        self.machine.clear_pending(PendingFlags::enable(port));
        if self.pools[i].is_released() {
            info!(%port, "Port disabled");
            self.emit(ComponentEvent::CommandComplete(CompletedCommand::PortDisabled(port)));
            return Ok(());
        }
        self.machine.set_pending(PendingFlags::disable(port));
        if self.machine.state().is_streaming() {
            self.begin_flush(port.into())?;
        }
        debug!(%port, allocated = self.pools[i].allocated_count(), "Port disable waiting for buffers to be freed");
        Ok(())
    }

    fn enable_port(&mut self, port: PortIndex) {
        let i = port.as_usize();
        self.ports[i].enabled = true;
        let loaded = matches!(
            self.machine.state(),
            ComponentState::Loaded | ComponentState::WaitForResources
        ) && !self.machine.is_pending(PendingFlags::IDLE);
        if loaded || self.pools[i].is_populated(self.ports[i].actual()) {
            info!(%port, "Port enabled");
            self.emit(ComponentEvent::CommandComplete(CompletedCommand::PortEnabled(port)));
        } else {
            debug!(%port, "Port enable waiting for population");
            self.machine.set_pending(PendingFlags::enable(port));
        }
    }

    // ── Allocation ──

    fn set_buffer_count(&mut self, port: PortIndex, count: u32) -> EngineResult<()> {
        let i = port.as_usize();
        let configurable = matches!(
            self.machine.state(),
            ComponentState::Loaded | ComponentState::WaitForResources
        ) || !self.ports[i].enabled;
        if !configurable || self.pools[i].allocated_count() > 0 {
            return Err(EngineError::InvalidState);
        }
        if count < self.ports[i].min_count {
            return Err(EngineError::BadParameter(format!(
                "{port} port needs at least {} buffers, {count} requested",
                self.ports[i].min_count
            )));
        }
        self.ports[i].actual_count = count;
        debug!(%port, count, "Buffer count set");
        Ok(())
    }

    fn allocate(
        &mut self,
        port: PortIndex,
        size: usize,
        memory: Option<SharedMemory>,
    ) -> EngineResult<BufferDescriptor> {
        let i = port.as_usize();
        let state = self.machine.state();
        let allowed = matches!(state, ComponentState::Loaded | ComponentState::WaitForResources)
            || self.machine.is_pending(PendingFlags::enable(port));
        if !allowed {
            return Err(EngineError::InvalidState);
        }

        let buffer_size = self.ports[i].buffer_size;
        if size < buffer_size {
            return Err(EngineError::BadParameter(format!(
                "{port} buffers need {buffer_size} bytes, {size} requested"
            )));
        }
        if let Some(region) = &memory {
            if region.len() < size {
                return Err(EngineError::BadParameter(format!(
                    "memory of {} bytes is smaller than the requested {size}",
                    region.len()
                )));
            }
        }

        if self.pools[i].capacity() == 0 {
            self.pools[i].allocate_pool(self.ports[i].actual(), buffer_size)?;
        }
        let index = self.pools[i].acquire_slot()?;

        let (memory, from_allocator) = match memory {
            Some(region) => (region, false),
            None => match self.allocator.allocate(size) {
                Ok(region) => (region, true),
                Err(e) => {
                    self.rollback_slot(port, index);
                    return Err(e.into());
                }
            },
        };
        let undo_memory = |worker: &mut Self| {
            if from_allocator {
                worker.allocator.release(&memory);
            }
        };

        let register = port == PortIndex::Output || self.input_mode == InputMode::Registered;
        if register {
            if let Err(e) = self.device.register_buffer(port, index, &memory) {
                undo_memory(self);
                self.rollback_slot(port, index);
                return Err(EngineError::InsufficientResources(format!(
                    "device registration of {port} buffer {index} failed: {e}"
                )));
            }
        }

        if port == PortIndex::Input
            && self.input_mode == InputMode::Staged
            && !self.staging.is_allocated()
        {
            if let Err(e) = self.setup_staging() {
                undo_memory(self);
                self.rollback_slot(port, index);
                return Err(e);
            }
        }

        self.pools[i].attach(index, memory.clone(), from_allocator, register);
        debug!(%port, %index, size, from_allocator, "Buffer allocated");
        Ok(BufferDescriptor::new(port, index, memory, size))
    }

    fn rollback_slot(&mut self, port: PortIndex, index: BufferIndex) {
        let pool = &mut self.pools[port.as_usize()];
        if let Err(e) = pool.release_slot(index) {
            warn!(%port, %index, error = %e, "Rollback of a failed allocation");
        }
        pool.reset();
    }

    fn setup_staging(&mut self) -> EngineResult<()> {
        let port = &self.ports[PortIndex::Input.as_usize()];
        let (count, size) = (port.actual(), port.buffer_size);
        self.staging.allocate(count, size, self.allocator.as_ref())?;

        let regions: Vec<(BufferIndex, SharedMemory)> = self
            .staging
            .regions()
            .map(|(index, region)| (index, region.clone()))
            .collect();
        for (n, (index, region)) in regions.iter().enumerate() {
            if let Err(e) = self.device.register_buffer(PortIndex::Input, *index, region) {
                for (registered, _) in &regions[..n] {
                    let _ = self.device.unregister_buffer(PortIndex::Input, *registered);
                }
                self.staging.release(self.allocator.as_ref());
                return Err(EngineError::InsufficientResources(format!(
                    "device registration of staging buffer {index} failed: {e}"
                )));
            }
        }
        info!(count, size, "Staging buffers registered");
        Ok(())
    }

    fn teardown_staging(&mut self) {
        for (index, _) in self.staging.regions() {
            if let Err(e) = self.device.unregister_buffer(PortIndex::Input, index) {
                warn!(%index, error = %e, "Failed to unregister staging buffer");
            }
        }
        self.staging.release(self.allocator.as_ref());
        debug!("Staging buffers released");
    }

    fn free(&mut self, buffer: BufferDescriptor) -> EngineResult<()> {
        let port = buffer.port();
        let i = port.as_usize();
        let freed = self.pools[i].free(&buffer)?;
        if freed.registered {
            if let Err(e) = self.device.unregister_buffer(port, freed.index) {
                warn!(%port, index = %freed.index, error = %e, "Failed to unregister buffer");
            }
        }
        if freed.from_allocator {
            self.allocator.release(&freed.memory);
        }
        debug!(%port, index = %freed.index, "Buffer freed");

        if self.port_must_stay_populated(port) {
            warn!(%port, state = %self.machine.state(), "Buffer freed from a port that must stay populated");
            self.emit(ComponentEvent::Error(EngineError::PortUnpopulated(port)));
        }

        if self.pools[i].is_released() {
            self.pools[i].reset();
            if port == PortIndex::Input && self.staging.is_allocated() {
                self.teardown_staging();
            }
        }
        Ok(())
    }

    fn port_must_stay_populated(&self, port: PortIndex) -> bool {
        matches!(
            self.machine.state(),
            ComponentState::Idle | ComponentState::Executing | ComponentState::Paused
        ) && self.ports[port.as_usize()].enabled
            && !self
                .machine
                .is_pending(PendingFlags::disable(port) | PendingFlags::LOADING)
    }

    fn after_allocation(&mut self, port: PortIndex) {
        let i = port.as_usize();
        if self.pools[i].is_populated(self.ports[i].actual())
            && self.machine.clear_pending(PendingFlags::enable(port))
        {
            info!(%port, "Port enabled");
            self.emit(ComponentEvent::CommandComplete(CompletedCommand::PortEnabled(port)));
        }
        if self.machine.is_pending(PendingFlags::IDLE)
            && self.machine.state() == ComponentState::Loaded
            && self.ready_for_idle()
        {
            self.machine.clear_pending(PendingFlags::IDLE);
            self.commit_state(ComponentState::Idle);
        }
    }

    fn after_release(&mut self, port: PortIndex) {
        if self.pools[port.as_usize()].is_released()
            && self.machine.clear_pending(PendingFlags::disable(port))
        {
            info!(%port, "Port disabled");
            self.emit(ComponentEvent::CommandComplete(CompletedCommand::PortDisabled(port)));
        }
        if self.machine.is_pending(PendingFlags::LOADING) && self.all_released() {
            self.machine.clear_pending(PendingFlags::LOADING);
            self.commit_state(ComponentState::Loaded);
        }
    }

    // ── Buffer exchange ──

    /// Why a submission on `port` cannot be accepted right now.
    fn refusal(&self, port: PortIndex) -> Option<CompletionStatus> {
        if self.flush.is_flushing(port) {
            return Some(CompletionStatus::FlushInProgress);
        }
        let open = self.machine.state().is_streaming()
            && !self.machine.is_pending(
                PendingFlags::IDLE | PendingFlags::disable(port) | PendingFlags::enable(port),
            )
            && self.ports[port.as_usize()].enabled;
        (!open).then_some(CompletionStatus::Rejected)
    }

    fn submit_input(&mut self, mut buffer: BufferDescriptor) {
        self.stats.inputs_submitted += 1;
        if let Some(status) = self.refusal(PortIndex::Input) {
            debug!(index = %buffer.index(), ?status, "Input buffer refused");
            self.deliver(buffer, status);
            return;
        }
        if let Err(e) = self.pools[PortIndex::Input.as_usize()].accept(&buffer) {
            warn!(error = %e, "Input buffer refused");
            self.deliver(buffer, CompletionStatus::Rejected);
            return;
        }
        buffer.set_status(CompletionStatus::Ok);

        match self.input_mode {
            InputMode::Registered => self.queue_input(buffer),
            InputMode::Staged => {
                self.staging.push_backlog(buffer);
                self.pump_staging();
            }
        }
    }

    fn queue_input(&mut self, buffer: BufferDescriptor) {
        let index = buffer.index();
        let frame = InputFrame {
            index,
            offset: buffer.offset,
            filled_len: buffer.filled_len,
            timestamp: buffer.timestamp,
            flags: buffer.flags,
        };
        let pool = &mut self.pools[PortIndex::Input.as_usize()];
        match self.device.submit_input(frame) {
            Ok(()) => {
                if let Err(buffer) = pool.park_with_device(buffer) {
                    warn!(%index, "Input buffer could not be parked");
                    pool.hand_back(index);
                    self.deliver(buffer, CompletionStatus::Error);
                    return;
                }
                debug!(%index, len = frame.filled_len, eos = frame.flags.is_eos(), "Input queued to device");
            }
            Err(e) => {
                pool.hand_back(index);
                self.deliver(buffer, CompletionStatus::Error);
                let err = EngineError::from(e);
                if err.is_fatal() {
                    self.report_error(err);
                } else {
                    warn!(%index, error = %err, "Device refused input buffer");
                }
            }
        }
    }

    /// Move backlog buffers into free staging buffers.
    pub(crate) fn pump_staging(&mut self) {
        while self.staging.backlog_len() > 0 {
            let Some(slot) = self.staging.acquire() else {
                break;
            };
            let Some(buffer) = self.staging.pop_backlog() else {
                self.staging.complete(slot);
                break;
            };
            self.stage_input(slot, buffer);
        }
        if self.staging.backlog_len() > 0 {
            debug!(
                waiting = self.staging.backlog_len(),
                busy = self.staging.busy_count(),
                "Staged inputs waiting for a free staging buffer"
            );
        }
    }

    fn stage_input(&mut self, slot: BufferIndex, buffer: BufferDescriptor) {
        let index = buffer.index();
        let Some(region) = self.staging.memory(slot).cloned() else {
            self.staging.complete(slot);
            self.pools[PortIndex::Input.as_usize()].hand_back(index);
            self.deliver(buffer, CompletionStatus::Error);
            return;
        };

        if buffer.filled_len > region.len() {
            warn!(%index, len = buffer.filled_len, staging = region.len(), "Input payload larger than the staging buffer");
            self.staging.complete(slot);
            self.pools[PortIndex::Input.as_usize()].hand_back(index);
            self.deliver(buffer, CompletionStatus::Error);
            return;
        }

        let copied = if buffer.filled_len > 0 {
            match buffer
                .memory()
                .copy_into(buffer.offset, buffer.filled_len, &region, 0)
            {
                Ok(n) => n,
                Err(e) => {
                    warn!(%index, error = %e, "Staging copy failed");
                    self.staging.complete(slot);
                    self.pools[PortIndex::Input.as_usize()].hand_back(index);
                    self.deliver(buffer, CompletionStatus::Error);
                    return;
                }
            }
        } else {
            if buffer.is_eos() {
                debug!(%index, staging = %slot, "Zero-length EOS substituted with staging buffer");
                self.stats.eos_substitutions += 1;
            }
            0
        };

        let frame = InputFrame {
            index: slot,
            offset: 0,
            filled_len: copied,
            timestamp: buffer.timestamp,
            flags: buffer.flags,
        };
        let result = self.device.submit_input(frame);
        self.pools[PortIndex::Input.as_usize()].hand_back(index);
        match result {
            Ok(()) => self.deliver(buffer, CompletionStatus::Ok),
            Err(e) => {
                self.staging.complete(slot);
                self.deliver(buffer, CompletionStatus::Error);
                let err = EngineError::from(e);
                if err.is_fatal() {
                    self.report_error(err);
                }
            }
        }
    }

    fn input_done(&mut self, index: BufferIndex, status: CompletionStatus) {
        match self.input_mode {
            InputMode::Staged => {
                if !self.staging.complete(index) {
                    warn!(%index, "Completion for a staging buffer the device does not hold");
                    return;
                }
                if status == CompletionStatus::Error {
                    self.report_error(EngineError::Hardware(format!(
                        "device failed staged input {index}"
                    )));
                    return;
                }
                if !self.flush.is_flushing(PortIndex::Input) {
                    self.pump_staging();
                }
            }
            InputMode::Registered => {
                let Some(buffer) = self.pools[PortIndex::Input.as_usize()].take_from_device(index)
                else {
                    return;
                };
                self.deliver(buffer, status);
                if status == CompletionStatus::Error {
                    self.report_error(EngineError::Hardware(format!(
                        "device failed input buffer {index}"
                    )));
                }
            }
        }
    }

    fn submit_output(&mut self, mut buffer: BufferDescriptor) {
        self.stats.outputs_submitted += 1;
        if let Some(status) = self.refusal(PortIndex::Output) {
            debug!(index = %buffer.index(), ?status, "Output buffer refused");
            self.deliver(buffer, status);
            return;
        }
        let pool = &mut self.pools[PortIndex::Output.as_usize()];
        if let Err(e) = pool.accept(&buffer) {
            warn!(error = %e, "Output buffer refused");
            self.deliver(buffer, CompletionStatus::Rejected);
            return;
        }
        buffer.clear_payload();

        let index = buffer.index();
        match self.device.submit_output(index) {
            Ok(()) => {
                if let Err(buffer) = pool.park_with_device(buffer) {
                    warn!(%index, "Output buffer could not be parked");
                    pool.hand_back(index);
                    self.deliver(buffer, CompletionStatus::Error);
                }
            }
            Err(e) => {
                pool.hand_back(index);
                self.deliver(buffer, CompletionStatus::Error);
                let err = EngineError::from(e);
                if err.is_fatal() {
                    self.report_error(err);
                }
            }
        }
    }

    fn output_done(&mut self, completion: OutputCompletion) {
        let index = completion.index;
        let Some(mut buffer) = self.pools[PortIndex::Output.as_usize()].take_from_device(index)
        else {
            return;
        };

        let mut status = completion.status;
        buffer.offset = completion.offset;
        buffer.filled_len = completion.filled_len;
        buffer.timestamp = completion.timestamp;
        buffer.flags = completion.flags;
        if !buffer.payload_in_bounds() {
            warn!(
                %index,
                offset = completion.offset,
                len = completion.filled_len,
                alloc = buffer.alloc_len(),
                "Device reported a payload larger than the buffer"
            );
            buffer.offset = 0;
            buffer.filled_len = 0;
            status = CompletionStatus::Error;
        }

        let carries_frame = status == CompletionStatus::Ok
            && !buffer.flags.contains(BufferFlags::CODEC_CONFIG)
            && (buffer.filled_len > 0 || buffer.is_eos());
        let mark = if carries_frame {
            self.marks.pop_front()
        } else {
            None
        };
        buffer.set_mark(mark);

        let flags = buffer.flags;
        let eos = status == CompletionStatus::Ok && flags.is_eos();
        self.stats.output_bytes += buffer.filled_len as u64;
        if eos {
            self.stats.eos_outputs += 1;
            info!(%index, "End of stream reached the output port");
        }
        debug!(%index, len = buffer.filled_len, ?flags, ?status, "Output buffer done");
        self.deliver(buffer, status);

        if let Some(tag) = mark {
            self.emit(ComponentEvent::Mark(tag));
        }
        if eos {
            self.emit(ComponentEvent::BufferFlag {
                port: PortIndex::Output,
                flags,
            });
        }
        if completion.status == CompletionStatus::Error {
            self.report_error(EngineError::Hardware(format!(
                "device failed output buffer {index}"
            )));
        }
    }

    /// Process every buffer completion already queued, ahead of a state
    /// change that must follow them.
    fn drain_completions(&mut self) {
        for message in self.dispatcher.take_completions() {
            self.handle(message);
        }
    }

    // ── Device notifications ──

    fn handle_device_notice(&mut self, notice: DeviceNotice) {
        match notice {
            DeviceNotice::StartDone => self.start_done(),
            DeviceNotice::StopDone => self.stop_done(),
            DeviceNotice::PauseDone => {
                if self.machine.is_pending(PendingFlags::PAUSE) {
                    self.drain_completions();
                    self.machine.clear_pending(PendingFlags::PAUSE);
                    self.commit_state(ComponentState::Paused);
                } else {
                    debug!("Unsolicited pause-done ignored");
                }
            }
            DeviceNotice::ResumeDone => {
                if self.machine.clear_pending(PendingFlags::EXECUTE) {
                    self.commit_state(ComponentState::Executing);
                } else {
                    debug!("Unsolicited resume-done ignored");
                }
            }
            DeviceNotice::HardwareError(reason) => {
                self.report_error(EngineError::Hardware(reason));
            }
        }
    }

    fn start_done(&mut self) {
        if self.machine.state() == ComponentState::Loaded {
            self.probe_started();
            return;
        }
        if self.machine.state() != ComponentState::Idle {
            debug!(state = %self.machine.state(), "Unsolicited start-done ignored");
            return;
        }
        if self.machine.clear_pending(PendingFlags::EXECUTE) {
            self.commit_state(ComponentState::Executing);
        } else if self.machine.is_pending(PendingFlags::PAUSE) {
            if let Err(e) = self.device.pause() {
                self.machine.clear_pending(PendingFlags::PAUSE);
                self.escalate(e.into());
            }
        }
    }

    fn probe_started(&mut self) {
        if !self.machine.clear_pending(PendingFlags::LOADED_START) {
            // Start of an abandoned probe.
            warn!("Late start-done while Loaded; stopping device");
            if let Err(e) = self.device.stop() {
                self.escalate(e.into());
            }
            return;
        }
        let header = self.device.codec_header().map_err(EngineError::from);
        if let Some(probe) = self.probe.as_mut() {
            probe.header = Some(header);
        }
        self.machine.set_pending(PendingFlags::LOADED_STOP);
        if let Err(e) = self.device.stop() {
            self.machine.clear_pending(PendingFlags::LOADED_STOP);
            self.finish_probe(Err(e.into()));
        }
    }

    fn stop_done(&mut self) {
        if self.machine.clear_pending(PendingFlags::LOADED_STOP) {
            let result = self
                .probe
                .as_mut()
                .and_then(|probe| probe.header.take())
                .unwrap_or_else(|| Err(EngineError::Hardware("codec header unavailable".into())));
            self.finish_probe(result);
            return;
        }
        if self.machine.is_pending(PendingFlags::IDLE) && self.machine.state().is_streaming() {
            self.drain_completions();
            self.machine.clear_pending(PendingFlags::IDLE);
            self.stop_requested = false;
            self.commit_state(ComponentState::Idle);
        } else {
            debug!("Unsolicited stop-done ignored");
        }
    }

    // ── Codec header probe ──

    fn begin_probe(&mut self, reply: Reply<Vec<u8>>) {
        if self.machine.state() != ComponentState::Loaded
            || self.probe.is_some()
            || self.machine.is_pending(PendingFlags::TRANSITION)
        {
            reply.send(Err(EngineError::InvalidState));
            return;
        }
        debug!("Probing codec header");
        self.machine.set_pending(PendingFlags::LOADED_START);
        self.probe = Some(PendingProbe {
            reply,
            header: None,
        });
        if let Err(e) = self.device.start() {
            self.machine.clear_pending(PendingFlags::LOADED_START);
            self.finish_probe(Err(e.into()));
        }
    }

    /// The caller gave up waiting: drop the probe and quiesce the device.
    fn cancel_probe(&mut self) {
        if self.probe.take().is_none() {
            return;
        }
        let starting = self.machine.clear_pending(PendingFlags::LOADED_START);
        let stopping = self.machine.clear_pending(PendingFlags::LOADED_STOP);
        warn!(starting, stopping, "Codec header probe abandoned");
        if starting {
            if let Err(e) = self.device.stop() {
                self.escalate(e.into());
            }
        }
    }

    fn finish_probe(&mut self, result: EngineResult<Vec<u8>>) {
        if let Some(probe) = self.probe.take() {
            match &result {
                Ok(header) => info!(len = header.len(), "Codec header probed"),
                Err(e) => warn!(error = %e, "Codec header probe failed"),
            }
            self.publish();
            probe.reply.send(result);
        }
    }

    // ── Teardown ──

    fn teardown(&mut self) {
        info!(state = %self.machine.state(), lanes = ?self.dispatcher.depths(), "Tearing down component");

        let device_active = self.machine.state().is_streaming()
            || self.machine.is_pending(
                PendingFlags::EXECUTE
                    | PendingFlags::PAUSE
                    | PendingFlags::LOADED_START
                    | PendingFlags::LOADED_STOP,
            );
        if device_active {
            if let Err(e) = self.device.stop() {
                warn!(error = %e, "Device stop during teardown failed");
            }
        }

        for message in self.dispatcher.close() {
            match message {
                Message::SubmitInput(buffer) | Message::SubmitOutput(buffer) => {
                    self.deliver(buffer, CompletionStatus::Flushed);
                }
                Message::Free { buffer, reply } => {
                    let port = buffer.port();
                    let result = self.free(buffer);
                    if let Some(reply) = reply {
                        reply.send(result);
                    }
                    self.after_release(port);
                }
                Message::Command {
                    reply: Some(reply), ..
                } => reply.send(Err(EngineError::InvalidState)),
                Message::Allocate { reply, .. } => reply.send(Err(EngineError::InvalidState)),
                Message::SetBufferCount { reply, .. } => reply.send(Err(EngineError::InvalidState)),
                Message::ProbeCodecHeader { reply } => reply.send(Err(EngineError::InvalidState)),
                Message::Shutdown { reply } => reply.send(Ok(())),
                _ => {}
            }
        }

        for buffer in self.staging.take_backlog() {
            self.pools[PortIndex::Input.as_usize()].hand_back(buffer.index());
            self.deliver(buffer, CompletionStatus::Flushed);
        }
        for port in PortIndex::ALL {
            let i = port.as_usize();
            for index in self.pools[i].held_by_device() {
                if let Some(buffer) = self.pools[i].take_from_device(index) {
                    self.deliver(buffer, CompletionStatus::Flushed);
                }
            }
            for index in self.pools[i].registered_indices() {
                if let Err(e) = self.device.unregister_buffer(port, index) {
                    debug!(%port, %index, error = %e, "Unregister during teardown failed");
                }
            }
        }
        if self.staging.is_allocated() {
            self.teardown_staging();
        }

        self.machine.clear_pending(PendingFlags::all());
        self.finish_probe(Err(EngineError::InvalidState));
        self.device.close();
    }
}
