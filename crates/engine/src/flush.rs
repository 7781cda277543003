//! Port flushing.
//!
//! A flush returns every buffer of the port to the client: submissions still
//! queued in the port's lane and the staging backlog go back directly with
//! `Flushed`, then the device is asked to hand back whatever it holds and
//! reports flush-done per port. Flush-done rides the port's lane behind the
//! device's own completions, so the `Flush` command completes only after the
//! last buffer of that port was returned.
//!
//! While a port is flushing, new submissions on it are refused with
//! `CompletionStatus::FlushInProgress`.

use tracing::{debug, info, warn};

use venc_common::{CompletionStatus, EngineError, EngineResult, PortIndex, PortScope};

use crate::callbacks::{CompletedCommand, ComponentEvent};
use crate::dispatch::{Lane, Message};
use crate::state::PendingFlags;
use crate::worker::Worker;

/// Per-port "device flush outstanding" flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushController {
    in_progress: [bool; 2],
}

impl FlushController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the ports of `scope` as flushing. Returns the ports that were not
    /// already flushing.
    pub fn begin(&mut self, scope: PortScope) -> Vec<PortIndex> {
        scope
            .ports()
            .iter()
            .copied()
            .filter(|port| !std::mem::replace(&mut self.in_progress[port.as_usize()], true))
            .collect()
    }

    pub fn is_flushing(&self, port: PortIndex) -> bool {
        self.in_progress[port.as_usize()]
    }

    /// Record flush-done for `port`. `false` if no flush was outstanding.
    pub fn complete(&mut self, port: PortIndex) -> bool {
        std::mem::replace(&mut self.in_progress[port.as_usize()], false)
    }

    pub fn any_in_progress(&self) -> bool {
        self.in_progress.iter().any(|&flushing| flushing)
    }

    pub fn cancel_all(&mut self) {
        self.in_progress = [false; 2];
    }
}

fn scope_of(ports: &[PortIndex]) -> PortScope {
    match ports {
        [port] => PortScope::Port(*port),
        _ => PortScope::Both,
    }
}

impl Worker {
    /// Client `Flush` command.
    pub(crate) fn flush_command(&mut self, scope: PortScope) -> EngineResult<()> {
        if !self.machine.state().is_streaming() {
            // Nothing can be in flight outside Executing/Paused.
            for &port in scope.ports() {
                debug!(%port, "Flush completed immediately");
                self.emit(ComponentEvent::CommandComplete(CompletedCommand::Flush(port)));
            }
            return Ok(());
        }
        for &port in scope.ports() {
            self.machine.set_pending(PendingFlags::flush(port));
        }
        if let Err(e) = self.begin_flush(scope) {
            for &port in scope.ports() {
                self.machine.clear_pending(PendingFlags::flush(port));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Return unsubmitted buffers and ask the device to flush the ports of
    /// `scope` that are not already flushing.
    pub(crate) fn begin_flush(&mut self, scope: PortScope) -> EngineResult<()> {
        let started = self.flush.begin(scope);
        if started.is_empty() {
            debug!(?scope, "Flush already in progress");
            return Ok(());
        }
        self.stats.flushes += 1;
        info!(?started, "Flushing");

        for &port in &started {
            self.return_unsubmitted(port);
        }
        if let Err(e) = self.device.flush(scope_of(&started)) {
            for &port in &started {
                self.flush.complete(port);
            }
            return Err(self.escalate(EngineError::from(e)));
        }
        Ok(())
    }

    /// Give back buffers the device never saw and process completions that
    /// were already queued for `port`.
    fn return_unsubmitted(&mut self, port: PortIndex) {
        if port == PortIndex::Input {
            for buffer in self.staging.take_backlog() {
                self.pools[PortIndex::Input.as_usize()].hand_back(buffer.index());
                self.deliver(buffer, CompletionStatus::Flushed);
            }
        }
        for message in self.dispatcher.drain_lane(Lane::of_port(port)) {
            match message {
                Message::SubmitInput(buffer) | Message::SubmitOutput(buffer) => {
                    debug!(%port, index = %buffer.index(), "Queued submission flushed");
                    self.deliver(buffer, CompletionStatus::Flushed);
                }
                other => self.handle(other),
            }
        }
    }

    /// Device reported flush-done for `port`.
    pub(crate) fn flush_done(&mut self, port: PortIndex) {
        if !self.flush.complete(port) {
            warn!(%port, "Flush-done without an outstanding flush");
            return;
        }
        debug!(%port, "Port flushed");
        if self.machine.clear_pending(PendingFlags::flush(port)) {
            self.emit(ComponentEvent::CommandComplete(CompletedCommand::Flush(port)));
        }
        self.maybe_stop_after_flush();
    }

    /// Second half of Executing/Paused -> Idle: once both ports are flushed,
    /// stop the device.
    pub(crate) fn maybe_stop_after_flush(&mut self) {
        if !self.machine.is_pending(PendingFlags::IDLE)
            || !self.machine.state().is_streaming()
            || self.flush.any_in_progress()
            || self.stop_requested
        {
            return;
        }
        self.stop_requested = true;
        debug!("Ports flushed; stopping device");
        if let Err(e) = self.device.stop() {
            self.stop_requested = false;
            self.machine.clear_pending(PendingFlags::IDLE);
            let err = self.escalate(EngineError::from(e));
            warn!(error = %err, "Device stop failed");
        }
    }
}
