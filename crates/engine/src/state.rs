//! Component state machine.
//!
//! Legal transitions:
//!
//! ```text
//! Loaded ──────────> Idle            (deferred until every enabled port is populated)
//! Loaded <────────── Idle            (deferred until both ports are released)
//! Loaded <─────────> WaitForResources
//! Idle ────────────> Executing       (device start)
//! Idle ────────────> Paused          (device start, then pause)
//! Executing ───────> Paused          (device pause)
//! Paused ──────────> Executing       (device resume)
//! Executing/Paused ─> Idle           (flush both ports, then device stop)
//! any ─────────────> Invalid         (hardware error only)
//! ```
//!
//! `StateMachine::plan` is pure: it validates a request and says what has to
//! happen, without touching state. The worker executes the plan and records
//! deferred completions in `PendingFlags`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use venc_common::{ComponentState, EngineError, PortIndex};

bitflags! {
    /// Transitions and port operations awaiting an asynchronous condition.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PendingFlags: u32 {
        /// Loaded -> Idle waiting for population, or Executing/Paused -> Idle
        /// waiting for flush and stop.
        const IDLE = 1 << 0;
        /// Idle -> Loaded waiting for every buffer to be freed.
        const LOADING = 1 << 1;
        /// Waiting for start-done or resume-done.
        const EXECUTE = 1 << 2;
        /// Waiting for pause-done (or start-done then pause-done).
        const PAUSE = 1 << 3;
        const INPUT_FLUSH = 1 << 4;
        const OUTPUT_FLUSH = 1 << 5;
        const INPUT_ENABLE = 1 << 6;
        const OUTPUT_ENABLE = 1 << 7;
        const INPUT_DISABLE = 1 << 8;
        const OUTPUT_DISABLE = 1 << 9;
        /// Codec-header probe: waiting for start-done while Loaded.
        const LOADED_START = 1 << 10;
        /// Codec-header probe: waiting for stop-done while Loaded.
        const LOADED_STOP = 1 << 11;

        const TRANSITION = Self::IDLE.bits()
            | Self::LOADING.bits()
            | Self::EXECUTE.bits()
            | Self::PAUSE.bits();

        const PROBE = Self::LOADED_START.bits() | Self::LOADED_STOP.bits();
    }
}

impl PendingFlags {
    pub fn flush(port: PortIndex) -> Self {
        match port {
            PortIndex::Input => Self::INPUT_FLUSH,
            PortIndex::Output => Self::OUTPUT_FLUSH,
        }
    }

    pub fn enable(port: PortIndex) -> Self {
        match port {
            PortIndex::Input => Self::INPUT_ENABLE,
            PortIndex::Output => Self::OUTPUT_ENABLE,
        }
    }

    pub fn disable(port: PortIndex) -> Self {
        match port {
            PortIndex::Input => Self::INPUT_DISABLE,
            PortIndex::Output => Self::OUTPUT_DISABLE,
        }
    }
}

/// What executing a validated state request involves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransitionPlan {
    /// Commit the target state immediately.
    Complete,
    /// Loaded -> Idle: commit once the enabled ports are populated.
    AwaitPopulated,
    /// Idle -> Loaded: commit once both ports are released.
    AwaitReleased,
    /// Start the device; optionally pause it once started.
    StartDevice { then_pause: bool },
    PauseDevice,
    ResumeDevice,
    /// Flush both ports, stop the device, then commit Idle.
    FlushAndStop,
}

/// Current state plus pending bits. Owned by the worker thread.
#[derive(Clone, Debug)]
pub struct StateMachine {
    state: ComponentState,
    pending: PendingFlags,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ComponentState::Loaded,
            pending: PendingFlags::empty(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn pending(&self) -> PendingFlags {
        self.pending
    }

    pub fn is_pending(&self, flags: PendingFlags) -> bool {
        self.pending.intersects(flags)
    }

    pub fn set_pending(&mut self, flags: PendingFlags) {
        self.pending.insert(flags);
    }

    /// Clear `flags`, returning whether any of them was set.
    pub fn clear_pending(&mut self, flags: PendingFlags) -> bool {
        let was = self.pending.intersects(flags);
        self.pending.remove(flags);
        was
    }

    /// Validate a client request for `target`.
    pub fn plan(&self, target: ComponentState) -> Result<TransitionPlan, EngineError> {
        use ComponentState::*;

        let from = self.state;
        if from == Invalid || target == Invalid {
            return Err(EngineError::InvalidState);
        }
        if from == target {
            return Err(EngineError::SameState(from));
        }
        if self.pending.intersects(PendingFlags::TRANSITION) {
            return Err(EngineError::IncorrectStateTransition { from, to: target });
        }
        // The device is running only to read the codec header.
        if self.pending.intersects(PendingFlags::PROBE) {
            return Err(EngineError::InvalidState);
        }

        let plan = match (from, target) {
            (Loaded, Idle) => TransitionPlan::AwaitPopulated,
            (Loaded, WaitForResources) | (WaitForResources, Loaded) => TransitionPlan::Complete,
            (Idle, Loaded) => TransitionPlan::AwaitReleased,
            (Idle, Executing) => TransitionPlan::StartDevice { then_pause: false },
            (Idle, Paused) => TransitionPlan::StartDevice { then_pause: true },
            (Executing, Idle) | (Paused, Idle) => TransitionPlan::FlushAndStop,
            (Executing, Paused) => TransitionPlan::PauseDevice,
            (Paused, Executing) => TransitionPlan::ResumeDevice,
            _ => return Err(EngineError::IncorrectStateTransition { from, to: target }),
        };
        Ok(plan)
    }

    /// Enter `state`. Entering `Invalid` drops every pending operation.
    pub fn commit(&mut self, state: ComponentState) {
        self.state = state;
        if state == ComponentState::Invalid {
            self.pending = PendingFlags::empty();
        }
    }
}
