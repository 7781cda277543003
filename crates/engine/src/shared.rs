//! State shared between the client-facing handle and the worker thread.
//!
//! The worker is the only writer. After every handled message it publishes
//! a `Snapshot` that client threads read to validate calls synchronously.

use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

use venc_common::{ComponentState, PortIndex};

use crate::ports::PortDefinition;
use crate::state::PendingFlags;
use crate::stats::ComponentStats;

/// Published view of the worker's state.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub state: ComponentState,
    pub pending: PendingFlags,
    pub ports: [PortDefinition; 2],
    pub stats: ComponentStats,
}

impl Snapshot {
    pub fn port(&self, port: PortIndex) -> &PortDefinition {
        &self.ports[port.as_usize()]
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ComponentState::Loaded,
            pending: PendingFlags::empty(),
            ports: [
                PortDefinition::placeholder(PortIndex::Input),
                PortDefinition::placeholder(PortIndex::Output),
            ],
            stats: ComponentStats::default(),
        }
    }
}

#[derive(Default)]
pub struct Shared {
    snapshot: RwLock<Snapshot>,
    /// Set once the first hardware error has been reported.
    error_raised: Mutex<bool>,
    worker: OnceLock<ThreadId>,
}

impl Shared {
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> ComponentState {
        self.snapshot.read().state
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Latch the first error. `true` only for the call that set it.
    pub fn raise_error(&self) -> bool {
        let mut raised = self.error_raised.lock();
        !std::mem::replace(&mut *raised, true)
    }

    pub fn error_raised(&self) -> bool {
        *self.error_raised.lock()
    }

    pub fn register_worker(&self) {
        let _ = self.worker.set(thread::current().id());
    }

    pub fn on_worker_thread(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_latch_fires_once() {
        let shared = Shared::default();
        assert!(!shared.error_raised());
        assert!(shared.raise_error());
        assert!(!shared.raise_error());
        assert!(shared.error_raised());
    }

    #[test]
    fn worker_thread_detection() {
        let shared = std::sync::Arc::new(Shared::default());
        assert!(!shared.on_worker_thread());
        let s = std::sync::Arc::clone(&shared);
        std::thread::spawn(move || {
            s.register_worker();
            assert!(s.on_worker_thread());
        })
        .join()
        .unwrap();
        assert!(!shared.on_worker_thread());
    }

    #[test]
    fn publish_replaces_snapshot() {
        let shared = Shared::default();
        let mut snap = shared.snapshot();
        snap.state = ComponentState::Idle;
        snap.stats.flushes = 2;
        shared.publish(snap);
        assert_eq!(shared.state(), ComponentState::Idle);
        assert_eq!(shared.snapshot().stats.flushes, 2);
    }
}
