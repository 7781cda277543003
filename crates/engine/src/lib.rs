//! `venc-engine`: buffer exchange and state machine of an encoder component.
//!
//! - **Component**: `Component`, the client handle (commands, allocation,
//!   buffer submission, codec-header probe)
//! - **Callbacks**: `ComponentCallbacks`, `ComponentEvent`, `ChannelCallbacks`
//! - **Buffers**: `BufferDescriptor`, per-port `BufferPool` bitsets
//! - **State**: `StateMachine`, `PendingFlags`
//! - **Threads**: a single worker draining a three-lane `Dispatcher`, and a
//!   device event thread feeding it
//!
//! ```no_run
//! use std::sync::Arc;
//! use venc_common::{ComponentState, EngineConfig, PortIndex};
//! use venc_device::LoopbackDevice;
//! use venc_engine::{ChannelCallbacks, Command, Component};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (callbacks, notifications) = ChannelCallbacks::new();
//! let component = Component::new(
//!     EngineConfig::default(),
//!     Arc::new(LoopbackDevice::default()),
//!     Box::new(callbacks),
//! )?;
//! component.send_command(Command::SetState(ComponentState::Idle))?;
//! let inputs = component.allocate_port_buffers(PortIndex::Input)?;
//! let outputs = component.allocate_port_buffers(PortIndex::Output)?;
//! # drop((inputs, outputs, notifications));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod callbacks;
pub mod component;
pub mod dispatch;
pub mod error;
pub mod event_thread;
pub mod flush;
pub mod pool;
pub mod ports;
pub mod shared;
pub mod staging;
pub mod state;
pub mod stats;
mod worker;

pub use buffer::BufferDescriptor;
pub use callbacks::{
    ChannelCallbacks, Command, CompletedCommand, ComponentCallbacks, ComponentEvent, Notification,
};
pub use component::Component;
pub use dispatch::{Dispatcher, Lane, Message};
pub use error::{PoolError, SubmitError};
pub use flush::FlushController;
pub use pool::{BufferPool, Owner, SlotMask};
pub use ports::PortDefinition;
pub use shared::Snapshot;
pub use staging::StagingPool;
pub use state::{PendingFlags, StateMachine, TransitionPlan};
pub use stats::ComponentStats;
