//! The hardware seam of the venc encoder engine.
//!
//! - **Adapter**: `DeviceAdapter`, the capability set every encoder device
//!   implements, and `DeviceEvent`, its asynchronous completion stream
//! - **Loopback**: `LoopbackDevice`, a software device honouring the same
//!   contract (tests, bring-up)
//! - **Errors**: `DeviceError`

pub mod adapter;
pub mod error;
pub mod loopback;

pub use adapter::{
    BufferRequirements, DeviceAdapter, DeviceEvent, DeviceSettings, InputFrame, OutputCompletion,
};
pub use error::DeviceError;
pub use loopback::{DeviceOp, LoopbackDevice, LoopbackOptions};
