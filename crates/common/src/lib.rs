//! Shared types, configuration and errors for the venc encoder engine.
//!
//! This crate is the foundation that the device and engine crates depend on:
//!
//! - **Types**: `PortIndex`, `PortScope`, `ComponentState`, `BufferIndex`, `Timestamp`
//! - **Flags**: `BufferFlags` (EOS, codec config, sync frame, ...)
//! - **Codec**: `Codec` with per-codec parameter sets
//! - **Memory**: `SharedMemory` regions and the `MemoryAllocator` seam
//! - **Errors**: `EngineError`, `ConfigError`, `MemoryError` (thiserror-based)
//! - **Config**: `EngineConfig` (TOML / JSON)

pub mod codec;
pub mod config;
pub mod error;
pub mod flags;
pub mod logging;
pub mod memory;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{
    AvcParams, AvcProfile, Codec, EntropyCoding, H263Params, H263Profile, Mpeg4Params,
    Mpeg4Profile, Vp8Params,
};
pub use config::{
    ColorFormat, EngineConfig, FrameFormat, InputMode, PortOverrides, RateControl,
};
pub use error::{ConfigError, EngineError, EngineResult, MemoryError};
pub use flags::BufferFlags;
pub use memory::{HeapAllocator, MemoryAllocator, SharedMemory};
pub use types::{
    BufferIndex, CompletionStatus, ComponentState, MarkTag, PortIndex, PortScope, Timestamp,
};
