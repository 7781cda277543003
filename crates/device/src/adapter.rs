//! The `DeviceAdapter` seam between the component and the encoder hardware.
//!
//! Every call is non-blocking. Operations that complete asynchronously on
//! real hardware (start, stop, pause, resume, flush and every buffer
//! submission) report their completion later as a [`DeviceEvent`], retrieved
//! with [`DeviceAdapter::next_event`] by the component's device event thread.
//!
//! # Completion contract
//!
//! - `start` / `stop` / `pause` / `resume` each produce exactly one
//!   `StartDone` / `StopDone` / `PauseDone` / `ResumeDone`.
//! - Every accepted `submit_input` produces exactly one `InputDone` for that
//!   index, every accepted `submit_output` exactly one `OutputDone`.
//! - `flush(scope)` returns every buffer still held on the flushed ports
//!   (status `Flushed`) *before* emitting `FlushDone(port)` for each port.
//! - `HardwareError` may be emitted at any time.
//! - `Closed` is the last event after `close`.

use std::time::Duration;

use venc_common::{
    BufferFlags, BufferIndex, Codec, CompletionStatus, FrameFormat, PortIndex, PortScope,
    RateControl, SharedMemory, Timestamp,
};

use crate::error::DeviceError;

/// Buffer count and size the device needs on one port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    pub min_count: u32,
    pub actual_count: u32,
    /// Bytes per buffer.
    pub buffer_size: usize,
}

/// Session parameters applied with [`DeviceAdapter::configure`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSettings {
    pub frame: FrameFormat,
    pub rate: RateControl,
}

/// One raw frame handed to the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputFrame {
    pub index: BufferIndex,
    pub offset: usize,
    pub filled_len: usize,
    pub timestamp: Timestamp,
    pub flags: BufferFlags,
}

/// Result of filling one output buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputCompletion {
    pub index: BufferIndex,
    pub offset: usize,
    pub filled_len: usize,
    pub timestamp: Timestamp,
    pub flags: BufferFlags,
    pub status: CompletionStatus,
}

impl OutputCompletion {
    /// Empty completion used when a buffer is returned unprocessed.
    pub fn flushed(index: BufferIndex) -> Self {
        Self {
            index,
            offset: 0,
            filled_len: 0,
            timestamp: Timestamp::ZERO,
            flags: BufferFlags::empty(),
            status: CompletionStatus::Flushed,
        }
    }
}

/// Asynchronous notifications from the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    InputDone {
        index: BufferIndex,
        status: CompletionStatus,
    },
    OutputDone(OutputCompletion),
    StartDone,
    StopDone,
    PauseDone,
    ResumeDone,
    FlushDone(PortIndex),
    HardwareError(String),
    Closed,
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InputDone { .. } => "input-done",
            Self::OutputDone(_) => "output-done",
            Self::StartDone => "start-done",
            Self::StopDone => "stop-done",
            Self::PauseDone => "pause-done",
            Self::ResumeDone => "resume-done",
            Self::FlushDone(_) => "flush-done",
            Self::HardwareError(_) => "hardware-error",
            Self::Closed => "closed",
        }
    }
}

/// Capability set of an encoder device.
///
/// Implementations are shared between the worker thread (which issues
/// commands) and the event thread (which waits in `next_event`), so every
/// method takes `&self` and the adapter synchronizes internally.
pub trait DeviceAdapter: Send + Sync {
    /// Bind the device to a codec. Must precede every other call.
    fn open(&self, codec: &Codec) -> Result<(), DeviceError>;

    fn configure(&self, settings: &DeviceSettings) -> Result<(), DeviceError>;

    fn buffer_requirements(&self, port: PortIndex) -> Result<BufferRequirements, DeviceError>;

    /// Make `memory` addressable by the device as buffer `index` of `port`.
    fn register_buffer(
        &self,
        port: PortIndex,
        index: BufferIndex,
        memory: &SharedMemory,
    ) -> Result<(), DeviceError>;

    fn unregister_buffer(&self, port: PortIndex, index: BufferIndex) -> Result<(), DeviceError>;

    fn start(&self) -> Result<(), DeviceError>;

    fn stop(&self) -> Result<(), DeviceError>;

    fn pause(&self) -> Result<(), DeviceError>;

    fn resume(&self) -> Result<(), DeviceError>;

    fn submit_input(&self, frame: InputFrame) -> Result<(), DeviceError>;

    fn submit_output(&self, index: BufferIndex) -> Result<(), DeviceError>;

    fn flush(&self, scope: PortScope) -> Result<(), DeviceError>;

    /// Codec configuration header (e.g. SPS/PPS). Valid while started.
    fn codec_header(&self) -> Result<Vec<u8>, DeviceError>;

    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout.
    fn next_event(&self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError>;

    /// Release the device. Emits `Closed`.
    fn close(&self);
}
