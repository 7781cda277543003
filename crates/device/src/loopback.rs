//! In-process software encoder device.
//!
//! `LoopbackDevice` honours the full [`DeviceAdapter`] completion contract
//! without hardware: an input frame is "encoded" by copying its payload into
//! the next free output buffer. It is what the engine's integration tests
//! drive, and a usable stand-in for integrators bringing up a new platform.
//!
//! Besides the adapter calls it exposes test controls:
//!
//! - **Manual pumping**: with `auto_process = false` frames are only encoded
//!   when [`LoopbackDevice::process_pending`] is called, so a test can hold
//!   buffers inside the device (e.g. to exercise flush).
//! - **Fault injection**: [`LoopbackDevice::fail_next`] makes the next call of
//!   an operation fail, [`LoopbackDevice::swallow_next`] makes it succeed but
//!   never report completion, [`LoopbackDevice::inject_hardware_error`] posts
//!   an asynchronous hardware error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use venc_common::{
    BufferFlags, BufferIndex, Codec, CompletionStatus, Mpeg4Profile, PortIndex, PortScope,
    SharedMemory, Timestamp,
};

use crate::adapter::{
    BufferRequirements, DeviceAdapter, DeviceEvent, DeviceSettings, InputFrame, OutputCompletion,
};
use crate::error::DeviceError;

/// Adapter operations, for fault injection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    Open,
    Configure,
    Register,
    Unregister,
    Start,
    Stop,
    Pause,
    Resume,
    SubmitInput,
    SubmitOutput,
    Flush,
    CodecHeader,
}

/// Construction options for [`LoopbackDevice`].
#[derive(Clone, Debug)]
pub struct LoopbackOptions {
    pub input_min: u32,
    pub input_actual: u32,
    pub output_min: u32,
    pub output_actual: u32,
    /// Input buffer size; defaults to one raw frame of the configured format.
    pub input_size: Option<usize>,
    /// Output buffer size; defaults to half a raw frame.
    pub output_size: Option<usize>,
    /// Emit the codec header as the first output after every start.
    pub emit_codec_config: bool,
    /// Encode as soon as an input and an output buffer are both queued.
    pub auto_process: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_min: 2,
            input_actual: 2,
            output_min: 2,
            output_actual: 2,
            input_size: None,
            output_size: None,
            emit_codec_config: false,
            auto_process: true,
        }
    }
}

#[derive(Default)]
struct FaultPlan {
    fail_next: HashSet<DeviceOp>,
    swallow_next: HashSet<DeviceOp>,
}

struct LoopbackState {
    options: LoopbackOptions,
    codec: Option<Codec>,
    settings: Option<DeviceSettings>,
    registered: [HashMap<BufferIndex, SharedMemory>; 2],
    running: bool,
    paused: bool,
    closed: bool,
    inputs: VecDeque<InputFrame>,
    outputs: VecDeque<BufferIndex>,
    frames_encoded: u64,
    header_pending: bool,
    faults: FaultPlan,
}

impl LoopbackState {
    fn check(&mut self, op: DeviceOp) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::NotOpen);
        }
        if op != DeviceOp::Open && self.codec.is_none() {
            return Err(DeviceError::NotOpen);
        }
        if self.faults.fail_next.remove(&op) {
            return Err(DeviceError::Hardware(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    /// Whether completion of `op` should be reported.
    fn reports(&mut self, op: DeviceOp) -> bool {
        !self.faults.swallow_next.remove(&op)
    }

    fn buffer_size(&self, port: PortIndex) -> Result<usize, DeviceError> {
        let frame_size = self
            .settings
            .as_ref()
            .map(|s| s.frame.frame_size())
            .ok_or_else(|| DeviceError::Hardware("device not configured".into()))?;
        Ok(match port {
            PortIndex::Input => self.options.input_size.unwrap_or(frame_size),
            PortIndex::Output => self.options.output_size.unwrap_or(frame_size / 2),
        })
    }
}

/// Software encoder device (see module docs).
pub struct LoopbackDevice {
    state: Mutex<LoopbackState>,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
}

impl LoopbackDevice {
    pub fn new(options: LoopbackOptions) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        Self {
            state: Mutex::new(LoopbackState {
                options,
                codec: None,
                settings: None,
                registered: [HashMap::new(), HashMap::new()],
                running: false,
                paused: false,
                closed: false,
                inputs: VecDeque::new(),
                outputs: VecDeque::new(),
                frames_encoded: 0,
                header_pending: false,
                faults: FaultPlan::default(),
            }),
            events_tx,
            events_rx,
        }
    }

    // ── Test controls ──

    /// Encode every frame for which an output buffer is available.
    /// Returns the number of frames encoded.
    pub fn process_pending(&self) -> usize {
        let mut state = self.state.lock();
        self.pump(&mut state, true)
    }

    pub fn set_auto_process(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.options.auto_process = enabled;
        if enabled {
            self.pump(&mut state, false);
        }
    }

    /// Make the next call of `op` fail with a hardware error.
    pub fn fail_next(&self, op: DeviceOp) {
        self.state.lock().faults.fail_next.insert(op);
    }

    /// Make the next call of `op` succeed without ever reporting completion.
    pub fn swallow_next(&self, op: DeviceOp) {
        self.state.lock().faults.swallow_next.insert(op);
    }

    /// Post an asynchronous hardware error.
    pub fn inject_hardware_error(&self, reason: &str) {
        warn!(reason, "Loopback: injecting hardware error");
        self.emit(DeviceEvent::HardwareError(reason.to_string()));
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.running && !state.paused
    }

    pub fn queued_inputs(&self) -> usize {
        self.state.lock().inputs.len()
    }

    pub fn queued_outputs(&self) -> usize {
        self.state.lock().outputs.len()
    }

    pub fn registered_count(&self, port: PortIndex) -> usize {
        self.state.lock().registered[port.as_usize()].len()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.state.lock().frames_encoded
    }

    // ── Internals ──

    fn emit(&self, event: DeviceEvent) {
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.events_tx.send(event);
    }

    fn pump(&self, state: &mut LoopbackState, forced: bool) -> usize {
        if !state.running || state.paused || !(forced || state.options.auto_process) {
            return 0;
        }

        if state.header_pending {
            if let Some(out) = state.outputs.pop_front() {
                state.header_pending = false;
                let header = state.codec.as_ref().and_then(synth_header).unwrap_or_default();
                let completion = match state.registered[1].get(&out) {
                    Some(region) => match region.write(0, &header) {
                        Ok(()) => OutputCompletion {
                            index: out,
                            offset: 0,
                            filled_len: header.len(),
                            timestamp: Timestamp::ZERO,
                            flags: BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_FRAME,
                            status: CompletionStatus::Ok,
                        },
                        Err(e) => {
                            warn!(index = %out, error = %e, "Loopback: codec header does not fit");
                            OutputCompletion {
                                status: CompletionStatus::Error,
                                ..OutputCompletion::flushed(out)
                            }
                        }
                    },
                    None => OutputCompletion {
                        status: CompletionStatus::Error,
                        ..OutputCompletion::flushed(out)
                    },
                };
                self.emit(DeviceEvent::OutputDone(completion));
            }
        }

        let mut encoded = 0;
        while !state.inputs.is_empty() && !state.outputs.is_empty() {
            let (Some(frame), Some(out)) = (state.inputs.pop_front(), state.outputs.pop_front())
            else {
                break;
            };
            let (input_status, completion) = encode_frame(state, frame, out);
            self.emit(DeviceEvent::InputDone {
                index: frame.index,
                status: input_status,
            });
            self.emit(DeviceEvent::OutputDone(completion));
            encoded += 1;
        }
        if encoded > 0 {
            debug!(encoded, total = state.frames_encoded, "Loopback: frames encoded");
        }
        encoded
    }

    fn drain_port(&self, state: &mut LoopbackState, port: PortIndex) {
        match port {
            PortIndex::Input => {
                for frame in state.inputs.drain(..) {
                    let _ = self.events_tx.send(DeviceEvent::InputDone {
                        index: frame.index,
                        status: CompletionStatus::Flushed,
                    });
                }
            }
            PortIndex::Output => {
                for index in state.outputs.drain(..) {
                    let _ = self
                        .events_tx
                        .send(DeviceEvent::OutputDone(OutputCompletion::flushed(index)));
                }
            }
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl DeviceAdapter for LoopbackDevice {
    fn open(&self, codec: &Codec) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Open)?;
        info!(codec = codec.display_name(), "Loopback device opened");
        state.codec = Some(codec.clone());
        Ok(())
    }

    fn configure(&self, settings: &DeviceSettings) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Configure)?;
        debug!(
            width = settings.frame.width,
            height = settings.frame.height,
            rate = ?settings.rate,
            "Loopback device configured"
        );
        state.settings = Some(settings.clone());
        Ok(())
    }

    fn buffer_requirements(&self, port: PortIndex) -> Result<BufferRequirements, DeviceError> {
        let state = self.state.lock();
        let buffer_size = state.buffer_size(port)?;
        let (min_count, actual_count) = match port {
            PortIndex::Input => (state.options.input_min, state.options.input_actual),
            PortIndex::Output => (state.options.output_min, state.options.output_actual),
        };
        Ok(BufferRequirements {
            min_count,
            actual_count: actual_count.max(min_count),
            buffer_size,
        })
    }

    fn register_buffer(
        &self,
        port: PortIndex,
        index: BufferIndex,
        memory: &SharedMemory,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Register)?;
        let registry = &mut state.registered[port.as_usize()];
        if registry.contains_key(&index) {
            return Err(DeviceError::AlreadyRegistered { port, index });
        }
        registry.insert(index, memory.clone());
        debug!(%port, %index, len = memory.len(), "Loopback: buffer registered");
        Ok(())
    }

    fn unregister_buffer(&self, port: PortIndex, index: BufferIndex) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Unregister)?;
        if state.registered[port.as_usize()].remove(&index).is_none() {
            return Err(DeviceError::UnregisteredBuffer { port, index });
        }
        match port {
            PortIndex::Input => state.inputs.retain(|f| f.index != index),
            PortIndex::Output => state.outputs.retain(|i| *i != index),
        }
        Ok(())
    }

    fn start(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Start)?;
        state.running = true;
        state.paused = false;
        state.header_pending = state.options.emit_codec_config
            && state.codec.as_ref().and_then(synth_header).is_some();
        info!("Loopback device started");
        if state.reports(DeviceOp::Start) {
            self.emit(DeviceEvent::StartDone);
        }
        self.pump(&mut state, false);
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Stop)?;
        state.running = false;
        state.paused = false;
        state.header_pending = false;
        // Streaming off hands back whatever is still queued.
        self.drain_port(&mut state, PortIndex::Input);
        self.drain_port(&mut state, PortIndex::Output);
        info!("Loopback device stopped");
        if state.reports(DeviceOp::Stop) {
            self.emit(DeviceEvent::StopDone);
        }
        Ok(())
    }

    fn pause(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Pause)?;
        state.paused = true;
        if state.reports(DeviceOp::Pause) {
            self.emit(DeviceEvent::PauseDone);
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Resume)?;
        state.paused = false;
        if state.reports(DeviceOp::Resume) {
            self.emit(DeviceEvent::ResumeDone);
        }
        self.pump(&mut state, false);
        Ok(())
    }

    fn submit_input(&self, frame: InputFrame) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::SubmitInput)?;
        let region = state.registered[0]
            .get(&frame.index)
            .ok_or(DeviceError::UnregisteredBuffer {
                port: PortIndex::Input,
                index: frame.index,
            })?;
        let capacity = region.len();
        if frame.offset.saturating_add(frame.filled_len) > capacity {
            return Err(DeviceError::BadLength {
                offset: frame.offset,
                len: frame.filled_len,
                capacity,
            });
        }
        state.inputs.push_back(frame);
        self.pump(&mut state, false);
        Ok(())
    }

    fn submit_output(&self, index: BufferIndex) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::SubmitOutput)?;
        if !state.registered[1].contains_key(&index) {
            return Err(DeviceError::UnregisteredBuffer {
                port: PortIndex::Output,
                index,
            });
        }
        state.outputs.push_back(index);
        self.pump(&mut state, false);
        Ok(())
    }

    fn flush(&self, scope: PortScope) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::Flush)?;
        let report = state.reports(DeviceOp::Flush);
        for &port in scope.ports() {
            self.drain_port(&mut state, port);
            if report {
                self.emit(DeviceEvent::FlushDone(port));
            }
        }
        debug!(?scope, "Loopback: flushed");
        Ok(())
    }

    fn codec_header(&self) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state.lock();
        state.check(DeviceOp::CodecHeader)?;
        if !state.running {
            return Err(DeviceError::Hardware("codec header requires a started device".into()));
        }
        let codec = state.codec.as_ref().ok_or(DeviceError::NotOpen)?;
        synth_header(codec).ok_or_else(|| {
            DeviceError::Unsupported(format!("{} has no codec header", codec.display_name()))
        })
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::NotOpen),
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.running = false;
        state.inputs.clear();
        state.outputs.clear();
        for registry in state.registered.iter_mut() {
            registry.clear();
        }
        info!(frames = state.frames_encoded, "Loopback device closed");
        self.emit(DeviceEvent::Closed);
    }
}

/// Copy one input payload into an output buffer.
fn encode_frame(
    state: &mut LoopbackState,
    frame: InputFrame,
    out: BufferIndex,
) -> (CompletionStatus, OutputCompletion) {
    let (Some(src), Some(dst)) = (
        state.registered[0].get(&frame.index),
        state.registered[1].get(&out),
    ) else {
        warn!(input = %frame.index, output = %out, "Loopback: buffer vanished while queued");
        return (
            CompletionStatus::Error,
            OutputCompletion {
                status: CompletionStatus::Error,
                ..OutputCompletion::flushed(out)
            },
        );
    };

    let copied = if frame.filled_len > 0 {
        match src.copy_into(frame.offset, frame.filled_len, dst, 0) {
            Ok(n) => n,
            Err(e) => {
                warn!(input = %frame.index, error = %e, "Loopback: payload copy failed");
                return (
                    CompletionStatus::Error,
                    OutputCompletion {
                        status: CompletionStatus::Error,
                        ..OutputCompletion::flushed(out)
                    },
                );
            }
        }
    } else {
        0
    };

    let mut flags = frame.flags & BufferFlags::EOS;
    if copied > 0 {
        let period = state.codec.as_ref().map(|c| c.intra_period()).unwrap_or(0) as u64 + 1;
        if state.frames_encoded % period == 0 {
            flags |= BufferFlags::SYNC_FRAME;
        }
        flags |= BufferFlags::END_OF_FRAME;
        state.frames_encoded += 1;
    }

    (
        CompletionStatus::Ok,
        OutputCompletion {
            index: out,
            offset: 0,
            filled_len: copied,
            timestamp: frame.timestamp,
            flags,
            status: CompletionStatus::Ok,
        },
    )
}

/// Synthetic sequence header for codecs that carry one.
fn synth_header(codec: &Codec) -> Option<Vec<u8>> {
    match codec {
        Codec::Avc(p) => {
            let mut sps = vec![0, 0, 0, 1, 0x67, p.profile.profile_idc(), 0x00, p.level, 0xff];
            let pps = [0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
            sps.extend_from_slice(&pps);
            Some(sps)
        }
        Codec::Mpeg4(p) => {
            let profile_level = match p.profile {
                Mpeg4Profile::Simple => p.level,
                Mpeg4Profile::AdvancedSimple => 0xf0 | p.level,
            };
            Some(vec![
                0, 0, 1, 0xb0, profile_level, // visual object sequence
                0, 0, 1, 0xb5, 0x09, // visual object
                0, 0, 1, 0x00, // video object
                0, 0, 1, 0x20, 0x00, 0x84, // video object layer
            ])
        }
        Codec::H263(_) | Codec::Vp8(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venc_common::{AvcParams, FrameFormat, H263Params, RateControl};

    const WAIT: Duration = Duration::from_millis(200);

    fn open_device(options: LoopbackOptions) -> LoopbackDevice {
        let dev = LoopbackDevice::new(options);
        dev.open(&Codec::Avc(AvcParams::default())).unwrap();
        dev.configure(&DeviceSettings {
            frame: FrameFormat::default(),
            rate: RateControl::default(),
        })
        .unwrap();
        dev
    }

    fn small_options() -> LoopbackOptions {
        LoopbackOptions {
            input_size: Some(16),
            output_size: Some(16),
            ..LoopbackOptions::default()
        }
    }

    fn next(dev: &LoopbackDevice) -> DeviceEvent {
        dev.next_event(WAIT).unwrap().expect("expected a device event")
    }

    fn register_pair(dev: &LoopbackDevice) -> (SharedMemory, SharedMemory) {
        let input = SharedMemory::new(16);
        let output = SharedMemory::new(16);
        dev.register_buffer(PortIndex::Input, BufferIndex(0), &input).unwrap();
        dev.register_buffer(PortIndex::Output, BufferIndex(0), &output).unwrap();
        (input, output)
    }

    fn frame(len: usize, flags: BufferFlags) -> InputFrame {
        InputFrame {
            index: BufferIndex(0),
            offset: 0,
            filled_len: len,
            timestamp: Timestamp(33_000),
            flags,
        }
    }

    #[test]
    fn requirements_follow_frame_format() {
        let dev = open_device(LoopbackOptions::default());
        let req = dev.buffer_requirements(PortIndex::Input).unwrap();
        assert_eq!(req.buffer_size, FrameFormat::default().frame_size());
        assert_eq!(req.min_count, 2);
        let out = dev.buffer_requirements(PortIndex::Output).unwrap();
        assert_eq!(out.buffer_size, req.buffer_size / 2);
    }

    #[test]
    fn calls_before_open_fail() {
        let dev = LoopbackDevice::default();
        assert_eq!(dev.start(), Err(DeviceError::NotOpen));
    }

    #[test]
    fn encodes_when_both_sides_queued() {
        let dev = open_device(small_options());
        let (input, output) = register_pair(&dev);
        dev.start().unwrap();
        assert_eq!(next(&dev), DeviceEvent::StartDone);

        input.write(0, b"frame").unwrap();
        dev.submit_input(frame(5, BufferFlags::empty())).unwrap();
        assert_eq!(dev.next_event(Duration::from_millis(20)).unwrap(), None);

        dev.submit_output(BufferIndex(0)).unwrap();
        assert_eq!(
            next(&dev),
            DeviceEvent::InputDone {
                index: BufferIndex(0),
                status: CompletionStatus::Ok
            }
        );
        match next(&dev) {
            DeviceEvent::OutputDone(c) => {
                assert_eq!(c.filled_len, 5);
                assert_eq!(c.timestamp, Timestamp(33_000));
                assert!(c.flags.contains(BufferFlags::SYNC_FRAME | BufferFlags::END_OF_FRAME));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(output.read(0, 5).unwrap(), b"frame");
    }

    #[test]
    fn zero_length_eos_propagates() {
        let dev = open_device(small_options());
        register_pair(&dev);
        dev.start().unwrap();
        next(&dev);
        dev.submit_output(BufferIndex(0)).unwrap();
        dev.submit_input(frame(0, BufferFlags::EOS)).unwrap();
        next(&dev);
        match next(&dev) {
            DeviceEvent::OutputDone(c) => {
                assert_eq!(c.filled_len, 0);
                assert_eq!(c.flags, BufferFlags::EOS);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flush_returns_buffers_before_flush_done() {
        let dev = open_device(LoopbackOptions {
            auto_process: false,
            ..small_options()
        });
        register_pair(&dev);
        dev.start().unwrap();
        next(&dev);
        dev.submit_input(frame(4, BufferFlags::empty())).unwrap();
        dev.submit_output(BufferIndex(0)).unwrap();

        dev.flush(PortScope::Both).unwrap();
        assert_eq!(
            next(&dev),
            DeviceEvent::InputDone {
                index: BufferIndex(0),
                status: CompletionStatus::Flushed
            }
        );
        assert_eq!(next(&dev), DeviceEvent::FlushDone(PortIndex::Input));
        assert_eq!(
            next(&dev),
            DeviceEvent::OutputDone(OutputCompletion::flushed(BufferIndex(0)))
        );
        assert_eq!(next(&dev), DeviceEvent::FlushDone(PortIndex::Output));
        assert_eq!(dev.frames_encoded(), 0);
    }

    #[test]
    fn manual_pump_holds_frames() {
        let dev = open_device(LoopbackOptions {
            auto_process: false,
            ..small_options()
        });
        register_pair(&dev);
        dev.start().unwrap();
        next(&dev);
        dev.submit_input(frame(3, BufferFlags::empty())).unwrap();
        dev.submit_output(BufferIndex(0)).unwrap();
        assert_eq!(dev.queued_inputs(), 1);
        assert_eq!(dev.process_pending(), 1);
        assert_eq!(dev.queued_inputs(), 0);
    }

    #[test]
    fn paused_device_does_not_encode() {
        let dev = open_device(small_options());
        register_pair(&dev);
        dev.start().unwrap();
        dev.pause().unwrap();
        assert_eq!(next(&dev), DeviceEvent::StartDone);
        assert_eq!(next(&dev), DeviceEvent::PauseDone);
        dev.submit_input(frame(3, BufferFlags::empty())).unwrap();
        dev.submit_output(BufferIndex(0)).unwrap();
        assert_eq!(dev.frames_encoded(), 0);
        dev.resume().unwrap();
        assert_eq!(next(&dev), DeviceEvent::ResumeDone);
        assert_eq!(dev.frames_encoded(), 1);
    }

    #[test]
    fn codec_config_precedes_first_frame() {
        let dev = open_device(LoopbackOptions {
            emit_codec_config: true,
            input_size: Some(64),
            output_size: Some(64),
            ..LoopbackOptions::default()
        });
        dev.register_buffer(PortIndex::Output, BufferIndex(0), &SharedMemory::new(64))
            .unwrap();
        dev.start().unwrap();
        next(&dev);
        dev.submit_output(BufferIndex(0)).unwrap();
        match next(&dev) {
            DeviceEvent::OutputDone(c) => {
                assert!(c.flags.contains(BufferFlags::CODEC_CONFIG));
                assert!(c.filled_len > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn codec_header_needs_start_and_a_header_codec() {
        let dev = open_device(small_options());
        assert!(matches!(dev.codec_header(), Err(DeviceError::Hardware(_))));
        dev.start().unwrap();
        let header = dev.codec_header().unwrap();
        assert_eq!(&header[..5], &[0, 0, 0, 1, 0x67]);

        let h263 = LoopbackDevice::new(small_options());
        h263.open(&Codec::H263(H263Params::default())).unwrap();
        h263.start().unwrap();
        assert!(matches!(h263.codec_header(), Err(DeviceError::Unsupported(_))));
    }

    #[test]
    fn injected_faults() {
        let dev = open_device(small_options());
        dev.fail_next(DeviceOp::Start);
        assert!(matches!(dev.start(), Err(DeviceError::Hardware(_))));
        dev.swallow_next(DeviceOp::Start);
        dev.start().unwrap();
        assert_eq!(dev.next_event(Duration::from_millis(20)).unwrap(), None);

        dev.inject_hardware_error("thermal");
        assert_eq!(next(&dev), DeviceEvent::HardwareError("thermal".into()));
    }

    #[test]
    fn unregistered_buffers_are_rejected() {
        let dev = open_device(small_options());
        assert_eq!(
            dev.submit_output(BufferIndex(4)),
            Err(DeviceError::UnregisteredBuffer {
                port: PortIndex::Output,
                index: BufferIndex(4)
            })
        );
        let (_, _) = register_pair(&dev);
        assert!(matches!(
            dev.register_buffer(PortIndex::Input, BufferIndex(0), &SharedMemory::new(4)),
            Err(DeviceError::AlreadyRegistered { .. })
        ));
        assert!(matches!(
            dev.submit_input(frame(17, BufferFlags::empty())),
            Err(DeviceError::BadLength { .. })
        ));
        dev.unregister_buffer(PortIndex::Input, BufferIndex(0)).unwrap();
        assert_eq!(dev.registered_count(PortIndex::Input), 0);
    }

    #[test]
    fn close_emits_closed_and_rejects_calls() {
        let dev = open_device(small_options());
        dev.close();
        assert_eq!(next(&dev), DeviceEvent::Closed);
        assert_eq!(dev.start(), Err(DeviceError::NotOpen));
        dev.close();
        assert_eq!(dev.next_event(Duration::from_millis(10)).unwrap(), None);
    }
}
