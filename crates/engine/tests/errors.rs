//! Error escalation, synchronous rejection and allocation rollback.

mod common;

use std::sync::Arc;

use venc_common::{
    BufferFlags, ComponentState, EngineError, HeapAllocator, PortIndex, SharedMemory,
};
use venc_device::{DeviceOp, LoopbackDevice, LoopbackOptions};
use venc_engine::{ChannelCallbacks, Command, Component, ComponentEvent};

use common::{events, test_config, Fixture};

#[test]
fn first_hardware_error_is_reported_once() {
    let fx = Fixture::new();
    let _buffers = fx.to_executing();

    fx.device.inject_hardware_error("dma timeout");
    fx.device.inject_hardware_error("bus reset");
    let seen = fx.rec.settle();
    let errors: Vec<_> = events(&seen)
        .into_iter()
        .filter(|e| matches!(e, ComponentEvent::Error(_)))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], ComponentEvent::Error(EngineError::Hardware(msg)) if msg == "dma timeout"));

    assert_eq!(fx.component.state(), ComponentState::Invalid);
    assert_eq!(
        fx.component
            .send_command(Command::SetState(ComponentState::Idle)),
        Err(EngineError::InvalidState)
    );
    assert_eq!(
        fx.component.allocate_buffer(PortIndex::Input, 1).unwrap_err(),
        EngineError::InvalidState
    );
}

#[test]
fn buffers_outstanding_at_a_hardware_error_come_back_on_shutdown() {
    let fx = Fixture::with(
        test_config(),
        LoopbackOptions {
            auto_process: false,
            ..LoopbackOptions::default()
        },
    );
    let (_inputs, outputs) = fx.to_executing();
    for output in outputs {
        fx.component.submit_output(output).unwrap();
    }
    fx.device.inject_hardware_error("firmware crash");
    fx.rec.until(|n| matches!(n, venc_engine::Notification::Event(ComponentEvent::Error(_))));

    let Fixture {
        component, rec, ..
    } = fx;
    component.shutdown();
    let (_, _, filled) = common::split(rec.remaining());
    assert_eq!(filled.len(), 2);
}

#[test]
fn failed_device_start_escalates() {
    let fx = Fixture::new();
    let _buffers = fx.to_idle();
    fx.device.fail_next(DeviceOp::Start);

    let result = fx
        .component
        .send_command(Command::SetState(ComponentState::Executing));
    assert!(matches!(result, Err(EngineError::Hardware(_))));
    let seen = fx.rec.until(|n| matches!(n, venc_engine::Notification::Event(_)));
    assert!(matches!(
        events(&seen).as_slice(),
        [ComponentEvent::Error(EngineError::Hardware(_))]
    ));
    assert_eq!(fx.component.state(), ComponentState::Invalid);
}

#[test]
fn freeing_a_buffer_of_a_populated_port_raises_unpopulated() {
    let fx = Fixture::new();
    let (mut inputs, _outputs) = fx.to_idle();

    let buffer = inputs.remove(0);
    fx.component.free_buffer(PortIndex::Input, buffer).unwrap();
    let seen = fx.rec.settle();
    assert_eq!(
        events(&seen),
        vec![ComponentEvent::Error(EngineError::PortUnpopulated(
            PortIndex::Input
        ))]
    );
    // Not fatal.
    assert_eq!(fx.component.state(), ComponentState::Idle);
    assert!(!fx.component.port_definition(PortIndex::Input).populated);
}

#[test]
fn free_on_the_wrong_port_is_refused() {
    let fx = Fixture::new();
    let buffer = fx
        .component
        .allocate_buffer(
            PortIndex::Output,
            fx.component.port_definition(PortIndex::Output).buffer_size,
        )
        .unwrap();
    assert_eq!(
        fx.component.free_buffer(PortIndex::Input, buffer),
        Err(EngineError::BadPortIndex)
    );
}

#[test]
fn registration_failure_rolls_the_slot_back() {
    let fx = Fixture::new();
    let size = fx.component.port_definition(PortIndex::Input).buffer_size;

    fx.device.fail_next(DeviceOp::Register);
    let err = fx
        .component
        .allocate_buffer(PortIndex::Input, size)
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientResources(_)));
    assert_eq!(fx.component.port_definition(PortIndex::Input).allocated, 0);

    let buffer = fx.component.allocate_buffer(PortIndex::Input, size).unwrap();
    assert_eq!(buffer.index().get(), 0);
}

#[test]
fn port_allocation_is_all_or_nothing() {
    let device = Arc::new(LoopbackDevice::default());
    let allocator = Arc::new(HeapAllocator::with_budget(60_000));
    let (callbacks, _rx) = ChannelCallbacks::new();
    let component = Component::with_allocator(
        test_config(),
        device.clone(),
        allocator.clone(),
        Box::new(callbacks),
    )
    .unwrap();

    // Two 38016-byte input buffers do not fit in the budget.
    let err = component
        .allocate_port_buffers(PortIndex::Input)
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientResources(_)));
    assert_eq!(component.port_definition(PortIndex::Input).allocated, 0);
    assert_eq!(allocator.outstanding(), 0);
    assert_eq!(device.registered_count(PortIndex::Input), 0);
}

#[test]
fn allocation_checks_size_and_memory() {
    let fx = Fixture::new();
    let size = fx.component.port_definition(PortIndex::Output).buffer_size;

    assert!(matches!(
        fx.component.allocate_buffer(PortIndex::Output, size - 1),
        Err(EngineError::BadParameter(_))
    ));
    assert!(matches!(
        fx.component
            .use_existing_buffer(PortIndex::Output, size, SharedMemory::new(size / 2)),
        Err(EngineError::BadParameter(_))
    ));
    let buffer = fx
        .component
        .use_existing_buffer(PortIndex::Output, size, SharedMemory::new(size))
        .unwrap();
    assert_eq!(buffer.alloc_len(), size);
}

#[test]
fn allocation_outside_loaded_is_refused() {
    let fx = Fixture::new();
    let _buffers = fx.to_idle();
    let size = fx.component.port_definition(PortIndex::Input).buffer_size;
    assert_eq!(
        fx.component.allocate_buffer(PortIndex::Input, size).unwrap_err(),
        EngineError::InvalidState
    );
}

#[test]
fn submissions_are_checked_at_the_entry_point() {
    let fx = Fixture::new();
    let (mut inputs, mut outputs) = fx.to_idle();

    // Not streaming yet.
    let err = fx.component.submit_input(inputs.remove(0)).unwrap_err();
    assert_eq!(err.error, EngineError::InvalidState);
    inputs.push(err.into_buffer());

    fx.set_state(ComponentState::Executing);

    // Wrong port.
    let err = fx.component.submit_input(outputs.remove(0)).unwrap_err();
    assert_eq!(err.error, EngineError::BadPortIndex);
    outputs.push(err.into_buffer());

    // Payload past the end of the buffer.
    let mut input = inputs.remove(0);
    input.offset = input.alloc_len() - 4;
    input.filled_len = 8;
    input.flags = BufferFlags::END_OF_FRAME;
    let err = fx.component.submit_input(input).unwrap_err();
    assert!(matches!(err.error, EngineError::BadParameter(_)));
    assert_eq!(fx.component.stats().inputs_submitted, 0);
}
