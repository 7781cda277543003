//! Flush ordering and the flush/submit race.

mod common;

use venc_common::{CompletionStatus, ComponentState, PortIndex, PortScope};
use venc_device::{DeviceOp, LoopbackOptions};
use venc_engine::{Command, CompletedCommand, ComponentEvent};

use common::{events, fill, split, state_set, test_config, wait_until, Fixture};

fn manual() -> LoopbackOptions {
    LoopbackOptions {
        auto_process: false,
        ..LoopbackOptions::default()
    }
}

fn flushed(port: PortIndex) -> ComponentEvent {
    ComponentEvent::CommandComplete(CompletedCommand::Flush(port))
}

#[test]
fn flush_returns_buffers_in_submission_order() {
    let fx = Fixture::with(test_config(), manual());
    let (inputs, _outputs) = fx.to_executing();

    let mut submitted = Vec::new();
    for (n, mut input) in inputs.into_iter().enumerate() {
        fill(&mut input, &[n as u8; 16], n as i64);
        submitted.push(input.index());
        fx.component.submit_input(input).unwrap();
    }
    wait_until(|| fx.device.queued_inputs() == submitted.len());

    fx.component
        .send_command(Command::Flush(PortScope::Port(PortIndex::Input)))
        .unwrap();
    // The completion event comes after the last returned buffer.
    let (events, returned, filled) = split(fx.rec.until_event(&flushed(PortIndex::Input)));
    assert_eq!(events, vec![flushed(PortIndex::Input)]);
    assert!(filled.is_empty());
    let order: Vec<_> = returned.iter().map(|b| b.index()).collect();
    assert_eq!(order, submitted);
    assert!(returned
        .iter()
        .all(|b| b.status() == CompletionStatus::Flushed));

    // Nothing comes back twice.
    assert!(fx.rec.settle().is_empty());
    assert_eq!(fx.device.queued_inputs(), 0);
    assert_eq!(fx.device.frames_encoded(), 0);
}

#[test]
fn flush_both_completes_each_port() {
    let fx = Fixture::with(test_config(), manual());
    let (_inputs, outputs) = fx.to_executing();
    for output in outputs {
        fx.component.submit_output(output).unwrap();
    }

    fx.component
        .send_command(Command::Flush(PortScope::Both))
        .unwrap();
    let mut seen = fx.rec.until_outputs(2);
    seen.extend(fx.rec.settle());
    let (events, _, filled) = split(seen);
    assert_eq!(filled.len(), 2);
    assert!(filled.iter().all(|b| b.status() == CompletionStatus::Flushed));
    assert!(events.contains(&flushed(PortIndex::Input)));
    assert!(events.contains(&flushed(PortIndex::Output)));
    assert_eq!(events.len(), 2);
    assert_eq!(fx.component.stats().flushes, 1);
}

#[test]
fn flush_outside_streaming_completes_at_once() {
    let fx = Fixture::new();
    fx.component
        .send_command(Command::Flush(PortScope::Port(PortIndex::Output)))
        .unwrap();
    let seen = fx.rec.until_event(&flushed(PortIndex::Output));
    assert_eq!(events(&seen), vec![flushed(PortIndex::Output)]);
}

#[test]
fn submission_during_flush_is_refused() {
    let fx = Fixture::with(test_config(), manual());
    let (mut inputs, _outputs) = fx.to_executing();

    // The device returns its buffers but never reports flush-done, so the
    // input port stays mid-flush.
    fx.device.swallow_next(DeviceOp::Flush);
    fx.component.submit_input(inputs.remove(0)).unwrap();
    fx.component
        .send_command(Command::Flush(PortScope::Port(PortIndex::Input)))
        .unwrap();
    let (_, returned, _) = split(fx.rec.until_inputs(1));
    assert_eq!(returned[0].status(), CompletionStatus::Flushed);

    let again = returned.into_iter().next().unwrap();
    let index = again.index();
    fx.component.submit_input(again).unwrap();
    let (events, returned, _) = split(fx.rec.until_inputs(1));
    assert!(events.is_empty());
    assert_eq!(returned[0].index(), index);
    assert_eq!(returned[0].status(), CompletionStatus::FlushInProgress);
    assert_eq!(fx.device.queued_inputs(), 0);
}

#[test]
fn executing_to_idle_returns_everything_first() {
    let fx = Fixture::with(test_config(), manual());
    let (inputs, outputs) = fx.to_executing();
    for mut input in inputs {
        fill(&mut input, b"pending", 0);
        fx.component.submit_input(input).unwrap();
    }
    for output in outputs {
        fx.component.submit_output(output).unwrap();
    }

    let seen = fx.set_state(ComponentState::Idle);
    let (events, returned, filled) = split(seen);
    assert_eq!(events, vec![state_set(ComponentState::Idle)]);
    assert_eq!(returned.len(), 2);
    assert_eq!(filled.len(), 2);
    assert!(returned
        .iter()
        .chain(&filled)
        .all(|b| b.status() == CompletionStatus::Flushed));
    assert!(!fx.device.is_running());
    assert!(fx.component.pending().is_empty());
}

#[test]
fn submissions_during_a_pending_idle_are_refused() {
    let fx = Fixture::with(test_config(), manual());
    let (_inputs, outputs) = fx.to_executing();

    // Stop-done never arrives: Idle stays pending after the flush.
    fx.device.swallow_next(DeviceOp::Stop);
    fx.component
        .send_command(Command::SetState(ComponentState::Idle))
        .unwrap();
    assert!(fx.rec.settle().is_empty());
    assert_eq!(fx.component.state(), ComponentState::Executing);

    let output = outputs.into_iter().next().unwrap();
    fx.component.submit_output(output).unwrap();
    let (_, _, filled) = split(fx.rec.until_outputs(1));
    assert_eq!(filled[0].status(), CompletionStatus::Rejected);
}
