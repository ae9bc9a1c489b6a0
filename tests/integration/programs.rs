//! Program lists and the parameter resync after a change.

use plinth::plugin::{ControlEvent, ControlEventKind};
use plinth::prelude::*;

use crate::helpers::*;

#[test]
fn test_programs_listed_after_load() {
    let engine = test_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    let ctx = engine.context();

    assert_eq!(ctx.program_count(sine).unwrap(), 2);
    assert_eq!(ctx.current_program(sine).unwrap(), 0);
    assert_eq!(ctx.parameter_value(sine, 0).unwrap(), 0.25);
}

#[test]
fn test_plugin_without_programs() {
    let engine = test_engine();
    let gain = engine.add_plugin(LoadRequest::internal("gain"));
    assert_eq!(engine.context().program_count(gain).unwrap(), 0);
    assert_eq!(engine.context().current_program(gain).unwrap(), -1);
}

#[test]
fn test_set_program_resyncs_values() {
    let engine = test_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    let ctx = engine.context();

    ctx.set_program(sine, 1).unwrap();
    assert_eq!(ctx.current_program(sine).unwrap(), 1);
    assert_eq!(ctx.parameter_value(sine, 0).unwrap(), 0.75);

    assert!(ctx.set_program(sine, 5).is_err());
    assert_eq!(ctx.current_program(sine).unwrap(), 1);
}

#[test]
fn test_program_change_from_control_port() {
    let (engine, log) = recording_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    log.lock().unwrap().clear();

    let mut io = TestIo::default();
    io.controls.push(ControlEvent {
        frame: 0,
        channel: 0,
        kind: ControlEventKind::MidiProgram { program: 1 },
    });
    engine.process(&mut io, TEST_BUFFER_SIZE, 0);

    // The change is postponed until the next idle tick.
    assert!(recorded_kinds(&log, sine).is_empty());
    engine.idle();

    assert_eq!(engine.context().current_program(sine).unwrap(), 1);
    assert_eq!(engine.context().parameter_value(sine, 0).unwrap(), 0.75);
    let recorded = log.lock().unwrap().clone();
    let change = recorded
        .iter()
        .find(|r| r.kind == CallbackKind::ProgramChanged)
        .expect("no program callback");
    assert_eq!(change.id, sine);
    assert_eq!(change.value1, 1);
}

#[test]
fn test_program_change_ignored_off_control_channel() {
    let engine = test_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));

    let mut io = TestIo::default();
    io.controls.push(ControlEvent {
        frame: 0,
        channel: 3,
        kind: ControlEventKind::MidiProgram { program: 1 },
    });
    engine.process(&mut io, TEST_BUFFER_SIZE, 0);
    engine.idle();
    assert_eq!(engine.context().current_program(sine).unwrap(), 0);
}
