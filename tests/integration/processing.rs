//! The real-time block: plugin output, host controllers and peak meters.

use approx::assert_relative_eq;
use plinth::plugin::{ControlEvent, MidiEvent};
use plinth::prelude::*;
use plinth::PluginHints;

use crate::helpers::tolerances::*;
use crate::helpers::*;

const CC_DRY_WET: u16 = 0x02;
const CC_VOLUME: u16 = 0x07;
const CC_ACTIVE: u16 = 0x0C;

fn run_block(engine: &PlinthEngine, io: &mut TestIo) {
    engine.process(io, TEST_BUFFER_SIZE, 0);
}

#[test]
fn test_passthrough_copies_input() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("passthrough"));
    let mut io = TestIo::with_input(0.5);
    run_block(&engine, &mut io);

    let out = io.output(id, 0);
    assert_eq!(out.len(), TEST_BUFFER_SIZE);
    assert!(out.iter().all(|s| (s - 0.5).abs() < FLOAT_EPSILON));
    assert!(io.output(id, 1).iter().all(|s| (s - 0.5).abs() < FLOAT_EPSILON));
}

#[test]
fn test_gain_follows_parameter() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    engine.context().set_parameter_value(id, 0, 2.0).unwrap();

    let mut io = TestIo::with_input(0.25);
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 0)[0], 0.5);

    engine.context().set_parameter_value(id, 1, 1.0).unwrap();
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 1)[TEST_BUFFER_SIZE - 1], -0.5);
}

#[test]
fn test_peaks_measured_per_block() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    engine.context().set_parameter_value(id, 0, 2.0).unwrap();

    let mut io = TestIo::with_input(0.25);
    run_block(&engine, &mut io);
    let [in_l, in_r] = engine.input_peaks(id);
    let [out_l, out_r] = engine.output_peaks(id);
    assert_relative_eq!(in_l, 0.25);
    assert_relative_eq!(in_r, 0.25);
    assert_relative_eq!(out_l, 0.5);
    assert_relative_eq!(out_r, 0.5);

    io.input_level = 0.0;
    run_block(&engine, &mut io);
    assert!(engine.output_peaks(id)[0] < SILENCE_THRESHOLD);
}

#[test]
fn test_dry_wet_mixes_input_back() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    let ctx = engine.context();
    assert!(ctx.plugin_hints(id).unwrap().contains(PluginHints::CAN_DRYWET));
    ctx.set_parameter_value(id, 0, 2.0).unwrap();
    ctx.set_dry_wet(id, 0.5).unwrap();

    let mut io = TestIo::with_input(0.5);
    run_block(&engine, &mut io);
    // 0.5 dry + 1.0 wet, half each
    assert_relative_eq!(io.output(id, 0)[0], 0.75);
}

#[test]
fn test_dry_wet_controller() {
    let (engine, log) = recording_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    engine.context().set_parameter_value(id, 0, 2.0).unwrap();
    log.lock().unwrap().clear();

    let mut io = TestIo::with_input(0.5);
    io.controls.push(ControlEvent::parameter(0, 0, CC_DRY_WET, 0.0));
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 0)[0], 0.5);

    engine.idle();
    assert!(recorded_kinds(&log, id).contains(&CallbackKind::ParameterChanged));
}

#[test]
fn test_volume() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    engine.context().set_volume(id, 0.5).unwrap();

    let mut io = TestIo::with_input(0.5);
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 0)[0], 0.25);

    io.controls.push(ControlEvent::parameter(0, 0, CC_VOLUME, 0.5));
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 0)[0], 0.5 * 0.635, epsilon = FLOAT_EPSILON);
}

#[test]
fn test_inactive_plugin_outputs_silence() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("passthrough"));
    engine.context().set_active(id, false).unwrap();

    let mut io = TestIo::with_input(0.5);
    run_block(&engine, &mut io);
    assert!(peak(io.output(id, 0)) < SILENCE_THRESHOLD);

    engine.context().set_active(id, true).unwrap();
    run_block(&engine, &mut io);
    assert_relative_eq!(io.output(id, 0)[0], 0.5);
}

#[test]
fn test_active_controller() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("passthrough"));

    let mut io = TestIo::with_input(0.5);
    io.controls.push(ControlEvent::parameter(0, 0, CC_ACTIVE, 0.0));
    run_block(&engine, &mut io);
    assert!(peak(io.output(id, 0)) < SILENCE_THRESHOLD);
    assert!(!engine.context().inspect(id, |p| p.is_active()).unwrap());
}

#[test]
fn test_disabled_plugin_skipped() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("passthrough"));
    engine.context().set_enabled(id, false).unwrap();

    let mut io = TestIo::with_input(0.5);
    run_block(&engine, &mut io);
    assert!(io.output(id, 0).is_empty());
}

#[test]
fn test_mapped_controller_drives_parameter() {
    let (engine, log) = recording_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    engine.context().set_parameter_midi_cc(id, 0, 20).unwrap();
    log.lock().unwrap().clear();

    let mut io = TestIo::with_input(0.5);
    io.controls.push(ControlEvent::parameter(0, 0, 20, 0.25));
    run_block(&engine, &mut io);
    assert_relative_eq!(engine.context().parameter_value(id, 0).unwrap(), 0.5);
    assert_relative_eq!(io.output(id, 0)[0], 0.25);

    engine.idle();
    let recorded = log.lock().unwrap().clone();
    let change = recorded
        .iter()
        .find(|r| r.kind == CallbackKind::ParameterChanged)
        .expect("no parameter callback");
    assert_eq!(change.value1, 0);
    assert_relative_eq!(change.value3, 0.5);
}

#[test]
fn test_injected_note_plays_synth() {
    let engine = test_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));

    let mut io = TestIo::default();
    run_block(&engine, &mut io);
    assert!(peak(io.output(sine, 0)) < SILENCE_THRESHOLD);

    engine.context().send_midi_note(sine, 0, 69, 100).unwrap();
    run_block(&engine, &mut io);
    let level = peak(io.output(sine, 0));
    assert!(level > SILENCE_THRESHOLD);
    assert!(level <= 0.25 + FLOAT_EPSILON);
}

#[test]
fn test_port_notes_reported_after_idle() {
    let (engine, log) = recording_engine();
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    log.lock().unwrap().clear();

    let mut io = TestIo::default();
    io.notes.push(MidiEvent::note_on(0, 0, 60, 90));
    run_block(&engine, &mut io);
    assert!(peak(io.output(sine, 0)) > SILENCE_THRESHOLD);

    engine.idle();
    assert_eq!(recorded_kinds(&log, sine), vec![CallbackKind::NoteOn]);
}
