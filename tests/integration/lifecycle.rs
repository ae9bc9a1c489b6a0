//! Engine and plugin lifecycle: loading, removal, errors, callbacks and saved state.

use plinth::prelude::*;

use crate::helpers::*;

#[test]
fn test_engine_reports_configuration() {
    let engine = test_engine();
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.buffer_size(), TEST_BUFFER_SIZE);
    assert!(!engine.has_idle_thread());
    assert_eq!(engine.plugin_count(), 0);
}

#[test]
fn test_add_and_remove_plugins() {
    let engine = test_engine();
    let gain = engine.add_plugin(LoadRequest::internal("gain"));
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    assert_ne!(gain, PluginId::INVALID);
    assert_ne!(gain, sine);
    assert_eq!(engine.plugin_count(), 2);

    engine.remove_plugin(gain).unwrap();
    assert_eq!(engine.plugin_count(), 1);
    assert!(engine.remove_plugin(gain).is_err());

    engine.remove_all();
    assert_eq!(engine.plugin_count(), 0);
}

#[test]
fn test_removal_clears_plugin_endpoints() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    let plugin = engine.context().shared().plugin(id).unwrap();
    assert!(!plugin.bridge.endpoint.is_cleared());

    engine.remove_plugin(id).unwrap();
    for _ in 0..2 {
        assert!(plugin.bridge.endpoint.is_cleared());
        assert!(plugin.ui.endpoint.is_cleared());
        assert!(engine.remove_plugin(id).is_err());
    }

    let reused = engine.add_plugin(LoadRequest::internal("sine"));
    assert_eq!(reused, id);
    assert!(engine.context().shared().plugin(reused).is_some());
    assert!(plugin.bridge.endpoint.is_cleared());
}

#[test]
fn test_failed_load_sets_last_error() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("reverb"));
    assert_eq!(id, PluginId::INVALID);
    assert!(!engine.last_error().is_empty());

    assert!(engine.try_add_plugin(LoadRequest::internal("reverb")).is_err());
    assert_eq!(engine.plugin_count(), 0);
}

#[test]
fn test_plugin_table_is_bounded() {
    let engine = PlinthEngine::builder()
        .max_plugins(1)
        .idle_thread(false)
        .build()
        .unwrap();
    assert_ne!(engine.add_plugin(LoadRequest::internal("gain")), PluginId::INVALID);
    assert!(engine.try_add_plugin(LoadRequest::internal("gain")).is_err());
}

#[test]
fn test_names_are_unique() {
    let engine = test_engine();
    let a = engine.add_plugin(LoadRequest::internal("gain"));
    let b = engine.add_plugin(LoadRequest::internal("gain"));
    let first = engine.context().plugin_name(a).unwrap();
    let second = engine.context().plugin_name(b).unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_add_reports_reload_all() {
    let (engine, log) = recording_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    assert_eq!(recorded_kinds(&log, id), vec![CallbackKind::ReloadAll]);
}

#[test]
fn test_direct_edits_do_not_call_back() {
    let (engine, log) = recording_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    log.lock().unwrap().clear();

    engine.context().set_parameter_value(id, 0, 1.5).unwrap();
    engine.idle();
    assert!(recorded_kinds(&log, id).is_empty());
    assert_eq!(engine.context().parameter_value(id, 0).unwrap(), 1.5);
}

#[test]
fn test_values_are_clamped_to_range() {
    let engine = test_engine();
    let id = engine.add_plugin(LoadRequest::internal("gain"));
    let applied = engine.context().set_parameter_value(id, 0, 9.0).unwrap();
    assert_eq!(applied, 2.0);
}

#[test]
fn test_idle_thread_stops_on_drop() {
    let engine = PlinthEngine::builder().build().unwrap();
    assert!(engine.has_idle_thread());
    engine.add_plugin(LoadRequest::internal("sine"));
    drop(engine);
}

#[test]
fn test_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.plinth");

    let engine = test_engine();
    let gain = engine.add_plugin(LoadRequest::internal("gain"));
    let sine = engine.add_plugin(LoadRequest::internal("sine"));
    engine.context().set_parameter_value(gain, 0, 0.3).unwrap();
    engine.context().set_program(sine, 1).unwrap();
    engine.save_state(&path).unwrap();

    let restored = test_engine();
    let ids = restored.load_state(&path).unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(restored.context().parameter_value(ids[0], 0).unwrap(), 0.3);
    assert_eq!(restored.context().current_program(ids[1]).unwrap(), 1);
}

#[test]
fn test_missing_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine();
    assert!(engine.load_state(dir.path().join("absent")).is_err());
}
