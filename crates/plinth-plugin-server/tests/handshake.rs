//! End-to-end bridge tests: a real host context driving the bridge binary.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use plinth_plugin::protocol::HOST_PATH;
use plinth_plugin::{BridgeMessage, HostContext, HostOptions, LoadRequest, PluginHints, PluginId};

fn bridged_host() -> HostContext {
    let mut options = HostOptions::default();
    options.bridge_paths.plugin = env!("CARGO_BIN_EXE_plinth-bridge-plugin").into();
    options.idle_interval_ms = 10;
    HostContext::with_osc(options).unwrap()
}

/// Idles the host until `done` holds or five seconds pass.
fn idle_until(host: &HostContext, mut done: impl FnMut(&HostContext) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        host.idle();
        if done(host) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn add_bridged(host: &HostContext, label: &str) -> PluginId {
    let id = host
        .add_plugin(LoadRequest::internal(label).bridged(true))
        .unwrap();
    assert!(
        idle_until(host, |h| h.inspect(id, |p| p.is_active()).unwrap_or(false)),
        "bridge never finished its handshake"
    );
    id
}

#[test]
fn test_bridge_reports_layout() {
    let host = bridged_host();
    let id = add_bridged(&host, "gain");

    assert_eq!(host.parameter_count(id).unwrap(), 2);
    let hints = host.plugin_hints(id).unwrap();
    assert!(hints.contains(PluginHints::IS_BRIDGE));
}

#[test]
fn test_bridge_follows_program_changes() {
    let host = bridged_host();
    let id = add_bridged(&host, "sine");
    assert_eq!(host.program_count(id).unwrap(), 2);

    host.set_program(id, 1).unwrap();
    assert!(idle_until(&host, |h| h.parameter_value(id, 0).unwrap() == 0.75));
    assert_eq!(host.current_program(id).unwrap(), 1);
}

#[test]
fn test_bridge_parameter_round_trip() {
    let host = bridged_host();
    let id = add_bridged(&host, "gain");

    host.set_parameter_value(id, 0, 1.25).unwrap();
    assert_eq!(host.parameter_value(id, 0).unwrap(), 1.25);

    // The child applies edits silently, so nothing moves the value back.
    let mut ticks = 0;
    idle_until(&host, |_| {
        ticks += 1;
        ticks == 20
    });
    assert_eq!(host.parameter_value(id, 0).unwrap(), 1.25);
}

#[test]
fn test_redescribe_keeps_child_state() {
    let host = bridged_host();
    let id = add_bridged(&host, "sine");
    host.set_program(id, 1).unwrap();
    host.set_parameter_value(id, 0, 0.6).unwrap();
    let mut ticks = 0;
    idle_until(&host, |_| {
        ticks += 1;
        ticks == 10
    });

    // Ask the child to describe itself again, as after a host restart.
    let plugin = host.shared().plugin(id).unwrap();
    let child = plugin.bridge.endpoint.target().unwrap();
    let generation = host.inspect(id, |p| p.generation()).unwrap();
    let bytes = BridgeMessage::Update(host.plugin_url(id).unwrap())
        .encode(HOST_PATH)
        .unwrap();
    UdpSocket::bind("127.0.0.1:0").unwrap().send_to(&bytes, child).unwrap();
    assert!(
        idle_until(&host, |h| h.inspect(id, |p| p.generation()).unwrap() > generation),
        "child never described itself again"
    );

    assert_eq!(host.current_program(id).unwrap(), 1);
    assert_eq!(host.parameter_value(id, 0).unwrap(), 0.6);

    // Nothing was pushed back to reset the child.
    let mut ticks = 0;
    idle_until(&host, |_| {
        ticks += 1;
        ticks == 20
    });
    assert_eq!(host.current_program(id).unwrap(), 1);
    assert_eq!(host.parameter_value(id, 0).unwrap(), 0.6);
}

#[test]
fn test_remove_stops_bridge() {
    let host = bridged_host();
    let id = add_bridged(&host, "passthrough");
    assert_eq!(host.parameter_count(id).unwrap(), 0);
    let plugin = host.shared().plugin(id).unwrap();
    assert!(plugin.bridge.endpoint.has_target());

    host.remove_plugin(id).unwrap();
    assert_eq!(host.plugin_count(), 0);
    assert!(plugin.bridge.endpoint.is_cleared());
    assert!(plugin.ui.endpoint.is_cleared());
    assert!(host.remove_plugin(id).is_err());
    assert!(plugin.bridge.endpoint.is_cleared());
}
