//! The host context: the plugin table, the process lock and the OSC front.
//!
//! `HostContext` owns every [`PluginInstance`] behind one `parking_lot::Mutex`.
//! The audio thread holds it for a whole block in [`HostContext::process_block`];
//! control-plane calls take it briefly and deliver their callbacks and client OSC
//! only after releasing it.
//!
//! OSC traffic never takes the lock. The receive thread routes each message
//! into the addressed plugin's inbox and the idle tick applies it.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::backend::{BridgeBackend, LoadRequest, LoadedBackend};
use crate::callback::{CallbackKind, HostCallback};
use crate::error::{PluginError, Result};
use crate::instance::{wait_for_ui, MessageSource, Outbox, PluginInstance, PluginShared};
use crate::options::HostOptions;
use crate::peaks::PeakMeters;
use crate::ports::PortBuffers;
use crate::protocol::{plugin_id_from_path, plugin_path, BridgeMessage, HOST_PATH};
use crate::state::{HostState, PluginState};
use crate::transport::{parse_url, OscSender, OscServer};
use crate::types::{CustomDataType, PluginHints, PluginId, PluginInfo};

/// External audio and MIDI for one block, called under the process lock.
pub trait BlockIo {
    /// Fills inputs, control and MIDI events of one plugin.
    fn read(&mut self, id: PluginId, ports: &mut PortBuffers, offset: usize, frames: usize);

    /// Takes the rendered outputs and MIDI of one plugin.
    fn write(&mut self, id: PluginId, ports: &PortBuffers, offset: usize, frames: usize);
}

/// Silent inputs, discarded outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentIo;

impl BlockIo for SilentIo {
    fn read(&mut self, _id: PluginId, ports: &mut PortBuffers, offset: usize, frames: usize) {
        for channel in &mut ports.audio_in {
            let end = (offset + frames).min(channel.len());
            let start = offset.min(end);
            channel[start..end].fill(0.0);
        }
    }

    fn write(&mut self, _id: PluginId, _ports: &PortBuffers, _offset: usize, _frames: usize) {}
}

/// A control client attached through `/plinth/register`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ControlClient {
    url: String,
    addr: SocketAddr,
    synced: bool,
}

/// State reachable from every thread without the process lock.
pub struct HostShared {
    options: HostOptions,
    peaks: Arc<PeakMeters>,
    plugins: RwLock<Vec<Option<Arc<PluginShared>>>>,
    clients: Mutex<Vec<ControlClient>>,
    callback: RwLock<Option<HostCallback>>,
    last_error: Mutex<String>,
}

impl HostShared {
    fn new(options: HostOptions) -> Self {
        let capacity = options.max_plugins;
        Self {
            peaks: Arc::new(PeakMeters::new(capacity)),
            plugins: RwLock::new(vec![None; capacity]),
            clients: Mutex::new(Vec::new()),
            callback: RwLock::new(None),
            last_error: Mutex::new(String::new()),
            options,
        }
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn peaks(&self) -> &Arc<PeakMeters> {
        &self.peaks
    }

    pub fn plugin(&self, id: PluginId) -> Option<Arc<PluginShared>> {
        self.plugins.read().get(id.index()).cloned().flatten()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn set_error(&self, err: &PluginError) {
        tracing::error!("{err}");
        *self.last_error.lock() = err.to_string();
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.set_error(e);
        }
        result
    }

    /// Routes one decoded datagram. Runs on the OSC thread.
    pub fn dispatch(&self, prefix: &str, from: SocketAddr, msg: BridgeMessage) {
        if prefix == HOST_PATH {
            self.dispatch_host(from, msg);
            return;
        }
        let Some(plugin) = plugin_id_from_path(prefix).and_then(|id| self.plugin(PluginId(id))) else {
            tracing::warn!("no plugin at '{prefix}', dropping '{}'", msg.method());
            return;
        };

        let from_bridge = plugin.bridge.endpoint.target() == Some(from);
        let from_ui = plugin.ui.endpoint.target() == Some(from);
        match msg {
            BridgeMessage::InputPeak { left, right } => self.peaks.set_input(plugin.id, [left, right]),
            BridgeMessage::OutputPeak { left, right } => self.peaks.set_output(plugin.id, [left, right]),
            msg if msg.is_bridge_report() => {
                plugin.post_message(MessageSource::Bridge, msg);
            }
            BridgeMessage::Update(url) => {
                if !plugin.ui_spawned() || from_bridge || self.is_client(from) {
                    tracing::warn!("ignoring GUI update for plugin {} from {from}", plugin.id);
                    return;
                }
                // Set right away so a pending show_gui stops waiting.
                if let Err(e) = plugin.ui.endpoint.set_target(&url) {
                    tracing::warn!("bad GUI url '{url}': {e}");
                    return;
                }
                plugin.post_message(MessageSource::Ui, BridgeMessage::Update(url));
            }
            msg => {
                let source = if from_bridge {
                    MessageSource::Bridge
                } else if from_ui || msg == BridgeMessage::Exiting {
                    MessageSource::Ui
                } else {
                    MessageSource::Client
                };
                plugin.post_message(source, msg);
            }
        }
    }

    fn is_client(&self, addr: SocketAddr) -> bool {
        self.clients.lock().iter().any(|c| c.addr == addr)
    }

    fn dispatch_host(&self, from: SocketAddr, msg: BridgeMessage) {
        match msg {
            BridgeMessage::Register(url) => match parse_url(&url) {
                Ok((addr, _)) => {
                    let mut clients = self.clients.lock();
                    clients.retain(|c| c.addr != addr);
                    clients.push(ControlClient {
                        url,
                        addr,
                        synced: false,
                    });
                    tracing::info!("control client registered at {addr}");
                }
                Err(e) => tracing::warn!("bad client url '{url}': {e}"),
            },
            BridgeMessage::Unregister => {
                let mut clients = self.clients.lock();
                let before = clients.len();
                clients.retain(|c| c.addr != from);
                if clients.len() != before {
                    tracing::info!("control client at {from} unregistered");
                }
            }
            other => tracing::warn!("unexpected '{}' on {HOST_PATH}", other.method()),
        }
    }

    fn deliver(&self, sender: Option<&OscSender>, mut outbox: Outbox) {
        if let Some(sender) = sender {
            let clients = self.clients.lock().clone();
            for (id, msg) in outbox.clients.drain(..) {
                let path = plugin_path(id.0);
                for client in &clients {
                    if let Err(e) = sender.send(client.addr, &path, &msg) {
                        tracing::warn!("send to client {} failed: {e}", client.url);
                    }
                }
            }
        }
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            for (id, cb) in outbox.callbacks {
                callback(cb.kind, id, cb.value1, cb.value2, cb.value3);
            }
        }
    }
}

/// One occupied slot: the plugin and its block buffers.
pub struct PluginSlot {
    pub instance: PluginInstance,
    pub ports: PortBuffers,
    generation: u64,
}

impl PluginSlot {
    /// Resizes the buffers after the plugin changed shape.
    fn sync_ports(&mut self, buffer_size: usize) {
        if self.generation != self.instance.generation() {
            self.ports.resize(
                self.instance.audio_in_count(),
                self.instance.audio_out_count(),
                buffer_size,
            );
            self.generation = self.instance.generation();
        }
    }
}

enum Slot {
    Free,
    /// Being loaded outside the lock.
    Reserved,
    Used(Box<PluginSlot>),
}

/// The slot table, also the id allocator.
pub struct PluginTable {
    slots: Vec<Slot>,
}

impl PluginTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
        }
    }

    fn reserve(&mut self) -> Option<PluginId> {
        let index = self.slots.iter().position(|s| matches!(s, Slot::Free))?;
        self.slots[index] = Slot::Reserved;
        Some(PluginId(index as u16))
    }

    fn get_mut(&mut self, id: PluginId) -> Option<&mut PluginSlot> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Used(slot)) => Some(slot),
            _ => None,
        }
    }

    fn get(&self, id: PluginId) -> Option<&PluginSlot> {
        match self.slots.get(id.index()) {
            Some(Slot::Used(slot)) => Some(slot),
            _ => None,
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut PluginSlot> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Used(slot) => Some(slot.as_mut()),
            _ => None,
        })
    }

    fn iter(&self) -> impl Iterator<Item = &PluginSlot> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Used(slot) => Some(slot.as_ref()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct HostContext {
    shared: Arc<HostShared>,
    table: Mutex<PluginTable>,
    sender: Option<OscSender>,
    server: Option<OscServer>,
}

impl HostContext {
    /// A context without an OSC server. Bridged plugins and GUI bridges are
    /// unavailable.
    pub fn new(options: HostOptions) -> Result<Self> {
        options.validate()?;
        let table = Mutex::new(PluginTable::new(options.max_plugins));
        Ok(Self {
            shared: Arc::new(HostShared::new(options)),
            table,
            sender: None,
            server: None,
        })
    }

    /// A context listening for OSC on `options.osc_bind`.
    pub fn with_osc(options: HostOptions) -> Result<Self> {
        let mut context = Self::new(options)?;
        let shared = Arc::clone(&context.shared);
        let server = OscServer::bind(
            &context.shared.options.osc_bind,
            Box::new(move |prefix, from, msg| shared.dispatch(prefix, from, msg)),
        )?;
        context.sender = Some(server.sender());
        context.server = Some(server);
        Ok(context)
    }

    pub fn shared(&self) -> &Arc<HostShared> {
        &self.shared
    }

    pub fn options(&self) -> &HostOptions {
        &self.shared.options
    }

    pub fn peaks(&self) -> &Arc<PeakMeters> {
        &self.shared.peaks
    }

    pub fn set_callback(&self, callback: Option<HostCallback>) {
        *self.shared.callback.write() = callback;
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    /// URL of the OSC server, or `None` without one.
    pub fn server_url(&self) -> Option<String> {
        self.server.as_ref().map(|s| s.url(HOST_PATH))
    }

    /// URL a plugin's bridges and GUIs talk to.
    pub fn plugin_url(&self, id: PluginId) -> Option<String> {
        self.server.as_ref().map(|s| s.url(&plugin_path(id.0)))
    }

    pub fn plugin_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn max_plugins(&self) -> usize {
        self.shared.options.max_plugins
    }

    /// `name`, or `name (2)`, `name (3)` and so on when it is taken.
    pub fn unique_name(&self, name: &str) -> String {
        let table = self.table.lock();
        let taken = |candidate: &str| table.iter().any(|s| s.instance.name() == candidate);
        if !taken(name) {
            return name.to_string();
        }
        (2..)
            .map(|n| format!("{name} ({n})"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    // -----------------------------------------------------------------------
    // Add / remove
    // -----------------------------------------------------------------------

    pub fn add_plugin(&self, request: LoadRequest) -> Result<PluginId> {
        let result = self.try_add_plugin(request);
        self.shared.record(result)
    }

    fn try_add_plugin(&self, request: LoadRequest) -> Result<PluginId> {
        let id = self
            .table
            .lock()
            .reserve()
            .ok_or(PluginError::NoFreeSlot(self.shared.options.max_plugins))?;

        match self.load_into(id, &request) {
            Ok(slot) => {
                let mut outbox = Outbox::new();
                {
                    let mut table = self.table.lock();
                    table.slots[id.index()] = Slot::Used(Box::new(slot));
                }
                outbox.callback(id, CallbackKind::ReloadAll, 0, 0, 0.0);
                self.shared.deliver(self.sender.as_ref(), outbox);
                Ok(id)
            }
            Err(e) => {
                self.shared.plugins.write()[id.index()] = None;
                self.table.lock().slots[id.index()] = Slot::Free;
                Err(e)
            }
        }
    }

    /// Loads and reloads a plugin outside the process lock.
    fn load_into(&self, id: PluginId, request: &LoadRequest) -> Result<PluginSlot> {
        let options = &self.shared.options;
        let shared = Arc::new(PluginShared::new(id));
        let url = self.plugin_url(id).unwrap_or_default();
        shared.bridge.endpoint.set(plugin_path(id.0), url.clone());
        shared.ui.endpoint.set(plugin_path(id.0), url.clone());
        self.shared.plugins.write()[id.index()] = Some(Arc::clone(&shared));

        let backend = if request.bridged {
            if self.server.is_none() {
                return Err(PluginError::Bridge("bridged plugins need the OSC server".into()));
            }
            LoadedBackend::Bridge(BridgeBackend::spawn(
                request,
                &options.bridge_paths,
                &url,
                Arc::clone(&shared.bridge),
            )?)
        } else {
            LoadedBackend::load(request, options)?
        };

        let base = request
            .name
            .clone()
            .unwrap_or_else(|| backend.as_backend().info().name);
        let name = self.unique_name(if base.is_empty() { &request.label } else { &base });
        let mut instance = PluginInstance::new(shared, backend, request, name, options, Arc::clone(&self.shared.peaks));

        // Reload notifications are replaced by the single ReloadAll of the caller.
        let mut discard = Outbox::new();
        instance.reload(&mut discard)?;
        if !request.bridged {
            instance.set_active(true, false, false, &mut discard);
        }
        tracing::info!("loaded {} '{}' as plugin {id}", request.kind, instance.name());

        let ports = PortBuffers::new(
            instance.audio_in_count(),
            instance.audio_out_count(),
            options.buffer_size,
        );
        Ok(PluginSlot {
            generation: instance.generation(),
            instance,
            ports,
        })
    }

    pub fn remove_plugin(&self, id: PluginId) -> Result<()> {
        let result = self.try_remove_plugin(id);
        self.shared.record(result)
    }

    fn try_remove_plugin(&self, id: PluginId) -> Result<()> {
        let (removed, shared) = {
            let mut table = self.table.lock();
            match table.slots.get_mut(id.index()) {
                Some(slot) if matches!(slot, Slot::Used(_)) => {
                    // Unregister before the slot can be reserved again.
                    let shared = self.shared.plugins.write()[id.index()].take();
                    (std::mem::replace(slot, Slot::Free), shared)
                }
                _ => return Err(PluginError::InvalidId(id.0)),
            }
        };
        if let Slot::Used(mut slot) = removed {
            slot.instance.close();
            if let (Some(sender), Some(shared)) = (self.sender.as_ref(), shared.as_ref()) {
                shared.bridge.flush(sender);
                shared.ui.flush(sender);
            }
            slot.instance.wait_for_exit();
            if let Some(shared) = shared.as_ref() {
                shared.bridge.clear();
                shared.ui.clear();
            }
            let mut outbox = Outbox::new();
            outbox.callback(id, CallbackKind::Quit, 0, 0, 0.0);
            self.shared.deliver(self.sender.as_ref(), outbox);
            tracing::info!("removed plugin {id}");
        }
        Ok(())
    }

    pub fn remove_all(&self) {
        let ids: Vec<PluginId> = self.table.lock().iter().map(|s| s.instance.id()).collect();
        for id in ids {
            let _ = self.remove_plugin(id);
        }
    }

    // -----------------------------------------------------------------------
    // Control plane
    // -----------------------------------------------------------------------

    /// Runs `f` on one plugin under the process lock, then delivers what it
    /// queued. Errors are recorded as the last error.
    pub fn with_plugin<R>(
        &self,
        id: PluginId,
        f: impl FnOnce(&mut PluginInstance, &mut Outbox) -> Result<R>,
    ) -> Result<R> {
        let mut outbox = Outbox::new();
        let result = {
            let mut table = self.table.lock();
            match table.get_mut(id) {
                Some(slot) => {
                    let result = f(&mut slot.instance, &mut outbox);
                    slot.sync_ports(self.shared.options.buffer_size);
                    result
                }
                None => Err(PluginError::InvalidId(id.0)),
            }
        };
        self.shared.deliver(self.sender.as_ref(), outbox);
        self.shared.record(result)
    }

    /// Read-only access under the process lock.
    pub fn inspect<R>(&self, id: PluginId, f: impl FnOnce(&PluginInstance) -> R) -> Result<R> {
        let table = self.table.lock();
        table
            .get(id)
            .map(|slot| f(&slot.instance))
            .ok_or(PluginError::InvalidId(id.0))
    }

    pub fn reload(&self, id: PluginId) -> Result<()> {
        self.with_plugin(id, |p, outbox| p.reload(outbox))
    }

    pub fn set_parameter_value(&self, id: PluginId, index: usize, value: f32) -> Result<f32> {
        self.with_plugin(id, |p, outbox| p.set_parameter_value(index, value, true, true, false, outbox))
    }

    pub fn set_parameter_midi_channel(&self, id: PluginId, index: usize, channel: u8) -> Result<()> {
        self.with_plugin(id, |p, outbox| p.set_parameter_midi_channel(index, channel, false, outbox))
    }

    pub fn set_parameter_midi_cc(&self, id: PluginId, index: usize, cc: i16) -> Result<()> {
        self.with_plugin(id, |p, outbox| p.set_parameter_midi_cc(index, cc, false, outbox))
    }

    pub fn set_program(&self, id: PluginId, index: i32) -> Result<()> {
        self.with_plugin(id, |p, outbox| p.set_program(index, true, true, false, outbox))
    }

    pub fn set_midi_program(&self, id: PluginId, index: i32) -> Result<()> {
        self.with_plugin(id, |p, outbox| p.set_midi_program(index, true, true, false, outbox))
    }

    pub fn set_custom_data(&self, id: PluginId, kind: CustomDataType, key: &str, value: &str) -> Result<()> {
        self.with_plugin(id, |p, _| p.set_custom_data(kind, key, value, true))
    }

    pub fn set_chunk_data(&self, id: PluginId, data: &[u8]) -> Result<()> {
        self.with_plugin(id, |p, _| p.set_chunk_data(data))
    }

    pub fn chunk_data(&self, id: PluginId) -> Result<Vec<u8>> {
        self.with_plugin(id, |p, _| p.chunk_data())
    }

    pub fn set_active(&self, id: PluginId, active: bool) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.set_active(active, true, false, outbox);
            Ok(())
        })
    }

    pub fn set_dry_wet(&self, id: PluginId, value: f32) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.set_dry_wet(value, true, false, outbox);
            Ok(())
        })
    }

    pub fn set_volume(&self, id: PluginId, value: f32) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.set_volume(value, true, false, outbox);
            Ok(())
        })
    }

    pub fn set_balance_left(&self, id: PluginId, value: f32) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.set_balance_left(value, true, false, outbox);
            Ok(())
        })
    }

    pub fn set_balance_right(&self, id: PluginId, value: f32) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.set_balance_right(value, true, false, outbox);
            Ok(())
        })
    }

    pub fn set_enabled(&self, id: PluginId, enabled: bool) -> Result<()> {
        self.with_plugin(id, |p, _| {
            p.set_enabled(enabled);
            Ok(())
        })
    }

    pub fn send_midi_note(&self, id: PluginId, channel: u8, note: u8, velocity: u8) -> Result<()> {
        self.with_plugin(id, |p, outbox| {
            p.send_midi_single_note(channel, note, velocity, true, true, false, outbox)
        })
    }

    pub fn send_all_notes_off(&self, id: PluginId) -> Result<()> {
        self.with_plugin(id, |p, _| {
            p.send_midi_all_notes_off();
            Ok(())
        })
    }

    pub fn parameter_value(&self, id: PluginId, index: usize) -> Result<f32> {
        self.inspect(id, |p| p.parameter_value(index))?
            .ok_or(PluginError::InvalidParameter(index as i32))
    }

    pub fn parameter_count(&self, id: PluginId) -> Result<usize> {
        self.inspect(id, PluginInstance::parameter_count)
    }

    pub fn program_count(&self, id: PluginId) -> Result<usize> {
        self.inspect(id, |p| p.programs().count())
    }

    pub fn current_program(&self, id: PluginId) -> Result<i32> {
        self.inspect(id, |p| p.programs().current)
    }

    pub fn midi_program_count(&self, id: PluginId) -> Result<usize> {
        self.inspect(id, |p| p.midi_programs().count())
    }

    pub fn plugin_name(&self, id: PluginId) -> Result<String> {
        self.inspect(id, |p| p.name().to_string())
    }

    pub fn plugin_info(&self, id: PluginId) -> Result<PluginInfo> {
        self.inspect(id, |p| p.info().clone())
    }

    pub fn plugin_hints(&self, id: PluginId) -> Result<PluginHints> {
        self.inspect(id, PluginInstance::hints)
    }

    pub fn input_peak(&self, id: PluginId, channel: usize) -> f32 {
        self.shared.peaks.input(id, channel)
    }

    pub fn output_peak(&self, id: PluginId, channel: usize) -> f32 {
        self.shared.peaks.output(id, channel)
    }

    /// Shows or hides a plugin GUI. A GUI bridge that does not answer in time is
    /// logged and otherwise ignored.
    pub fn show_gui(&self, id: PluginId, show: bool) -> Result<()> {
        let url = self.plugin_url(id).unwrap_or_default();
        let options = &self.shared.options;
        let wait = self.with_plugin(id, |p, outbox| p.show_gui(show, options, &url, outbox))?;
        if let Some(channel) = wait {
            if let Err(e) = wait_for_ui(&channel, options) {
                tracing::warn!("plugin {id}: {e}; continuing without GUI");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Real-time and idle
    // -----------------------------------------------------------------------

    /// Runs every enabled plugin for one block. Holds the process lock throughout.
    pub fn process_block(&self, io: &mut dyn BlockIo, frames: usize, offset: usize) {
        let mut table = self.table.lock();
        for slot in table.iter_mut() {
            if !slot.instance.is_enabled() {
                continue;
            }
            let id = slot.instance.id();
            slot.ports.midi_out.clear();
            io.read(id, &mut slot.ports, offset, frames);
            slot.instance.process(&mut slot.ports, frames, offset);
            io.write(id, &slot.ports, offset, frames);
            slot.ports.clear_events();
        }
    }

    /// One idle tick: postponed events, OSC inboxes, bridges, GUIs and newly
    /// registered clients.
    pub fn idle(&self) {
        let mut outbox = Outbox::new();
        let mut new_clients: Vec<SocketAddr> = Vec::new();
        {
            let mut clients = self.shared.clients.lock();
            for client in clients.iter_mut().filter(|c| !c.synced) {
                client.synced = true;
                new_clients.push(client.addr);
            }
        }

        let mut initial: Vec<(PluginId, BridgeMessage)> = Vec::new();
        {
            let mut table = self.table.lock();
            let buffer_size = self.shared.options.buffer_size;
            for slot in table.iter_mut() {
                slot.instance.idle(self.sender.as_ref(), &mut outbox);
                slot.sync_ports(buffer_size);
                if !new_clients.is_empty() {
                    let id = slot.instance.id();
                    initial.extend(slot.instance.state_messages().into_iter().map(|m| (id, m)));
                }
            }
        }

        if let Some(sender) = self.sender.as_ref() {
            for addr in &new_clients {
                for (id, msg) in &initial {
                    if let Err(e) = sender.send(*addr, &plugin_path(id.0), msg) {
                        tracing::warn!("initial state to {addr} failed: {e}");
                        break;
                    }
                }
            }
        }
        self.shared.deliver(self.sender.as_ref(), outbox);
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn save_state(&self) -> HostState {
        let mut table = self.table.lock();
        HostState {
            plugins: table
                .iter_mut()
                .map(|slot| PluginState::capture(&mut slot.instance))
                .collect(),
        }
    }

    /// Adds every saved plugin and restores its settings. Plugins that fail to
    /// load are skipped and recorded as the last error.
    pub fn load_state(&self, state: &HostState) -> Vec<PluginId> {
        let mut ids = Vec::with_capacity(state.plugins.len());
        for saved in &state.plugins {
            let Ok(id) = self.add_plugin(saved.request()) else {
                continue;
            };
            if self.with_plugin(id, |p, outbox| saved.apply(p, outbox)).is_ok() {
                ids.push(id);
            }
        }
        ids
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.remove_all();
        if let Some(server) = self.server.as_mut() {
            server.shutdown();
        }
    }
}
