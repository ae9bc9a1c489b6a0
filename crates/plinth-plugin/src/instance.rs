//! One hosted plugin: the format-independent state around a backend.
//!
//! `PluginInstance` owns the backend and everything every format shares:
//! parameter clamping, program policy, internal parameters (active, dry/wet,
//! volume, balance), the real-time `process()` pass and the notifications sent
//! to GUIs, control clients and the embedder.
//!
//! Control-plane methods never call out directly. Callbacks and client OSC are
//! collected in an [`Outbox`] that the host context delivers once the process
//! lock is released. GUI messages go straight onto the UI bridge queue.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::backend::{BridgeEvent, LoadRequest, LoadedBackend, RunContext};
use crate::callback::{CallbackKind, PendingCallback};
use crate::error::{PluginError, Result};
use crate::events::{
    ExternalNote, ExternalNoteTable, PostEvent, PostEventKind, PostEventQueue, POST_EVENT_RESERVE,
};
use crate::midi::{
    ControlEventKind, MidiEvent, MidiEventVec, CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_BALANCE, CC_BREATH,
    CC_EFFECT_CONTROL_1, CC_VOLUME, MAX_MIDI_EVENTS, STATUS_NOTE_OFF, STATUS_NOTE_ON,
};
use crate::options::HostOptions;
use crate::peaks::{self, PeakMeters};
use crate::ports::PortBuffers;
use crate::process::{self as post, PostProcess};
use crate::program;
use crate::protocol::BridgeMessage;
use crate::supervisor::{BridgeProcess, BridgeState};
use crate::transport::{BridgeChannel, OscSender};
use crate::types::{
    internal_param, is_internal_key, CustomData, CustomDataType, MidiProgramTable, Parameter,
    ParameterHints, PluginHints, PluginId, PluginInfo, PluginType, PortGroup, ProgramTable,
};

pub const INBOX_SIZE: usize = 256;

/// Who sent a message addressed to a plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSource {
    /// The `plinth-bridge-plugin` child running this plugin.
    Bridge,
    /// An out-of-process GUI.
    Ui,
    /// A registered control client.
    Client,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InboxMessage {
    pub source: MessageSource,
    pub msg: BridgeMessage,
}

/// The part of a plugin reachable without the process lock.
pub struct PluginShared {
    pub id: PluginId,
    pub post_events: PostEventQueue,
    pub ext_notes: ExternalNoteTable,
    /// Channel to the plugin bridge child, if the plugin is bridged.
    pub bridge: Arc<BridgeChannel>,
    /// Channel to the GUI bridge child.
    pub ui: Arc<BridgeChannel>,
    /// Set while a GUI child of ours is running; only then is `/update` taken.
    ui_spawned: AtomicBool,
    inbox_tx: Sender<InboxMessage>,
    inbox_rx: Receiver<InboxMessage>,
}

impl PluginShared {
    pub fn new(id: PluginId) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(INBOX_SIZE);
        Self {
            id,
            post_events: PostEventQueue::new(),
            ext_notes: ExternalNoteTable::new(),
            bridge: Arc::new(BridgeChannel::default()),
            ui: Arc::new(BridgeChannel::default()),
            ui_spawned: AtomicBool::new(false),
            inbox_tx,
            inbox_rx,
        }
    }

    /// Hands an OSC message to the next idle tick.
    pub fn post_message(&self, source: MessageSource, msg: BridgeMessage) -> bool {
        match self.inbox_tx.try_send(InboxMessage { source, msg }) {
            Ok(()) => true,
            Err(TrySendError::Full(m)) => {
                tracing::warn!("plugin {} inbox full, dropping '{}'", self.id, m.msg.method());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn ui_spawned(&self) -> bool {
        self.ui_spawned.load(Ordering::Acquire)
    }

    pub fn set_ui_spawned(&self, spawned: bool) {
        self.ui_spawned.store(spawned, Ordering::Release);
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox_rx.len()
    }
}

/// Deliveries deferred until the process lock is released.
#[derive(Debug, Default)]
pub struct Outbox {
    pub callbacks: Vec<(PluginId, PendingCallback)>,
    /// Messages for every registered control client, under the plugin's path.
    pub clients: Vec<(PluginId, BridgeMessage)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&mut self, id: PluginId, kind: CallbackKind, value1: i32, value2: i32, value3: f64) {
        self.callbacks
            .push((id, PendingCallback::new(kind, value1, value2, value3)));
    }

    pub fn client(&mut self, id: PluginId, msg: BridgeMessage) {
        self.clients.push((id, msg));
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.clients.is_empty()
    }

    pub fn append(&mut self, other: &mut Outbox) {
        self.callbacks.append(&mut other.callbacks);
        self.clients.append(&mut other.clients);
    }
}

/// Which listeners hear about a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Sinks {
    gui: bool,
    osc: bool,
    callback: bool,
}

impl Sinks {
    const fn new(gui: bool, osc: bool, callback: bool) -> Self {
        Self { gui, osc, callback }
    }
}

pub struct PluginInstance {
    shared: Arc<PluginShared>,
    backend: LoadedBackend,
    peaks: Arc<PeakMeters>,

    name: String,
    filename: PathBuf,
    label: String,
    info: PluginInfo,
    hints: PluginHints,
    generation: u64,

    audio_ins: PortGroup,
    audio_outs: PortGroup,
    midi_ins: PortGroup,
    midi_outs: PortGroup,
    params: Vec<Parameter>,
    programs: ProgramTable,
    midi_programs: MidiProgramTable,
    custom_data: Vec<CustomData>,

    enabled: bool,
    active: bool,
    was_active: bool,
    post: PostProcess,
    control_channel: u8,
    max_parameters: usize,
    ctrl_bank: u16,

    events: MidiEventVec,
    automation: Vec<(u32, f32)>,
    ui_process: Option<BridgeProcess>,
    gui_visible: bool,
}

impl PluginInstance {
    /// Wraps a loaded backend. Call [`reload`](Self::reload) before the first
    /// `process()`.
    pub fn new(
        shared: Arc<PluginShared>,
        backend: LoadedBackend,
        request: &LoadRequest,
        name: impl Into<String>,
        options: &HostOptions,
        peaks: Arc<PeakMeters>,
    ) -> Self {
        let info = backend.as_backend().info();
        Self {
            shared,
            backend,
            peaks,
            name: name.into(),
            filename: request.filename.clone(),
            label: request.label.clone(),
            info,
            hints: PluginHints::empty(),
            generation: 0,
            audio_ins: PortGroup::default(),
            audio_outs: PortGroup::default(),
            midi_ins: PortGroup::default(),
            midi_outs: PortGroup::default(),
            params: Vec::new(),
            programs: ProgramTable::default(),
            midi_programs: MidiProgramTable::default(),
            custom_data: Vec::new(),
            enabled: true,
            active: false,
            was_active: false,
            post: PostProcess::default(),
            control_channel: options.control_channel.min(15),
            max_parameters: options.max_parameters,
            ctrl_bank: 0,
            events: MidiEventVec::with_capacity(MAX_MIDI_EVENTS),
            automation: Vec::with_capacity(MAX_MIDI_EVENTS),
            ui_process: None,
            gui_visible: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> PluginId {
        self.shared.id
    }

    pub fn shared(&self) -> &Arc<PluginShared> {
        &self.shared
    }

    pub fn kind(&self) -> PluginType {
        self.backend.as_backend().kind()
    }

    pub fn backend(&self) -> &LoadedBackend {
        &self.backend
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn hints(&self) -> PluginHints {
        self.hints
    }

    /// Bumped on every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn audio_in_count(&self) -> usize {
        self.audio_ins.count()
    }

    pub fn audio_out_count(&self) -> usize {
        self.audio_outs.count()
    }

    pub fn midi_in_count(&self) -> usize {
        self.midi_ins.count()
    }

    pub fn midi_out_count(&self) -> usize {
        self.midi_outs.count()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn parameter(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn parameter_value(&self, index: usize) -> Option<f32> {
        self.params.get(index).map(|p| p.value)
    }

    pub fn programs(&self) -> &ProgramTable {
        &self.programs
    }

    pub fn midi_programs(&self) -> &MidiProgramTable {
        &self.midi_programs
    }

    /// Persistent custom data; protocol-internal keys are left out.
    pub fn custom_data(&self) -> &[CustomData] {
        &self.custom_data
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn dry_wet(&self) -> f32 {
        self.post.dry_wet
    }

    pub fn volume(&self) -> f32 {
        self.post.volume
    }

    pub fn balance_left(&self) -> f32 {
        self.post.balance_left
    }

    pub fn balance_right(&self) -> f32 {
        self.post.balance_right
    }

    pub fn is_gui_visible(&self) -> bool {
        self.gui_visible
    }

    pub fn bridge_state(&self) -> Option<BridgeState> {
        match &self.backend {
            LoadedBackend::Bridge(b) => Some(b.state()),
            _ => None,
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    /// Re-queries the backend and rebuilds ports, parameters, programs and hints.
    ///
    /// Callers hold the process lock. The port buffers of this plugin have to be
    /// resized afterwards; [`generation`](Self::generation) tells them when.
    pub fn reload(&mut self, outbox: &mut Outbox) -> Result<()> {
        let mut layout = self.backend.as_backend_mut().layout()?;
        self.info = self.backend.as_backend().info();

        if layout.parameters.len() > self.max_parameters {
            tracing::warn!(
                "{}: exposing {} of {} parameters",
                self.name,
                self.max_parameters,
                layout.parameters.len()
            );
            layout.parameters.truncate(self.max_parameters);
        }
        for (i, param) in layout.parameters.iter_mut().enumerate() {
            param.data.index = i as i32;
            param.ranges = param.ranges.fixed();
            param.value = param.ranges.clamp(param.value);
        }

        let mut hints = PluginHints::from_bits_truncate(
            layout.hints.bits()
                & (PluginHints::HAS_GUI | PluginHints::IS_SYNTH | PluginHints::USES_CHUNKS).bits(),
        );
        let (ins, outs) = (layout.audio_ins.count(), layout.audio_outs.count());
        hints.set(PluginHints::IS_BRIDGE, self.backend.is_bridge());
        hints.set(PluginHints::CAN_DRYWET, outs > 0 && (ins == outs || ins == 1));
        hints.set(PluginHints::CAN_VOLUME, outs > 0);
        hints.set(PluginHints::CAN_BALANCE, outs >= 2 && outs % 2 == 0);

        let old_programs = self.programs.count();
        let old_midi_programs = self.midi_programs.count();

        self.audio_ins = layout.audio_ins;
        self.audio_outs = layout.audio_outs;
        self.midi_ins = layout.midi_ins;
        self.midi_outs = layout.midi_outs;
        self.params = layout.parameters;
        self.programs.names = layout.programs;
        self.midi_programs.data = layout.midi_programs;
        self.hints = hints;
        self.generation += 1;

        if let Some((program, midi_program)) = self.backend.as_backend().selected_programs() {
            // Adopted as reported. Nothing is sent back to the plugin.
            let valid = |index: i32, count: usize| if (-1..count as i32).contains(&index) { index } else { -1 };
            self.programs.current = valid(program, self.programs.count());
            self.midi_programs.current = valid(midi_program, self.midi_programs.count());
        } else {
            self.resync_programs(old_programs, old_midi_programs, outbox)?;
        }

        tracing::debug!(
            "{}: reloaded ({} in, {} out, {} params, {} programs, {} midi programs)",
            self.name,
            ins,
            outs,
            self.params.len(),
            self.programs.count(),
            self.midi_programs.count()
        );
        outbox.callback(self.id(), CallbackKind::ReloadAll, 0, 0, 0.0);
        Ok(())
    }

    fn resync_programs(&mut self, old_programs: usize, old_midi_programs: usize, outbox: &mut Outbox) -> Result<()> {
        let sinks = Sinks::new(true, true, true);
        let resync = program::resync(old_programs, self.programs.count(), self.programs.current);
        if resync.changed {
            self.programs.current = -1;
            self.set_program_with(resync.index, sinks, outbox)?;
        } else if resync.index >= 0 {
            self.backend.as_backend_mut().select_program(resync.index as usize);
        }

        let resync = program::resync(
            old_midi_programs,
            self.midi_programs.count(),
            self.midi_programs.current,
        );
        if resync.changed {
            self.midi_programs.current = -1;
            self.set_midi_program_with(resync.index, sinks, outbox)?;
        } else if let Some(p) = usize::try_from(resync.index)
            .ok()
            .and_then(|i| self.midi_programs.data.get(i))
        {
            let (bank, program) = (p.bank, p.program);
            self.backend.as_backend_mut().select_midi_program(bank, program);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Stores a clamped value and passes it to the backend. Returns the stored value.
    pub fn set_parameter_value(
        &mut self,
        index: usize,
        value: f32,
        send_gui: bool,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<f32> {
        let param = self
            .params
            .get_mut(index)
            .ok_or(PluginError::InvalidParameter(index as i32))?;
        let value = param.ranges.clamp(value);
        param.value = value;
        let rindex = param.data.rindex;
        if param.is_input() && rindex >= 0 {
            self.backend.as_backend_mut().set_parameter(rindex as u32, value);
        }
        self.notify_parameter(index as i32, rindex, value, Sinks::new(send_gui, send_osc, send_callback), outbox);
        Ok(value)
    }

    /// Like [`set_parameter_value`](Self::set_parameter_value), addressed by
    /// backend index. Negative indexes select the internal parameters.
    pub fn set_parameter_value_by_rindex(
        &mut self,
        rindex: i32,
        value: f32,
        send_gui: bool,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<f32> {
        if rindex < 0 {
            return self.set_internal(rindex, value, send_osc, send_callback, outbox);
        }
        let index = self
            .params
            .iter()
            .position(|p| p.data.rindex == rindex)
            .ok_or(PluginError::InvalidParameter(rindex))?;
        self.set_parameter_value(index, value, send_gui, send_osc, send_callback, outbox)
    }

    pub fn set_parameter_midi_channel(
        &mut self,
        index: usize,
        channel: u8,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let param = self
            .params
            .get_mut(index)
            .ok_or(PluginError::InvalidParameter(index as i32))?;
        param.data.midi_channel = channel.min(15);
        if send_callback {
            outbox.callback(
                self.shared.id,
                CallbackKind::ParameterMidiChannelChanged,
                index as i32,
                param.data.midi_channel as i32,
                0.0,
            );
        }
        Ok(())
    }

    pub fn set_parameter_midi_cc(
        &mut self,
        index: usize,
        cc: i16,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let param = self
            .params
            .get_mut(index)
            .ok_or(PluginError::InvalidParameter(index as i32))?;
        param.data.midi_cc = cc.clamp(-1, 0x5F);
        if send_callback {
            outbox.callback(
                self.shared.id,
                CallbackKind::ParameterMidiCcChanged,
                index as i32,
                param.data.midi_cc as i32,
                0.0,
            );
        }
        Ok(())
    }

    fn notify_parameter(&self, index: i32, rindex: i32, value: f32, sinks: Sinks, outbox: &mut Outbox) {
        let msg = BridgeMessage::Control { rindex, value };
        if sinks.gui && rindex >= 0 {
            self.send_gui(msg.clone());
        }
        if sinks.osc {
            outbox.client(self.shared.id, msg);
        }
        if sinks.callback {
            outbox.callback(self.shared.id, CallbackKind::ParameterChanged, index, 0, value as f64);
        }
    }

    // -----------------------------------------------------------------------
    // Internal parameters
    // -----------------------------------------------------------------------

    fn set_internal(
        &mut self,
        rindex: i32,
        value: f32,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<f32> {
        let value = match rindex {
            internal_param::ACTIVE => {
                self.active = value >= 0.5;
                if self.active { 1.0 } else { 0.0 }
            }
            internal_param::DRYWET => {
                self.post.dry_wet = value.clamp(0.0, 1.0);
                self.post.dry_wet
            }
            internal_param::VOLUME => {
                self.post.volume = value.clamp(0.0, 1.27);
                self.post.volume
            }
            internal_param::BALANCE_LEFT => {
                self.post.balance_left = value.clamp(-1.0, 1.0);
                self.post.balance_left
            }
            internal_param::BALANCE_RIGHT => {
                self.post.balance_right = value.clamp(-1.0, 1.0);
                self.post.balance_right
            }
            other => return Err(PluginError::InvalidParameter(other)),
        };
        // Audio of a bridged plugin is rendered in the child.
        if rindex != internal_param::ACTIVE {
            if let LoadedBackend::Bridge(bridge) = &self.backend {
                bridge.channel().push(BridgeMessage::Control { rindex, value });
            }
        }
        self.notify_parameter(rindex, rindex, value, Sinks::new(false, send_osc, send_callback), outbox);
        Ok(value)
    }

    pub fn set_active(&mut self, active: bool, send_osc: bool, send_callback: bool, outbox: &mut Outbox) {
        let value = if active { 1.0 } else { 0.0 };
        let _ = self.set_internal(internal_param::ACTIVE, value, send_osc, send_callback, outbox);
    }

    pub fn set_dry_wet(&mut self, value: f32, send_osc: bool, send_callback: bool, outbox: &mut Outbox) {
        let _ = self.set_internal(internal_param::DRYWET, value, send_osc, send_callback, outbox);
    }

    pub fn set_volume(&mut self, value: f32, send_osc: bool, send_callback: bool, outbox: &mut Outbox) {
        let _ = self.set_internal(internal_param::VOLUME, value, send_osc, send_callback, outbox);
    }

    pub fn set_balance_left(&mut self, value: f32, send_osc: bool, send_callback: bool, outbox: &mut Outbox) {
        let _ = self.set_internal(internal_param::BALANCE_LEFT, value, send_osc, send_callback, outbox);
    }

    pub fn set_balance_right(&mut self, value: f32, send_osc: bool, send_callback: bool, outbox: &mut Outbox) {
        let _ = self.set_internal(internal_param::BALANCE_RIGHT, value, send_osc, send_callback, outbox);
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    /// Selects a program, or none with -1. Selecting a program re-reads every
    /// parameter from the backend and makes the result the new defaults.
    pub fn set_program(
        &mut self,
        index: i32,
        send_gui: bool,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        self.set_program_with(index, Sinks::new(send_gui, send_osc, send_callback), outbox)
    }

    fn set_program_with(&mut self, index: i32, sinks: Sinks, outbox: &mut Outbox) -> Result<()> {
        if index < -1 || index >= self.programs.count() as i32 {
            return Err(PluginError::InvalidProgram(index));
        }
        self.programs.current = index;
        if index >= 0 {
            self.backend.as_backend_mut().select_program(index as usize);
            self.resync_parameters(sinks, outbox);
        }

        let msg = BridgeMessage::Program(index);
        if sinks.gui {
            self.send_gui(msg.clone());
        }
        if sinks.osc {
            outbox.client(self.shared.id, msg);
        }
        if sinks.callback {
            outbox.callback(self.shared.id, CallbackKind::ProgramChanged, index, 0, 0.0);
        }
        Ok(())
    }

    pub fn set_midi_program(
        &mut self,
        index: i32,
        send_gui: bool,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        self.set_midi_program_with(index, Sinks::new(send_gui, send_osc, send_callback), outbox)
    }

    fn set_midi_program_with(&mut self, index: i32, sinks: Sinks, outbox: &mut Outbox) -> Result<()> {
        if index < -1 || index >= self.midi_programs.count() as i32 {
            return Err(PluginError::InvalidProgram(index));
        }
        self.midi_programs.current = index;
        let selected = usize::try_from(index)
            .ok()
            .and_then(|i| self.midi_programs.data.get(i))
            .map(|p| (p.bank, p.program));
        if let Some((bank, program)) = selected {
            self.backend.as_backend_mut().select_midi_program(bank, program);
            self.resync_parameters(sinks, outbox);
            let msg = BridgeMessage::MidiProgram {
                bank: bank as i32,
                program: program as i32,
            };
            if sinks.gui {
                self.send_gui(msg.clone());
            }
            if sinks.osc {
                outbox.client(self.shared.id, msg);
            }
        }
        if sinks.callback {
            outbox.callback(self.shared.id, CallbackKind::MidiProgramChanged, index, 0, 0.0);
        }
        Ok(())
    }

    /// Reads back every parameter after a program switch. SoundFonts keep their
    /// defaults; their presets do not touch the exposed parameters.
    fn resync_parameters(&mut self, sinks: Sinks, outbox: &mut Outbox) {
        if self.kind() == PluginType::Sf2 {
            return;
        }
        let backend = self.backend.as_backend();
        for param in &mut self.params {
            if param.data.rindex < 0 {
                continue;
            }
            let value = param.ranges.clamp(backend.parameter_value(param.data.rindex as u32));
            param.value = value;
            param.ranges.def = value;
        }
        for param in &self.params {
            let msg = BridgeMessage::Control {
                rindex: param.data.rindex,
                value: param.value,
            };
            if sinks.gui {
                self.send_gui(msg.clone());
            }
            if sinks.osc {
                outbox.client(self.shared.id, msg);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Custom data and chunks
    // -----------------------------------------------------------------------

    pub fn set_custom_data(
        &mut self,
        kind: CustomDataType,
        key: &str,
        value: &str,
        send_gui: bool,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(PluginError::Protocol("custom data key is empty".into()));
        }
        let data = CustomData {
            kind,
            key: key.to_string(),
            value: value.to_string(),
        };
        self.backend.as_backend_mut().set_custom_data(&data)?;

        if send_gui && kind == CustomDataType::String {
            self.send_gui(BridgeMessage::Configure {
                key: data.key.clone(),
                value: data.value.clone(),
            });
        }
        if is_internal_key(key) {
            return Ok(());
        }
        match self.custom_data.iter_mut().find(|d| d.key == data.key) {
            Some(existing) => *existing = data,
            None => self.custom_data.push(data),
        }
        Ok(())
    }

    pub fn chunk_data(&mut self) -> Result<Vec<u8>> {
        if !self.hints.contains(PluginHints::USES_CHUNKS) {
            return Err(PluginError::Unsupported(format!("{} does not use chunks", self.name)));
        }
        self.backend.as_backend_mut().chunk()
    }

    /// Restores a chunk and re-reads every parameter value.
    pub fn set_chunk_data(&mut self, data: &[u8]) -> Result<()> {
        if !self.hints.contains(PluginHints::USES_CHUNKS) {
            return Err(PluginError::Unsupported(format!("{} does not use chunks", self.name)));
        }
        self.backend.as_backend_mut().set_chunk(data)?;
        let backend = self.backend.as_backend();
        for param in self.params.iter_mut().filter(|p| p.data.rindex >= 0) {
            param.value = param.ranges.clamp(backend.parameter_value(param.data.rindex as u32));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notes
    // -----------------------------------------------------------------------

    /// Queues a note for the next block. Velocity 0 is a note-off.
    pub fn send_midi_single_note(
        &mut self,
        channel: u8,
        note: u8,
        velocity: u8,
        send_gui: bool,
        send_osc: bool,
        send_callback: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        if channel > 15 || note > 127 || velocity > 127 {
            return Err(PluginError::Protocol(format!(
                "invalid note {note}/{velocity} on channel {channel}"
            )));
        }
        if !self.shared.ext_notes.push(ExternalNote {
            channel,
            note,
            velocity,
        }) {
            tracing::warn!("{}: external note table full", self.name);
            return Ok(());
        }

        let status = if velocity > 0 { STATUS_NOTE_ON } else { STATUS_NOTE_OFF };
        let msg = BridgeMessage::Midi([0, status | channel, note, velocity]);
        if send_gui {
            self.send_gui(msg.clone());
        }
        if send_osc {
            outbox.client(self.shared.id, msg);
        }
        if send_callback {
            let kind = if velocity > 0 {
                CallbackKind::NoteOn
            } else {
                CallbackKind::NoteOff
            };
            outbox.callback(self.shared.id, kind, channel as i32, note as i32, velocity as f64);
        }
        Ok(())
    }

    /// Releases every note on the control channel. Notifications stop early when
    /// the postponed table would run out of room for the audio thread.
    pub fn send_midi_all_notes_off(&mut self) {
        let channel = self.control_channel;
        let mut notified = true;
        for note in 0..128u8 {
            self.shared.ext_notes.push(ExternalNote {
                channel,
                note,
                velocity: 0,
            });
            if notified && self.shared.post_events.free_slots() > POST_EVENT_RESERVE {
                self.shared.post_events.push(PostEvent::new(
                    PostEventKind::NoteOff,
                    channel as i32,
                    note as i32,
                    0.0,
                ));
            } else {
                notified = false;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Postponed events
    // -----------------------------------------------------------------------

    pub fn postpone_event(&self, kind: PostEventKind, value1: i32, value2: i32, value3: f64) -> bool {
        self.shared
            .post_events
            .push(PostEvent::new(kind, value1, value2, value3))
    }

    /// Delivers what the audio thread postponed since the last call.
    pub fn drain_postponed(&mut self, outbox: &mut Outbox) {
        let id = self.shared.id;
        for event in self.shared.post_events.drain() {
            match event.kind {
                PostEventKind::Null => {}
                PostEventKind::Debug => {
                    outbox.callback(id, CallbackKind::Debug, event.value1, event.value2, event.value3)
                }
                PostEventKind::ParameterChange => {
                    let index = event.value1;
                    let rindex = if index < 0 { index } else { event.value2 };
                    self.notify_parameter(index, rindex, event.value3 as f32, Sinks::new(true, true, true), outbox);
                }
                PostEventKind::ProgramChange => {
                    let sinks = Sinks::new(true, true, false);
                    self.resync_parameters(sinks, outbox);
                    self.send_gui(BridgeMessage::Program(event.value1));
                    outbox.client(id, BridgeMessage::Program(event.value1));
                    outbox.callback(id, CallbackKind::ProgramChanged, event.value1, 0, 0.0);
                }
                PostEventKind::MidiProgramChange => {
                    self.resync_parameters(Sinks::new(true, true, false), outbox);
                    let msg = BridgeMessage::MidiProgram {
                        bank: event.value2,
                        program: event.value3 as i32,
                    };
                    self.send_gui(msg.clone());
                    outbox.client(id, msg);
                    outbox.callback(id, CallbackKind::MidiProgramChanged, event.value1, 0, 0.0);
                }
                PostEventKind::NoteOn | PostEventKind::NoteOff => {
                    let on = event.kind == PostEventKind::NoteOn;
                    let status = if on { STATUS_NOTE_ON } else { STATUS_NOTE_OFF };
                    let (channel, note, velocity) =
                        (event.value1 as u8 & 0x0F, event.value2 as u8 & 0x7F, event.value3 as u8 & 0x7F);
                    let msg = BridgeMessage::Midi([0, status | channel, note, velocity]);
                    self.send_gui(msg.clone());
                    outbox.client(id, msg);
                    let kind = if on { CallbackKind::NoteOn } else { CallbackKind::NoteOff };
                    outbox.callback(id, kind, channel as i32, note as i32, velocity as f64);
                }
                PostEventKind::Custom => {
                    outbox.callback(id, CallbackKind::Update, event.value1, event.value2, event.value3)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Real-time
    // -----------------------------------------------------------------------

    /// Renders `frames` frames at `offset` into `ports.audio_out`.
    ///
    /// Event frames in `ports` are relative to `offset`. Never allocates; a port
    /// layout that does not match the plugin only silences the outputs.
    pub fn process(&mut self, ports: &mut PortBuffers, frames: usize, offset: usize) {
        let range = offset..offset + frames;
        if !ports.matches(self.audio_ins.count(), self.audio_outs.count()) || ports.capacity() < range.end {
            ports.zero_outputs(range);
            return;
        }
        let id = self.shared.id;
        let input_peaks = peaks::measure(&ports.audio_in, range.clone());
        self.events.clear();

        // Control input
        for ev in ports.control_in.iter() {
            if ev.frame as usize >= frames {
                continue;
            }
            let on_control_channel = ev.channel == self.control_channel;
            match ev.kind {
                ControlEventKind::Parameter { control, value } => {
                    let value = value.clamp(0.0, 1.0);
                    if on_control_channel && self.apply_controller(control, value) {
                        continue;
                    }
                    for param in self.params.iter_mut() {
                        if !param.is_input()
                            || param.data.rindex < 0
                            || !param.data.hints.contains(ParameterHints::AUTOMABLE)
                            || param.data.midi_channel != ev.channel
                            || param.data.midi_cc != control as i16
                        {
                            continue;
                        }
                        let v = post::automation_value(param, value);
                        param.value = v;
                        self.backend
                            .as_backend_mut()
                            .set_parameter(param.data.rindex as u32, v);
                        self.shared.post_events.push(PostEvent::new(
                            PostEventKind::ParameterChange,
                            param.data.index,
                            param.data.rindex,
                            v as f64,
                        ));
                    }
                }
                ControlEventKind::MidiBank { bank } => {
                    if on_control_channel {
                        self.ctrl_bank = bank;
                    }
                }
                ControlEventKind::MidiProgram { program } => {
                    if on_control_channel {
                        self.apply_program_event(program);
                    }
                }
                ControlEventKind::AllSoundOff => {
                    if on_control_channel && self.active && self.was_active {
                        let backend = self.backend.as_backend_mut();
                        backend.deactivate();
                        backend.activate();
                    }
                    push_sorted(
                        &mut self.events,
                        MidiEvent::control_change(ev.frame, ev.channel, CC_ALL_SOUND_OFF, 0),
                    );
                }
                ControlEventKind::AllNotesOff => {
                    push_sorted(
                        &mut self.events,
                        MidiEvent::control_change(ev.frame, ev.channel, CC_ALL_NOTES_OFF, 0),
                    );
                }
            }
        }

        // Injected notes go ahead of the port's MIDI.
        {
            let events = &mut self.events;
            self.shared.ext_notes.try_drain(|note| {
                let ev = if note.velocity > 0 {
                    MidiEvent::note_on(0, note.channel, note.note, note.velocity)
                } else {
                    MidiEvent::note_off(0, note.channel, note.note, 0)
                };
                push_sorted(events, ev);
            });
        }

        for ev in ports.midi_in.iter() {
            if ev.frame as usize >= frames {
                continue;
            }
            let ev = ev.normalized();
            if ev.channel() == self.control_channel && (ev.is_note_on() || ev.is_note_off()) {
                let kind = if ev.is_note_on() {
                    PostEventKind::NoteOn
                } else {
                    PostEventKind::NoteOff
                };
                self.shared.post_events.push(PostEvent::new(
                    kind,
                    ev.channel() as i32,
                    ev.data[1] as i32,
                    ev.data[2] as f64,
                ));
            }
            push_sorted(&mut self.events, ev);
        }

        if let LoadedBackend::Bridge(bridge) = &self.backend {
            for ev in self.events.iter() {
                bridge.send_midi([0, ev.data[0], ev.data[1], ev.data[2]]);
            }
        }

        if self.active {
            if !self.was_active {
                self.backend.as_backend_mut().activate();
            }
            self.backend.as_backend_mut().run(RunContext {
                inputs: &ports.audio_in,
                outputs: &mut ports.audio_out,
                offset,
                frames,
                events: &self.events,
                midi_out: &mut ports.midi_out,
            });

            if self.hints.contains(PluginHints::CAN_DRYWET) && self.post.has_dry_wet() {
                post::apply_dry_wet(&ports.audio_in, &mut ports.audio_out, range.clone(), self.post.dry_wet);
            }
            if self.hints.contains(PluginHints::CAN_BALANCE) && self.post.has_balance() {
                post::apply_balance(
                    &mut ports.audio_out,
                    range.clone(),
                    self.post.balance_left,
                    self.post.balance_right,
                );
            }
            if self.hints.contains(PluginHints::CAN_VOLUME) && self.post.has_volume() {
                post::apply_volume(&mut ports.audio_out, range.clone(), self.post.volume);
            }
        } else {
            if self.was_active {
                self.backend.as_backend_mut().deactivate();
            }
            ports.zero_outputs(range.clone());
        }

        if !self.hints.contains(PluginHints::IS_BRIDGE) {
            self.peaks.set_input(id, input_peaks);
            self.peaks.set_output(id, peaks::measure(&ports.audio_out, range));
        }
        self.was_active = self.active;
    }

    /// Host controllers on the control channel. Returns false when `control`
    /// is not one of them, or the plugin cannot use it.
    fn apply_controller(&mut self, control: u16, value: f32) -> bool {
        let post_events = &self.shared.post_events;
        let postpone = |rindex: i32, v: f32| {
            post_events.push(PostEvent::new(PostEventKind::ParameterChange, rindex, rindex, v as f64));
        };
        match u8::try_from(control) {
            Ok(CC_BREATH) if self.hints.contains(PluginHints::CAN_DRYWET) => {
                self.post.dry_wet = value;
                postpone(internal_param::DRYWET, value);
                true
            }
            Ok(CC_VOLUME) if self.hints.contains(PluginHints::CAN_VOLUME) => {
                self.post.volume = post::volume_from_controller(value);
                postpone(internal_param::VOLUME, self.post.volume);
                true
            }
            Ok(CC_BALANCE) if self.hints.contains(PluginHints::CAN_BALANCE) => {
                let (left, right) = post::balance_from_controller(value);
                self.post.balance_left = left;
                self.post.balance_right = right;
                postpone(internal_param::BALANCE_LEFT, left);
                postpone(internal_param::BALANCE_RIGHT, right);
                true
            }
            Ok(CC_EFFECT_CONTROL_1) => {
                self.active = value >= 0.5;
                postpone(internal_param::ACTIVE, if self.active { 1.0 } else { 0.0 });
                true
            }
            _ => false,
        }
    }

    fn apply_program_event(&mut self, program: u16) {
        if self.midi_programs.count() > 0 {
            let bank = self.ctrl_bank as u32;
            if let Some(index) = self.midi_programs.find(bank, program as u32) {
                self.midi_programs.current = index as i32;
                self.backend.as_backend_mut().select_midi_program(bank, program as u32);
                self.shared.post_events.push(PostEvent::new(
                    PostEventKind::MidiProgramChange,
                    index as i32,
                    bank as i32,
                    program as f64,
                ));
            }
        } else if (program as usize) < self.programs.count() {
            self.programs.current = program as i32;
            self.backend.as_backend_mut().select_program(program as usize);
            self.shared.post_events.push(PostEvent::new(
                PostEventKind::ProgramChange,
                program as i32,
                0,
                0.0,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // OSC state
    // -----------------------------------------------------------------------

    /// The full state a freshly attached peer needs: custom data, programs and
    /// every parameter value.
    pub fn state_messages(&self) -> Vec<BridgeMessage> {
        let mut msgs: Vec<BridgeMessage> = self
            .custom_data
            .iter()
            .filter(|d| d.kind == CustomDataType::String)
            .map(|d| BridgeMessage::Configure {
                key: d.key.clone(),
                value: d.value.clone(),
            })
            .collect();
        if self.programs.current >= 0 {
            msgs.push(BridgeMessage::Program(self.programs.current));
        }
        if let Some(p) = usize::try_from(self.midi_programs.current)
            .ok()
            .and_then(|i| self.midi_programs.data.get(i))
        {
            msgs.push(BridgeMessage::MidiProgram {
                bank: p.bank as i32,
                program: p.program as i32,
            });
        }
        msgs.extend(self.params.iter().map(|p| BridgeMessage::Control {
            rindex: p.data.rindex,
            value: p.value,
        }));
        msgs
    }

    /// Everything a plugin bridge reports about its plugin, ending with
    /// `bridge_update url`.
    pub fn describe(&mut self, url: &str) -> Vec<BridgeMessage> {
        let info = &self.info;
        let param_ins = self.params.iter().filter(|p| p.is_input()).count() as i32;
        let param_outs = self.params.len() as i32 - param_ins;

        let mut msgs = vec![
            BridgeMessage::PluginInfo {
                category: info.category.to_i32(),
                hints: self.hints.bits() as i32,
                name: info.name.clone(),
                label: info.label.clone(),
                maker: info.maker.clone(),
                copyright: info.copyright.clone(),
                unique_id: info.unique_id,
            },
            BridgeMessage::AudioCount {
                ins: self.audio_ins.count() as i32,
                outs: self.audio_outs.count() as i32,
                total: (self.audio_ins.count() + self.audio_outs.count()) as i32,
            },
            BridgeMessage::MidiCount {
                ins: self.midi_ins.count() as i32,
                outs: self.midi_outs.count() as i32,
                total: (self.midi_ins.count() + self.midi_outs.count()) as i32,
            },
            BridgeMessage::ParamCount {
                ins: param_ins,
                outs: param_outs,
                total: self.params.len() as i32,
            },
        ];
        for (i, p) in self.params.iter().enumerate() {
            let index = i as i32;
            msgs.push(BridgeMessage::ParamInfo {
                index,
                name: p.info.name.clone(),
                unit: p.info.unit.clone(),
            });
            msgs.push(BridgeMessage::ParamData {
                direction: p.data.direction.to_i32(),
                index,
                rindex: p.data.rindex,
                hints: p.data.hints.bits() as i32,
                midi_channel: p.data.midi_channel as i32,
                midi_cc: p.data.midi_cc as i32,
            });
            let r = &p.ranges;
            msgs.push(BridgeMessage::ParamRanges {
                index,
                def: r.def,
                min: r.min,
                max: r.max,
                step: r.step,
                step_small: r.step_small,
                step_large: r.step_large,
            });
        }
        msgs.push(BridgeMessage::ProgramCount(self.programs.count() as i32));
        msgs.extend(self.programs.names.iter().enumerate().map(|(i, name)| {
            BridgeMessage::ProgramInfo {
                index: i as i32,
                name: name.clone(),
            }
        }));
        msgs.push(BridgeMessage::MidiProgramCount(self.midi_programs.count() as i32));
        msgs.extend(self.midi_programs.data.iter().enumerate().map(|(i, p)| {
            BridgeMessage::MidiProgramInfo {
                index: i as i32,
                bank: p.bank as i32,
                program: p.program as i32,
                name: p.name.clone(),
            }
        }));
        msgs.extend(self.custom_data.iter().map(|d| BridgeMessage::CustomData {
            kind: d.kind.as_str().to_string(),
            key: d.key.clone(),
            value: d.value.clone(),
        }));
        if self.hints.contains(PluginHints::USES_CHUNKS) {
            match self.backend.as_backend_mut().chunk() {
                Ok(data) => msgs.push(BridgeMessage::BridgeChunk(data)),
                Err(e) => tracing::warn!("{}: no chunk to report: {e}", self.name),
            }
        }
        msgs.extend(
            self.state_messages()
                .into_iter()
                .filter(|m| !matches!(m, BridgeMessage::Configure { .. })),
        );
        msgs.push(BridgeMessage::BridgeUpdate(url.to_string()));
        msgs
    }

    // -----------------------------------------------------------------------
    // GUI
    // -----------------------------------------------------------------------

    fn send_gui(&self, msg: BridgeMessage) {
        if self.shared.ui.endpoint.has_target() {
            self.shared.ui.push(msg);
        }
    }

    /// Shows or hides the plugin GUI.
    ///
    /// Returns the UI channel when a GUI bridge was asked to show itself; the
    /// caller waits on it with [`wait_for_ui`] after releasing the process lock.
    pub fn show_gui(
        &mut self,
        show: bool,
        options: &HostOptions,
        host_url: &str,
        outbox: &mut Outbox,
    ) -> Result<Option<Arc<BridgeChannel>>> {
        if !self.hints.contains(PluginHints::HAS_GUI) {
            return Err(PluginError::Unsupported(format!("{} has no GUI", self.name)));
        }
        let mut wait = None;
        if self.backend.is_bridge() {
            self.backend.as_backend_mut().show_gui(show)?;
        } else if let Some(command) = options
            .prefer_ui_bridges
            .then(|| {
                self.backend
                    .as_backend()
                    .ui_bridge(&options.bridge_paths, host_url, &self.name)
            })
            .flatten()
        {
            if show {
                let running = self.ui_process.as_ref().is_some_and(BridgeProcess::is_alive);
                if !running {
                    self.shared.ui.queue.clear();
                    self.ui_process = Some(BridgeProcess::spawn(
                        &options.bridge_paths,
                        &command,
                        Arc::clone(&self.shared.ui),
                    )?);
                    self.shared.set_ui_spawned(true);
                }
                self.shared.ui.push(BridgeMessage::Show);
                wait = Some(Arc::clone(&self.shared.ui));
            } else if self.ui_process.is_some() {
                self.shared.ui.push(BridgeMessage::Hide);
            }
        } else {
            self.backend.as_backend_mut().show_gui(show)?;
        }

        self.gui_visible = show;
        outbox.callback(self.shared.id, CallbackKind::ShowGui, show as i32, 0, 0.0);
        Ok(wait)
    }

    // -----------------------------------------------------------------------
    // Idle
    // -----------------------------------------------------------------------

    /// Non-real-time housekeeping: postponed events, inbound OSC, bridge and GUI
    /// children, backend automation. `sender` flushes the bridge queues.
    pub fn idle(&mut self, sender: Option<&OscSender>, outbox: &mut Outbox) {
        self.drain_postponed(outbox);

        let inbox: Vec<InboxMessage> = self.shared.inbox_rx.try_iter().collect();
        for InboxMessage { source, msg } in inbox {
            let method = msg.method();
            if let Err(e) = self.handle_message(source, msg, outbox) {
                tracing::warn!("{}: dropping '{method}': {e}", self.name);
            }
        }

        self.automation.clear();
        self.backend.as_backend_mut().take_automation(&mut self.automation);
        for i in 0..self.automation.len() {
            let (rindex, value) = self.automation[i];
            if let Some(index) = self.params.iter().position(|p| p.data.rindex == rindex as i32) {
                let param = &mut self.params[index];
                param.value = param.ranges.clamp(value);
                let value = param.value;
                self.notify_parameter(index as i32, rindex as i32, value, Sinks::new(true, true, true), outbox);
            }
        }

        self.backend.as_backend_mut().idle();

        if let LoadedBackend::Bridge(bridge) = &mut self.backend {
            if bridge.poll() {
                tracing::info!("{}: plugin bridge is gone", self.name);
                self.active = false;
                outbox.callback(self.shared.id, CallbackKind::Quit, 0, 0, 0.0);
            }
        }
        if let Some(process) = self.ui_process.as_mut() {
            if process.poll() {
                self.ui_closed(outbox);
            }
        }

        if let Some(sender) = sender {
            self.shared.bridge.flush(sender);
            self.shared.ui.flush(sender);
        }
    }

    fn ui_closed(&mut self, outbox: &mut Outbox) {
        self.ui_process = None;
        self.shared.set_ui_spawned(false);
        self.shared.ui.queue.clear();
        self.shared.ui.endpoint.clear_target();
        if self.gui_visible {
            self.gui_visible = false;
            outbox.callback(self.shared.id, CallbackKind::ShowGui, 0, 0, 0.0);
        }
    }

    /// Applies one message taken from the inbox.
    pub fn handle_message(&mut self, source: MessageSource, msg: BridgeMessage, outbox: &mut Outbox) -> Result<()> {
        if source == MessageSource::Bridge {
            return self.handle_bridge_message(msg, outbox);
        }
        // GUIs already show their own edits; clients get no echo.
        let from_ui = source == MessageSource::Ui;
        let (gui, osc) = (!from_ui, from_ui);
        match msg {
            BridgeMessage::Control { rindex, value } => {
                self.set_parameter_value_by_rindex(rindex, value, gui, osc, true, outbox)?;
            }
            BridgeMessage::Program(index) => self.set_program(index, gui, osc, true, outbox)?,
            BridgeMessage::MidiProgram { bank, program } => {
                let index = self
                    .midi_programs
                    .find(bank.max(0) as u32, program.max(0) as u32)
                    .ok_or(PluginError::InvalidProgram(program))?;
                self.set_midi_program(index as i32, gui, osc, true, outbox)?;
            }
            BridgeMessage::Midi([_, status, note, velocity]) => match status & 0xF0 {
                STATUS_NOTE_ON | STATUS_NOTE_OFF => {
                    let velocity = if status & 0xF0 == STATUS_NOTE_OFF { 0 } else { velocity };
                    self.send_midi_single_note(status & 0x0F, note, velocity, gui, osc, true, outbox)?;
                }
                _ => {}
            },
            BridgeMessage::Configure { key, value } => {
                self.set_custom_data(CustomDataType::String, &key, &value, gui)?;
            }
            BridgeMessage::Update(url) if from_ui => {
                self.shared.ui.endpoint.set_target(&url)?;
                for msg in self.state_messages() {
                    self.shared.ui.push(msg);
                }
            }
            BridgeMessage::Exiting if from_ui => {
                if let Some(process) = self.ui_process.as_mut() {
                    process.exited();
                }
                self.ui_closed(outbox);
            }
            other => {
                return Err(PluginError::Protocol(format!(
                    "unexpected '{}' from {source:?}",
                    other.method()
                )))
            }
        }
        Ok(())
    }

    fn handle_bridge_message(&mut self, msg: BridgeMessage, outbox: &mut Outbox) -> Result<()> {
        let LoadedBackend::Bridge(bridge) = &mut self.backend else {
            return Err(PluginError::Bridge(format!("{} is not bridged", self.name)));
        };
        match msg {
            BridgeMessage::Exiting => {
                bridge.exited();
                self.active = false;
                tracing::info!("{}: plugin bridge exited", self.name);
                outbox.callback(self.shared.id, CallbackKind::Quit, 0, 0, 0.0);
            }
            BridgeMessage::Control { rindex, value } if rindex >= 0 => {
                bridge.mirror_control(rindex, value);
                if let Some(index) = self.params.iter().position(|p| p.data.rindex == rindex) {
                    let param = &mut self.params[index];
                    param.value = param.ranges.clamp(value);
                    let value = param.value;
                    self.notify_parameter(index as i32, rindex, value, Sinks::new(true, true, true), outbox);
                }
            }
            BridgeMessage::Program(index) => {
                bridge.handle_report(BridgeMessage::Program(index))?;
                if bridge.state() == BridgeState::Active && index >= -1 && index < self.programs.count() as i32 {
                    self.programs.current = index;
                    outbox.callback(self.shared.id, CallbackKind::ProgramChanged, index, 0, 0.0);
                }
            }
            BridgeMessage::MidiProgram { bank, program } => {
                bridge.handle_report(BridgeMessage::MidiProgram { bank, program })?;
                let index = self
                    .midi_programs
                    .find(bank.max(0) as u32, program.max(0) as u32);
                if let (BridgeState::Active, Some(index)) = (bridge.state(), index) {
                    self.midi_programs.current = index as i32;
                    outbox.callback(self.shared.id, CallbackKind::MidiProgramChanged, index as i32, 0, 0.0);
                }
            }
            BridgeMessage::InputPeak { left, right } => self.peaks.set_input(self.shared.id, [left, right]),
            BridgeMessage::OutputPeak { left, right } => self.peaks.set_output(self.shared.id, [left, right]),
            report => {
                if bridge.handle_report(report)? == BridgeEvent::Reload {
                    self.reload(outbox)?;
                    self.active = true;
                }
            }
        }
        Ok(())
    }

    /// Stops the plugin and any child processes.
    pub fn close(&mut self) {
        if self.was_active {
            self.backend.as_backend_mut().deactivate();
            self.was_active = false;
        }
        self.active = false;
        if let LoadedBackend::Bridge(bridge) = &mut self.backend {
            bridge.close();
        }
        if let Some(process) = self.ui_process.as_mut() {
            process.close();
        }
        self.peaks.reset(self.shared.id);
    }

    /// Waits for bridge children told to quit by [`close`](Self::close).
    pub fn wait_for_exit(&mut self) {
        if let LoadedBackend::Bridge(bridge) = &mut self.backend {
            bridge.wait_exit();
        }
        if let Some(process) = self.ui_process.as_mut() {
            process.wait_exit();
        }
    }

}

/// Inserts after every event at the same or an earlier frame. Drops the event
/// when the buffer is full.
fn push_sorted(events: &mut MidiEventVec, ev: MidiEvent) {
    if events.len() >= MAX_MIDI_EVENTS {
        return;
    }
    let at = events
        .iter()
        .rposition(|e| e.frame <= ev.frame)
        .map_or(0, |i| i + 1);
    events.insert(at, ev);
}

/// Polls until the GUI bridge has announced itself, or the timeout elapses.
pub fn wait_for_ui(channel: &BridgeChannel, options: &HostOptions) -> Result<()> {
    let poll = Duration::from_millis(options.osc_ui_poll_ms.max(1));
    let timeout = Duration::from_millis(options.osc_ui_timeout_ms);
    let started = std::time::Instant::now();
    while !channel.endpoint.has_target() {
        if started.elapsed() >= timeout {
            return Err(PluginError::Timeout {
                operation: "waiting for GUI bridge".into(),
                duration_ms: options.osc_ui_timeout_ms,
            });
        }
        std::thread::sleep(poll);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{ControlEvent, CC_BANK_SELECT};
    use crate::types::ParameterDirection;
    use approx::assert_relative_eq;

    fn instance(label: &str) -> (PluginInstance, Outbox) {
        let options = HostOptions::default();
        let request = LoadRequest::internal(label);
        let backend = LoadedBackend::load(&request, &options).unwrap();
        let shared = Arc::new(PluginShared::new(PluginId(0)));
        let peaks = Arc::new(PeakMeters::new(1));
        let mut plugin = PluginInstance::new(shared, backend, &request, label, &options, peaks);
        let mut outbox = Outbox::new();
        plugin.reload(&mut outbox).unwrap();
        (plugin, outbox)
    }

    fn ports(plugin: &PluginInstance, frames: usize) -> PortBuffers {
        PortBuffers::new(plugin.audio_in_count(), plugin.audio_out_count(), frames)
    }

    fn callbacks(outbox: &mut Outbox) -> Vec<CallbackKind> {
        outbox.callbacks.drain(..).map(|(_, c)| c.kind).collect()
    }

    #[test]
    fn test_reload_computes_hints() {
        let (gain, mut outbox) = instance("gain");
        let hints = gain.hints();
        assert!(hints.contains(PluginHints::CAN_DRYWET));
        assert!(hints.contains(PluginHints::CAN_VOLUME));
        assert!(hints.contains(PluginHints::CAN_BALANCE));
        assert!(!hints.contains(PluginHints::IS_BRIDGE));
        assert_eq!(gain.generation(), 1);
        assert_eq!(callbacks(&mut outbox), vec![CallbackKind::ReloadAll]);

        let (sine, _) = instance("sine");
        assert!(!sine.hints().contains(PluginHints::CAN_DRYWET));
        assert!(sine.hints().contains(PluginHints::IS_SYNTH));
    }

    #[test]
    fn test_parameter_value_is_clamped() {
        let (mut gain, mut outbox) = instance("gain");
        let stored = gain
            .set_parameter_value(0, 5.0, false, true, true, &mut outbox)
            .unwrap();
        assert_eq!(stored, 2.0);
        assert_eq!(gain.parameter_value(0), Some(2.0));
        assert!(matches!(
            gain.set_parameter_value(9, 1.0, false, false, false, &mut outbox),
            Err(PluginError::InvalidParameter(9))
        ));

        let clients: Vec<_> = outbox.clients.drain(..).map(|(_, m)| m).collect();
        assert_eq!(clients, vec![BridgeMessage::Control { rindex: 0, value: 2.0 }]);
        assert_eq!(callbacks(&mut outbox), vec![CallbackKind::ParameterChanged]);
    }

    #[test]
    fn test_sinks_are_independent() {
        let (mut gain, mut outbox) = instance("gain");
        outbox.callbacks.clear();
        gain.set_parameter_value(0, 1.5, false, false, true, &mut outbox)
            .unwrap();
        assert!(outbox.clients.is_empty());
        assert_eq!(outbox.callbacks.len(), 1);

        outbox.callbacks.clear();
        gain.set_parameter_value(0, 0.5, false, true, false, &mut outbox)
            .unwrap();
        assert_eq!(outbox.clients.len(), 1);
        assert!(outbox.callbacks.is_empty());
    }

    #[test]
    fn test_negative_rindex_reaches_internal_parameters() {
        let (mut gain, mut outbox) = instance("gain");
        gain.set_parameter_value_by_rindex(internal_param::VOLUME, 3.0, false, false, false, &mut outbox)
            .unwrap();
        assert_relative_eq!(gain.volume(), 1.27);
        gain.set_parameter_value_by_rindex(internal_param::DRYWET, 0.5, false, false, false, &mut outbox)
            .unwrap();
        assert_eq!(gain.dry_wet(), 0.5);
        gain.set_parameter_value_by_rindex(internal_param::ACTIVE, 1.0, false, false, false, &mut outbox)
            .unwrap();
        assert!(gain.is_active());
        assert!(gain
            .set_parameter_value_by_rindex(-9, 0.0, false, false, false, &mut outbox)
            .is_err());
    }

    #[test]
    fn test_midi_channel_and_cc_are_clamped() {
        let (mut gain, mut outbox) = instance("gain");
        gain.set_parameter_midi_channel(0, 40, true, &mut outbox).unwrap();
        gain.set_parameter_midi_cc(0, 300, true, &mut outbox).unwrap();
        assert_eq!(gain.parameter(0).unwrap().data.midi_channel, 15);
        assert_eq!(gain.parameter(0).unwrap().data.midi_cc, 0x5F);
        gain.set_parameter_midi_cc(0, -7, false, &mut outbox).unwrap();
        assert_eq!(gain.parameter(0).unwrap().data.midi_cc, -1);
    }

    #[test]
    fn test_first_reload_selects_program_zero() {
        let (sine, _) = instance("sine");
        assert_eq!(sine.programs().current, 0);
        assert_relative_eq!(sine.parameter_value(0).unwrap(), 0.25);
        assert_relative_eq!(sine.parameter(0).unwrap().ranges.def, 0.25);
    }

    #[test]
    fn test_set_program_resyncs_defaults() {
        let (mut sine, mut outbox) = instance("sine");
        outbox.callbacks.clear();
        sine.set_program(1, false, false, true, &mut outbox).unwrap();
        assert_relative_eq!(sine.parameter_value(0).unwrap(), 0.75);
        assert_relative_eq!(sine.parameter(0).unwrap().ranges.def, 0.75);
        assert_eq!(callbacks(&mut outbox), vec![CallbackKind::ProgramChanged]);

        assert!(matches!(
            sine.set_program(2, false, false, false, &mut outbox),
            Err(PluginError::InvalidProgram(2))
        ));
        assert!(matches!(
            sine.set_program(-2, false, false, false, &mut outbox),
            Err(PluginError::InvalidProgram(-2))
        ));
        sine.set_program(-1, false, false, false, &mut outbox).unwrap();
        assert_eq!(sine.programs().current, -1);
        assert_relative_eq!(sine.parameter_value(0).unwrap(), 0.75);
    }

    #[test]
    fn test_internal_keys_are_not_persisted() {
        let (mut gain, _) = instance("gain");
        gain.set_custom_data(CustomDataType::String, "mode", "a", false).unwrap();
        gain.set_custom_data(CustomDataType::String, "mode", "b", false).unwrap();
        gain.set_custom_data(CustomDataType::String, "plinth:ui", "x", false).unwrap();
        gain.set_custom_data(CustomDataType::String, "DSSI:reserved", "y", false).unwrap();
        assert_eq!(gain.custom_data().len(), 1);
        assert_eq!(gain.custom_data()[0].value, "b");
        assert!(gain.set_custom_data(CustomDataType::String, "", "z", false).is_err());
    }

    #[test]
    fn test_chunks_need_uses_chunks() {
        let (mut gain, mut outbox) = instance("gain");
        gain.set_parameter_value(0, 1.5, false, false, false, &mut outbox).unwrap();
        let chunk = gain.chunk_data().unwrap();
        gain.set_parameter_value(0, 0.1, false, false, false, &mut outbox).unwrap();
        gain.set_chunk_data(&chunk).unwrap();
        assert_relative_eq!(gain.parameter_value(0).unwrap(), 1.5);

        let (mut pass, _) = instance("passthrough");
        assert!(matches!(pass.chunk_data(), Err(PluginError::Unsupported(_))));
    }

    #[test]
    fn test_all_notes_off_keeps_reserve() {
        let (mut sine, _) = instance("sine");
        for _ in 0..100 {
            sine.postpone_event(PostEventKind::Debug, 0, 0, 0.0);
        }
        sine.send_midi_all_notes_off();
        assert_eq!(sine.shared().ext_notes.len(), 128);
        assert_eq!(sine.shared().post_events.free_slots(), POST_EVENT_RESERVE);
    }

    #[test]
    fn test_inactive_plugin_outputs_silence() {
        let (mut pass, _) = instance("passthrough");
        let mut ports = ports(&pass, 32);
        ports.audio_in[0].fill(0.5);
        ports.audio_out[0].fill(0.9);
        pass.process(&mut ports, 32, 0);
        assert!(ports.audio_out[0].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_mismatched_ports_are_silenced() {
        let (mut pass, _) = instance("passthrough");
        let mut ports = PortBuffers::new(1, 2, 16);
        ports.audio_out[1].fill(0.3);
        pass.process(&mut ports, 16, 0);
        assert!(ports.audio_out[1].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_activation_is_edge_triggered() {
        let (mut gain, mut outbox) = instance("gain");
        let counters = gain.backend().as_internal().unwrap().counters();
        let mut ports = ports(&gain, 16);

        gain.set_active(true, false, false, &mut outbox);
        gain.process(&mut ports, 16, 0);
        gain.process(&mut ports, 16, 0);
        assert_eq!(counters.activations.load(std::sync::atomic::Ordering::Relaxed), 1);

        gain.set_active(false, false, false, &mut outbox);
        gain.process(&mut ports, 16, 0);
        gain.process(&mut ports, 16, 0);
        assert_eq!(counters.deactivations.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_post_processing_and_peaks() {
        let (mut pass, mut outbox) = instance("passthrough");
        pass.set_active(true, false, false, &mut outbox);
        pass.set_volume(0.5, false, false, &mut outbox);
        let mut ports = ports(&pass, 8);
        ports.audio_in[0].fill(0.8);
        ports.audio_in[1].fill(-0.4);
        pass.process(&mut ports, 8, 0);
        assert_relative_eq!(ports.audio_out[0][3], 0.4);
        assert_relative_eq!(ports.audio_out[1][3], -0.2);
        assert_relative_eq!(pass.peaks.input(PluginId(0), 0), 0.8);
        assert_relative_eq!(pass.peaks.output(PluginId(0), 1), 0.2);
    }

    #[test]
    fn test_control_channel_controllers() {
        let (mut gain, mut outbox) = instance("gain");
        gain.set_active(true, false, false, &mut outbox);
        let mut ports = ports(&gain, 8);
        ports
            .control_in
            .push(ControlEvent::parameter(0, 0, CC_VOLUME as u16, 0.5));
        ports
            .control_in
            .push(ControlEvent::parameter(0, 0, CC_BREATH as u16, 0.25));
        ports
            .control_in
            .push(ControlEvent::parameter(0, 3, CC_VOLUME as u16, 1.0));
        gain.process(&mut ports, 8, 0);
        assert_relative_eq!(gain.volume(), 0.635);
        assert_relative_eq!(gain.dry_wet(), 0.25);

        gain.drain_postponed(&mut outbox);
        let changed: Vec<_> = outbox
            .callbacks
            .iter()
            .filter(|(_, c)| c.kind == CallbackKind::ParameterChanged)
            .map(|(_, c)| c.value1)
            .collect();
        assert_eq!(changed, vec![internal_param::VOLUME, internal_param::DRYWET]);
    }

    #[test]
    fn test_mapped_cc_automates_parameter() {
        let (mut gain, mut outbox) = instance("gain");
        gain.set_parameter_midi_channel(0, 2, false, &mut outbox).unwrap();
        gain.set_parameter_midi_cc(0, 20, false, &mut outbox).unwrap();
        let mut ports = ports(&gain, 8);
        ports.control_in.push(ControlEvent::parameter(2, 2, 20, 0.5));
        // Outside the window.
        ports.control_in.push(ControlEvent::parameter(9, 2, 20, 1.0));
        gain.process(&mut ports, 8, 0);
        assert_relative_eq!(gain.parameter_value(0).unwrap(), 1.0);
        assert_eq!(gain.shared().post_events.len(), 1);
    }

    #[test]
    fn test_control_channel_notes_are_postponed() {
        let (mut sine, mut outbox) = instance("sine");
        sine.set_active(true, false, false, &mut outbox);
        let mut ports = ports(&sine, 64);
        ports.midi_in.push(MidiEvent::note_on(0, 0, 60, 100));
        ports.midi_in.push(MidiEvent::note_on(4, 5, 61, 100));
        ports.midi_in.push(MidiEvent::note_on(8, 0, 60, 0));
        sine.process(&mut ports, 64, 0);

        let events = sine.shared().post_events.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![PostEventKind::NoteOn, PostEventKind::NoteOff]);
        assert!(ports.audio_out[0][2] != 0.0);
    }

    #[test]
    fn test_program_change_from_control_port() {
        let (mut sine, mut outbox) = instance("sine");
        outbox.callbacks.clear();
        let mut ports = ports(&sine, 8);
        ports.control_in.push(ControlEvent {
            frame: 0,
            channel: 0,
            kind: ControlEventKind::MidiProgram { program: 1 },
        });
        sine.process(&mut ports, 8, 0);
        assert_eq!(sine.programs().current, 1);

        sine.drain_postponed(&mut outbox);
        assert_eq!(callbacks(&mut outbox), vec![CallbackKind::ProgramChanged]);
        assert_relative_eq!(sine.parameter_value(0).unwrap(), 0.75);
    }

    #[test]
    fn test_events_stay_in_frame_order() {
        let mut events = MidiEventVec::new();
        push_sorted(&mut events, MidiEvent::note_on(4, 0, 64, 1));
        push_sorted(&mut events, MidiEvent::note_on(0, 0, 60, 1));
        push_sorted(&mut events, MidiEvent::control_change(4, 0, CC_BANK_SELECT, 0));
        push_sorted(&mut events, MidiEvent::note_off(0, 0, 60, 0));
        let order: Vec<_> = events.iter().map(|e| (e.frame, e.data[1])).collect();
        assert_eq!(order, vec![(0, 60), (0, 60), (4, 64), (4, CC_BANK_SELECT)]);
        assert!(events[1].is_note_off());
    }

    #[test]
    fn test_state_messages_order() {
        let (mut sine, _) = instance("sine");
        sine.set_custom_data(CustomDataType::String, "tuning", "equal", false).unwrap();
        let msgs = sine.state_messages();
        assert_eq!(
            msgs,
            vec![
                BridgeMessage::Configure {
                    key: "tuning".into(),
                    value: "equal".into()
                },
                BridgeMessage::Program(0),
                BridgeMessage::Control { rindex: 0, value: 0.25 },
            ]
        );
    }

    #[test]
    fn test_describe_ends_with_update() {
        let (mut gain, _) = instance("gain");
        let msgs = gain.describe("osc.udp://127.0.0.1:9000/plinth/0");
        assert!(matches!(msgs[0], BridgeMessage::PluginInfo { .. }));
        assert_eq!(
            msgs[3],
            BridgeMessage::ParamCount { ins: 2, outs: 0, total: 2 }
        );
        assert!(msgs.iter().any(|m| matches!(m, BridgeMessage::BridgeChunk(_))));
        assert_eq!(
            msgs.last(),
            Some(&BridgeMessage::BridgeUpdate("osc.udp://127.0.0.1:9000/plinth/0".into()))
        );
        let data = msgs
            .iter()
            .find_map(|m| match m {
                BridgeMessage::ParamData { direction, rindex: 1, .. } => Some(*direction),
                _ => None,
            })
            .unwrap();
        assert_eq!(data, ParameterDirection::Input.to_i32());
    }

    #[test]
    fn test_describe_carries_current_program() {
        let (mut sine, _) = instance("sine");
        let mut outbox = Outbox::new();
        sine.set_program(1, false, false, false, &mut outbox).unwrap();
        sine.set_custom_data(CustomDataType::String, "tuning", "equal", false).unwrap();

        let msgs = sine.describe("osc.udp://127.0.0.1:9000/plinth/0");
        let tail: Vec<_> = msgs
            .iter()
            .skip_while(|m| !matches!(m, BridgeMessage::Program(_)))
            .cloned()
            .collect();
        assert_eq!(
            tail,
            vec![
                BridgeMessage::Program(1),
                BridgeMessage::Control { rindex: 0, value: 0.75 },
                BridgeMessage::BridgeUpdate("osc.udp://127.0.0.1:9000/plinth/0".into()),
            ]
        );
        assert!(!msgs.iter().any(|m| matches!(m, BridgeMessage::Configure { .. })));
    }

    #[test]
    fn test_show_gui_without_gui_fails() {
        let (mut gain, mut outbox) = instance("gain");
        let err = gain.show_gui(true, &HostOptions::default(), "osc.udp://127.0.0.1:1/plinth/0", &mut outbox);
        assert!(matches!(err, Err(PluginError::Unsupported(_))));
    }

    #[test]
    fn test_wait_for_ui_times_out() {
        let channel = BridgeChannel::default();
        let options = HostOptions {
            osc_ui_timeout_ms: 30,
            osc_ui_poll_ms: 10,
            ..Default::default()
        };
        assert!(matches!(wait_for_ui(&channel, &options), Err(PluginError::Timeout { .. })));
        channel.endpoint.set("/plinth/0", "");
        channel.endpoint.set_target("osc.udp://127.0.0.1:9000/ui").unwrap();
        assert!(wait_for_ui(&channel, &options).is_ok());
    }

    #[test]
    fn test_ui_messages_from_inbox() {
        let (mut gain, mut outbox) = instance("gain");
        outbox.callbacks.clear();
        gain.shared()
            .post_message(MessageSource::Ui, BridgeMessage::Control { rindex: 0, value: 1.25 });
        gain.shared()
            .post_message(MessageSource::Ui, BridgeMessage::Update("osc.udp://127.0.0.1:9100/ui".into()));
        gain.idle(None, &mut outbox);

        assert_relative_eq!(gain.parameter_value(0).unwrap(), 1.25);
        assert!(gain.shared().ui.endpoint.has_target());
        // Full state was queued for the GUI.
        assert_eq!(gain.shared().ui.queue.len(), gain.state_messages().len());
        assert_eq!(callbacks(&mut outbox), vec![CallbackKind::ParameterChanged]);
    }
}
