//! Host side of a plugin running in a `plinth-bridge-plugin` child.
//!
//! The backend keeps a mirror of everything the child reported and forwards every
//! edit over the plugin's [`BridgeChannel`]. Audio is rendered in the child, so
//! [`run`](PluginBackend::run) only clears the outputs.
//!
//! Handshake:
//!
//! 1. the child sends `bridge_update <child url>`; the host targets it and answers
//!    with `update <host url>`;
//! 2. the child dumps its info, ports, parameters, programs and custom data, then
//!    sends `bridge_update` again;
//! 3. the host swaps the staged report in and reloads the plugin.

use std::sync::Arc;

use super::{LoadRequest, PluginBackend, PluginLayout, RunContext};
use crate::error::{PluginError, Result};
use crate::options::BridgePaths;
use crate::protocol::BridgeMessage;
use crate::supervisor::{BridgeCommand, BridgeProcess, BridgeState};
use crate::transport::BridgeChannel;
use crate::types::{
    internal_param, CustomData, CustomDataType, MidiProgramData, Parameter, ParameterData,
    ParameterDirection, ParameterHints, ParameterInfo, ParameterRanges, PluginCategory, PluginHints,
    PluginInfo, PluginType, PortGroup,
};

/// Everything the child reported about its plugin.
#[derive(Clone, Debug, Default)]
pub struct BridgeMirror {
    pub info: PluginInfo,
    pub hints: PluginHints,
    pub audio_ins: usize,
    pub audio_outs: usize,
    pub midi_ins: usize,
    pub midi_outs: usize,
    pub parameters: Vec<Parameter>,
    pub programs: Vec<String>,
    pub midi_programs: Vec<MidiProgramData>,
    pub custom_data: Vec<CustomData>,
    pub chunk: Option<Vec<u8>>,
    /// Selection the child reported, as program indexes.
    pub program: Option<i32>,
    pub midi_program: Option<i32>,
}

impl BridgeMirror {
    fn set_custom_data(&mut self, data: CustomData) {
        match self.custom_data.iter_mut().find(|d| d.key == data.key) {
            Some(existing) => *existing = data,
            None => self.custom_data.push(data),
        }
    }

    fn parameter_mut(&mut self, index: i32) -> Option<&mut Parameter> {
        usize::try_from(index).ok().and_then(|i| self.parameters.get_mut(i))
    }

    fn set_value(&mut self, rindex: i32, value: f32) {
        if let Some(param) = self.parameters.iter_mut().find(|p| p.data.rindex == rindex) {
            param.value = value;
        }
    }
}

/// What the instance has to do after a report was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeEvent {
    None,
    /// The child finished a state dump; reload from the mirror.
    Reload,
}

pub struct BridgeBackend {
    kind: PluginType,
    /// URL the child sends its messages to.
    host_url: String,
    process: BridgeProcess,
    mirror: BridgeMirror,
    staged: BridgeMirror,
}

impl BridgeBackend {
    /// Starts the child for `request`. `host_url` is this plugin's address on the
    /// host's OSC server.
    pub fn spawn(
        request: &LoadRequest,
        paths: &BridgePaths,
        host_url: &str,
        channel: Arc<BridgeChannel>,
    ) -> Result<Self> {
        let command = BridgeCommand::Plugin {
            url: host_url.to_string(),
            kind: request.kind,
            filename: request.filename.clone(),
            label: request.label.clone(),
        };
        let process = BridgeProcess::spawn(paths, &command, channel)?;
        Ok(Self::with_process(request, host_url, process))
    }

    /// A backend around an already running peer.
    pub fn with_process(request: &LoadRequest, host_url: &str, process: BridgeProcess) -> Self {
        let mirror = BridgeMirror {
            info: PluginInfo::new(request.label.clone(), request.label.clone()),
            ..Default::default()
        };
        Self {
            kind: request.kind,
            host_url: host_url.to_string(),
            process,
            staged: mirror.clone(),
            mirror,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.process.state()
    }

    pub fn mirror(&self) -> &BridgeMirror {
        &self.mirror
    }

    pub fn channel(&self) -> &Arc<BridgeChannel> {
        self.process.channel()
    }

    fn send(&self, msg: BridgeMessage) {
        self.process.channel().push(msg);
    }

    /// Records a value the child changed on its own.
    pub fn mirror_control(&mut self, rindex: i32, value: f32) {
        self.mirror.set_value(rindex, value);
        self.staged.set_value(rindex, value);
    }

    /// Forwards a MIDI message to the child.
    pub fn send_midi(&self, data: [u8; 4]) {
        self.send(BridgeMessage::Midi(data));
    }

    pub fn close(&mut self) {
        self.process.close();
    }

    pub fn wait_exit(&mut self) {
        self.process.wait_exit();
    }

    /// Returns true when the child went away since the last poll.
    pub fn poll(&mut self) -> bool {
        self.process.poll()
    }

    pub fn exited(&mut self) {
        self.process.exited();
    }

    /// Applies one `bridge_*` report from the child.
    pub fn handle_report(&mut self, msg: BridgeMessage) -> Result<BridgeEvent> {
        let staged = &mut self.staged;
        match msg {
            BridgeMessage::BridgeUpdate(url) => return self.handle_update(&url),
            BridgeMessage::PluginInfo {
                category,
                hints,
                name,
                label,
                maker,
                copyright,
                unique_id,
            } => {
                // First report of a dump; the selection is re-sent after it.
                staged.program = None;
                staged.midi_program = None;
                staged.info = PluginInfo::new(label, name)
                    .maker(maker)
                    .copyright(copyright)
                    .category(PluginCategory::from_i32(category))
                    .unique_id(unique_id);
                staged.hints = PluginHints::from_bits_truncate(hints as u32);
            }
            BridgeMessage::AudioCount { ins, outs, .. } => {
                staged.audio_ins = ins.max(0) as usize;
                staged.audio_outs = outs.max(0) as usize;
            }
            BridgeMessage::MidiCount { ins, outs, .. } => {
                staged.midi_ins = ins.max(0) as usize;
                staged.midi_outs = outs.max(0) as usize;
            }
            BridgeMessage::ParamCount { total, .. } => {
                staged.parameters = (0..total.max(0))
                    .map(|i| {
                        Parameter::new(
                            ParameterData::input(i, i),
                            ParameterRanges::default(),
                            ParameterInfo::default(),
                        )
                    })
                    .collect();
            }
            BridgeMessage::ParamInfo { index, name, unit } => {
                let param = staged.parameter_mut(index).ok_or(PluginError::InvalidParameter(index))?;
                param.info = ParameterInfo::new(name).unit(unit);
            }
            BridgeMessage::ParamData {
                direction,
                index,
                rindex,
                hints,
                midi_channel,
                midi_cc,
            } => {
                let param = staged.parameter_mut(index).ok_or(PluginError::InvalidParameter(index))?;
                param.data = ParameterData {
                    direction: ParameterDirection::from_i32(direction),
                    index,
                    rindex,
                    hints: ParameterHints::from_bits_truncate(hints as u32),
                    midi_channel: midi_channel.clamp(0, 15) as u8,
                    midi_cc: midi_cc.clamp(-1, 0x7F) as i16,
                };
            }
            BridgeMessage::ParamRanges {
                index,
                def,
                min,
                max,
                step,
                step_small,
                step_large,
            } => {
                let param = staged.parameter_mut(index).ok_or(PluginError::InvalidParameter(index))?;
                param.ranges = ParameterRanges {
                    def,
                    min,
                    max,
                    step,
                    step_small,
                    step_large,
                }
                .fixed();
                param.value = param.ranges.def;
            }
            BridgeMessage::ProgramCount(count) => {
                staged.programs = vec![String::new(); count.max(0) as usize];
            }
            BridgeMessage::ProgramInfo { index, name } => {
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| staged.programs.get_mut(i))
                    .ok_or(PluginError::InvalidProgram(index))?;
                *slot = name;
            }
            BridgeMessage::MidiProgramCount(count) => {
                staged.midi_programs = vec![MidiProgramData::default(); count.max(0) as usize];
            }
            BridgeMessage::MidiProgramInfo {
                index,
                bank,
                program,
                name,
            } => {
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| staged.midi_programs.get_mut(i))
                    .ok_or(PluginError::InvalidProgram(index))?;
                *slot = MidiProgramData::new(bank.max(0) as u32, program.max(0) as u32, name);
            }
            BridgeMessage::CustomData { kind, key, value } => {
                let data = CustomData {
                    kind: kind.parse()?,
                    key,
                    value,
                };
                staged.set_custom_data(data.clone());
                self.mirror.set_custom_data(data);
            }
            BridgeMessage::BridgeChunk(data) => {
                staged.chunk = Some(data.clone());
                self.mirror.chunk = Some(data);
            }
            BridgeMessage::Control { rindex, value } => self.mirror_control(rindex, value),
            BridgeMessage::Program(index) => {
                staged.program = Some(index);
                self.mirror.program = Some(index);
            }
            BridgeMessage::MidiProgram { bank, program } => {
                let index = staged
                    .midi_programs
                    .iter()
                    .position(|p| p.bank as i32 == bank && p.program as i32 == program)
                    .map_or(-1, |i| i as i32);
                staged.midi_program = Some(index);
                self.mirror.midi_program = Some(index);
            }
            other => {
                return Err(PluginError::Protocol(format!(
                    "'{}' is not a bridge report",
                    other.method()
                )))
            }
        }
        Ok(BridgeEvent::None)
    }

    fn handle_update(&mut self, url: &str) -> Result<BridgeEvent> {
        match self.process.state() {
            BridgeState::Spawned => {
                self.channel().endpoint.set_target(url)?;
                self.process.mark_registered();
                self.send(BridgeMessage::Update(self.host_url.clone()));
                tracing::debug!("bridge registered at {url}");
                Ok(BridgeEvent::None)
            }
            BridgeState::Registered | BridgeState::Active => {
                self.mirror = self.staged.clone();
                self.process.mark_active();
                Ok(BridgeEvent::Reload)
            }
            BridgeState::Closing | BridgeState::Gone => Ok(BridgeEvent::None),
        }
    }
}

impl PluginBackend for BridgeBackend {
    fn kind(&self) -> PluginType {
        self.kind
    }

    fn info(&self) -> PluginInfo {
        self.mirror.info.clone()
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        let m = &self.mirror;
        Ok(PluginLayout {
            audio_ins: PortGroup::sequential(m.audio_ins),
            audio_outs: PortGroup::sequential(m.audio_outs),
            midi_ins: PortGroup::sequential(m.midi_ins),
            midi_outs: PortGroup::sequential(m.midi_outs),
            parameters: m.parameters.clone(),
            programs: m.programs.clone(),
            midi_programs: m.midi_programs.clone(),
            hints: PluginHints::from_bits_truncate(
                m.hints.bits()
                    & (PluginHints::HAS_GUI | PluginHints::IS_SYNTH | PluginHints::USES_CHUNKS).bits(),
            ),
        })
    }

    fn activate(&mut self) {
        self.send(BridgeMessage::Control {
            rindex: internal_param::ACTIVE,
            value: 1.0,
        });
    }

    fn deactivate(&mut self) {
        self.send(BridgeMessage::Control {
            rindex: internal_param::ACTIVE,
            value: 0.0,
        });
    }

    fn run(&mut self, ctx: RunContext<'_>) {
        let range = ctx.range();
        for out in ctx.outputs.iter_mut() {
            out[range.clone()].fill(0.0);
        }
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        self.mirror_control(rindex as i32, value);
        self.send(BridgeMessage::Control {
            rindex: rindex as i32,
            value,
        });
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.mirror
            .parameters
            .iter()
            .find(|p| p.data.rindex == rindex as i32)
            .map_or(0.0, |p| p.value)
    }

    fn select_program(&mut self, index: usize) {
        self.mirror.program = Some(index as i32);
        self.send(BridgeMessage::Program(index as i32));
    }

    fn selected_programs(&self) -> Option<(i32, i32)> {
        Some((
            self.mirror.program.unwrap_or(-1),
            self.mirror.midi_program.unwrap_or(-1),
        ))
    }

    fn select_midi_program(&mut self, bank: u32, program: u32) {
        self.mirror.midi_program = self
            .mirror
            .midi_programs
            .iter()
            .position(|p| p.bank == bank && p.program == program)
            .map(|i| i as i32);
        self.send(BridgeMessage::MidiProgram {
            bank: bank as i32,
            program: program as i32,
        });
    }

    fn set_custom_data(&mut self, data: &CustomData) -> Result<()> {
        if data.kind == CustomDataType::String {
            self.send(BridgeMessage::Configure {
                key: data.key.clone(),
                value: data.value.clone(),
            });
        }
        self.mirror.set_custom_data(data.clone());
        Ok(())
    }

    fn chunk(&mut self) -> Result<Vec<u8>> {
        self.mirror
            .chunk
            .clone()
            .ok_or_else(|| PluginError::Unsupported("bridge reported no chunk".into()))
    }

    fn set_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.mirror.chunk = Some(data.to_vec());
        self.send(BridgeMessage::Chunk(data.to_vec()));
        Ok(())
    }

    fn show_gui(&mut self, show: bool) -> Result<()> {
        self.send(if show { BridgeMessage::Show } else { BridgeMessage::Hide });
        Ok(())
    }
}
