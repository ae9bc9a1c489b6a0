//! DSSI: LADSPA plus MIDI, programs, configure keys and external GUIs.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_ulong};
use std::path::{Path, PathBuf};

use super::ladspa::{Handle, LadspaCore, LadspaDescriptor};
use super::{c_string, PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::midi::{
    MidiEvent, MAX_MIDI_EVENTS, STATUS_CHANNEL_PRESSURE, STATUS_CONTROL_CHANGE, STATUS_NOTE_OFF,
    STATUS_NOTE_ON, STATUS_PITCH_BEND, STATUS_POLY_AFTERTOUCH,
};
use crate::options::BridgePaths;
use crate::supervisor::BridgeCommand;
use crate::types::{CustomData, CustomDataType, MidiProgramData, PluginHints, PluginInfo, PluginType, PortGroup};

const DSSI_CC: c_int = 0x2000_0000;

const SND_SEQ_EVENT_NOTEON: u8 = 6;
const SND_SEQ_EVENT_NOTEOFF: u8 = 7;
const SND_SEQ_EVENT_KEYPRESS: u8 = 8;
const SND_SEQ_EVENT_CONTROLLER: u8 = 10;
const SND_SEQ_EVENT_CHANPRESS: u8 = 12;
const SND_SEQ_EVENT_PITCHBEND: u8 = 13;

#[repr(C)]
struct DssiProgramDescriptor {
    bank: c_ulong,
    program: c_ulong,
    name: *const c_char,
}

/// `snd_seq_event_t` with its data union as raw bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct SndSeqEvent {
    kind: u8,
    flags: u8,
    tag: u8,
    queue: u8,
    time: [u32; 2],
    source: [u8; 2],
    dest: [u8; 2],
    data: [u8; 12],
}

impl SndSeqEvent {
    fn note(kind: u8, frame: u32, channel: u8, note: u8, velocity: u8) -> Self {
        let mut ev = Self {
            kind,
            time: [frame, 0],
            ..Default::default()
        };
        ev.data[..3].copy_from_slice(&[channel, note, velocity]);
        ev
    }

    fn control(kind: u8, frame: u32, channel: u8, param: u32, value: i32) -> Self {
        let mut ev = Self {
            kind,
            time: [frame, 0],
            ..Default::default()
        };
        ev.data[0] = channel;
        ev.data[4..8].copy_from_slice(&param.to_ne_bytes());
        ev.data[8..12].copy_from_slice(&value.to_ne_bytes());
        ev
    }

    fn from_midi(event: &MidiEvent) -> Option<Self> {
        let (frame, ch, d1, d2) = (event.frame, event.channel(), event.data[1], event.data[2]);
        Some(match event.status() {
            STATUS_NOTE_ON => Self::note(SND_SEQ_EVENT_NOTEON, frame, ch, d1, d2),
            STATUS_NOTE_OFF => Self::note(SND_SEQ_EVENT_NOTEOFF, frame, ch, d1, d2),
            STATUS_POLY_AFTERTOUCH => Self::note(SND_SEQ_EVENT_KEYPRESS, frame, ch, d1, d2),
            STATUS_CONTROL_CHANGE => Self::control(SND_SEQ_EVENT_CONTROLLER, frame, ch, d1 as u32, d2 as i32),
            STATUS_CHANNEL_PRESSURE => Self::control(SND_SEQ_EVENT_CHANPRESS, frame, ch, 0, d1 as i32),
            STATUS_PITCH_BEND => Self::control(
                SND_SEQ_EVENT_PITCHBEND,
                frame,
                ch,
                0,
                (((d2 as i32) << 7) | d1 as i32) - 8192,
            ),
            _ => return None,
        })
    }
}

#[repr(C)]
struct DssiDescriptor {
    api_version: c_int,
    ladspa: *const LadspaDescriptor,
    configure: Option<unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> *mut c_char>,
    get_program: Option<unsafe extern "C" fn(Handle, c_ulong) -> *const DssiProgramDescriptor>,
    select_program: Option<unsafe extern "C" fn(Handle, c_ulong, c_ulong)>,
    get_midi_controller_for_port: Option<unsafe extern "C" fn(Handle, c_ulong) -> c_int>,
    run_synth: Option<unsafe extern "C" fn(Handle, c_ulong, *mut SndSeqEvent, c_ulong)>,
    run_synth_adding: Option<unsafe extern "C" fn(Handle, c_ulong, *mut SndSeqEvent, c_ulong)>,
    run_multiple_synths: Option<unsafe extern "C" fn(c_ulong, *mut Handle, c_ulong, *mut *mut SndSeqEvent, *mut c_ulong)>,
    run_multiple_synths_adding:
        Option<unsafe extern "C" fn(c_ulong, *mut Handle, c_ulong, *mut *mut SndSeqEvent, *mut c_ulong)>,
}

type DssiDescriptorFn = unsafe extern "C" fn(c_ulong) -> *const DssiDescriptor;

pub struct DssiPlugin {
    descriptor: *const DssiDescriptor,
    label: String,
    /// MIDI CC bound to each control slot, -1 when unbound.
    controllers: Vec<i16>,
    seq_events: Vec<SndSeqEvent>,
    automation: Vec<(u32, f32)>,
    ranges: Vec<(f32, f32)>,
    gui: Option<PathBuf>,
    core: LadspaCore,
}

// See LadspaCore.
unsafe impl Send for DssiPlugin {}

impl DssiPlugin {
    pub fn load(path: &Path, label: &str, sample_rate: f64) -> Result<Self> {
        let library = LadspaCore::open_library(path)?;
        let entry: DssiDescriptorFn = unsafe {
            *library
                .get::<DssiDescriptorFn>(b"dssi_descriptor\0")
                .map_err(|e| PluginError::load(path, LoadStage::Descriptor, format!("No dssi_descriptor symbol: {e}")))?
        };

        let mut index = 0;
        let descriptor = loop {
            let desc = unsafe { entry(index) };
            if desc.is_null() {
                return Err(PluginError::load(
                    path,
                    LoadStage::Descriptor,
                    format!("no plugin labelled '{label}'"),
                ));
            }
            let ladspa = unsafe { (*desc).ladspa };
            if !ladspa.is_null() && (label.is_empty() || unsafe { c_string((*ladspa).label) } == label) {
                break desc;
            }
            index += 1;
        };

        let core = unsafe { LadspaCore::instantiate(library, path, (*descriptor).ladspa, sample_rate)? };
        let label = unsafe { c_string((*(*descriptor).ladspa).label) };
        let gui = find_gui(path, &label);

        let mut plugin = Self {
            descriptor,
            label,
            controllers: Vec::new(),
            seq_events: Vec::with_capacity(MAX_MIDI_EVENTS),
            automation: Vec::with_capacity(MAX_MIDI_EVENTS),
            ranges: Vec::new(),
            gui,
            core,
        };
        plugin.refresh_controllers();
        tracing::debug!("loaded DSSI {} from {}", plugin.label, path.display());
        Ok(plugin)
    }

    fn dssi(&self) -> &DssiDescriptor {
        unsafe { &*self.descriptor }
    }

    fn refresh_controllers(&mut self) {
        let lookup = self.dssi().get_midi_controller_for_port;
        self.controllers = self
            .core
            .controls
            .iter()
            .map(|c| match lookup {
                Some(f) if c.input => {
                    let v = unsafe { f(self.core.handle, c.port) };
                    if v > 0 && v & DSSI_CC != 0 {
                        (v & 0x7F) as i16
                    } else {
                        -1
                    }
                }
                _ => -1,
            })
            .collect();
        self.ranges = (0..self.core.controls.len())
            .map(|slot| {
                let r = self.core.control_ranges(slot);
                (r.min, r.max)
            })
            .collect();
    }

    fn programs(&self) -> Vec<MidiProgramData> {
        let Some(get_program) = self.dssi().get_program else {
            return Vec::new();
        };
        let mut programs = Vec::new();
        for index in 0.. {
            let desc = unsafe { get_program(self.core.handle, index) };
            if desc.is_null() {
                break;
            }
            let desc = unsafe { &*desc };
            programs.push(MidiProgramData::new(
                desc.bank as u32,
                desc.program as u32,
                unsafe { c_string(desc.name) },
            ));
        }
        programs
    }

    /// Bound CCs drive their port instead of reaching the plugin.
    fn map_controller(&mut self, cc: u8, value: u8) -> bool {
        let Some(slot) = self.controllers.iter().position(|c| *c == cc as i16) else {
            return false;
        };
        let (min, max) = self.ranges[slot];
        let v = min + (max - min) * (value as f32 / 127.0);
        self.core.values[slot] = v;
        if self.automation.len() < self.automation.capacity() {
            self.automation.push((self.core.controls[slot].port as u32, v));
        }
        true
    }
}

/// GUIs live in `<dir>/<stem>/<label>_<toolkit>`.
fn find_gui(path: &Path, label: &str) -> Option<PathBuf> {
    let dir = path.parent()?.join(path.file_stem()?);
    let prefix = format!("{label}_");
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
}

impl PluginBackend for DssiPlugin {
    fn kind(&self) -> PluginType {
        PluginType::Dssi
    }

    fn info(&self) -> PluginInfo {
        self.core.info()
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        self.refresh_controllers();
        let mut layout = self.core.layout();
        for (param, cc) in layout.parameters.iter_mut().zip(&self.controllers) {
            param.data.midi_cc = *cc;
        }
        layout.midi_programs = self.programs();
        if self.dssi().run_synth.is_some() {
            layout.midi_ins = PortGroup::sequential(1);
            if layout.audio_ins.count() == 0 {
                layout.hints.insert(PluginHints::IS_SYNTH);
            }
        }
        if self.gui.is_some() {
            layout.hints.insert(PluginHints::HAS_GUI);
        }
        Ok(layout)
    }

    fn activate(&mut self) {
        self.core.activate();
    }

    fn deactivate(&mut self) {
        self.core.deactivate();
    }

    fn run(&mut self, mut ctx: RunContext<'_>) {
        let Some(run_synth) = self.dssi().run_synth else {
            self.core.run(ctx);
            return;
        };

        self.seq_events.clear();
        for event in ctx.events {
            if event.status() == STATUS_CONTROL_CHANGE && self.map_controller(event.data[1], event.data[2]) {
                continue;
            }
            if self.seq_events.len() == self.seq_events.capacity() {
                break;
            }
            if let Some(ev) = SndSeqEvent::from_midi(event) {
                self.seq_events.push(ev);
            }
        }

        if self.core.connect_audio(&mut ctx) {
            unsafe {
                run_synth(
                    self.core.handle,
                    ctx.frames as c_ulong,
                    self.seq_events.as_mut_ptr(),
                    self.seq_events.len() as c_ulong,
                )
            };
        }
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        self.core.set_value(rindex, value);
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.core.value(rindex)
    }

    fn select_midi_program(&mut self, bank: u32, program: u32) {
        if let Some(select) = self.dssi().select_program {
            unsafe { select(self.core.handle, bank as c_ulong, program as c_ulong) };
        }
    }

    fn set_custom_data(&mut self, data: &CustomData) -> Result<()> {
        if data.kind != CustomDataType::String {
            return Ok(());
        }
        let Some(configure) = self.dssi().configure else {
            return Ok(());
        };
        let key = CString::new(data.key.as_str()).map_err(|e| PluginError::Protocol(e.to_string()))?;
        let value = CString::new(data.value.as_str()).map_err(|e| PluginError::Protocol(e.to_string()))?;
        let message = unsafe { configure(self.core.handle, key.as_ptr(), value.as_ptr()) };
        if !message.is_null() {
            // Allocated by the plugin with malloc; not ours to free without libc.
            let text = unsafe { c_string(message) };
            tracing::warn!("DSSI configure '{}': {}", data.key, text);
        }
        Ok(())
    }

    fn ui_bridge(&self, _paths: &BridgePaths, url: &str, title: &str) -> Option<BridgeCommand> {
        self.gui.as_ref().map(|gui| BridgeCommand::DssiUi {
            gui: gui.clone(),
            url: url.to_string(),
            filename: self.core.path.clone(),
            label: self.label.clone(),
            ui_title: title.to_string(),
        })
    }

    fn take_automation(&mut self, out: &mut Vec<(u32, f32)>) {
        out.append(&mut self.automation);
    }
}
