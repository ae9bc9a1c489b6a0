//! LV2 plugins through lilv.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::PathBuf;

use lilv::instance::{ActiveInstance, Instance};
use lilv::World;
use lv2_raw::{
    lv2_atom_sequence_append_event, LV2AtomEvent, LV2AtomSequence, LV2AtomSequenceBody, LV2Feature,
    LV2Urid, LV2UridMap, LV2UridMapHandle,
};
use parking_lot::Mutex;

use super::{PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::options::BridgePaths;
use crate::supervisor::BridgeCommand;
use crate::types::{
    Parameter, ParameterData, ParameterHints, ParameterInfo, ParameterRanges, PluginHints, PluginInfo,
    PluginType, PortGroup,
};

const ATOM_BUFFER_BYTES: usize = 16 * 1024;

const LV2_CORE_INPUT: &str = "http://lv2plug.in/ns/lv2core#InputPort";
const LV2_CORE_AUDIO: &str = "http://lv2plug.in/ns/lv2core#AudioPort";
const LV2_CORE_CONTROL: &str = "http://lv2plug.in/ns/lv2core#ControlPort";
const LV2_CORE_TOGGLED: &str = "http://lv2plug.in/ns/lv2core#toggled";
const LV2_CORE_INTEGER: &str = "http://lv2plug.in/ns/lv2core#integer";
const LV2_CORE_SAMPLE_RATE: &str = "http://lv2plug.in/ns/lv2core#sampleRate";
const LV2_PORT_PROPS_LOGARITHMIC: &str = "http://lv2plug.in/ns/ext/port-props#logarithmic";
const LV2_ATOM_PORT: &str = "http://lv2plug.in/ns/ext/atom#AtomPort";
const LV2_MIDI_EVENT: &str = "http://lv2plug.in/ns/ext/midi#MidiEvent";
const LV2_ATOM__SEQUENCE: &str = "http://lv2plug.in/ns/ext/atom#Sequence";
const LV2_ATOM__FRAMETIME: &str = "http://lv2plug.in/ns/ext/atom#frameTime";
const LV2_URID__MAP: &str = "http://lv2plug.in/ns/ext/urid#map";
const LV2_UI_X11: &str = "http://lv2plug.in/ns/extensions/ui#X11UI";

#[derive(Default)]
struct UridTable {
    next: LV2Urid,
    by_uri: HashMap<String, LV2Urid>,
}

impl UridTable {
    fn map(&mut self, uri: &str) -> LV2Urid {
        if let Some(id) = self.by_uri.get(uri) {
            return *id;
        }
        self.next += 1;
        self.by_uri.insert(uri.to_string(), self.next);
        self.next
    }
}

/// `urid:map` handed to the plugin. The table is boxed so its address is stable.
struct UridMapFeature {
    _uri: CString,
    feature: LV2Feature,
    _map: Box<LV2UridMap>,
    table: Box<Mutex<UridTable>>,
}

unsafe impl Send for UridMapFeature {}

extern "C" fn urid_map(handle: LV2UridMapHandle, uri: *const c_char) -> LV2Urid {
    if handle.is_null() || uri.is_null() {
        return 0;
    }
    let Ok(uri) = unsafe { CStr::from_ptr(uri) }.to_str() else {
        return 0;
    };
    let table = unsafe { &*(handle as *const Mutex<UridTable>) };
    table.lock().map(uri)
}

impl UridMapFeature {
    fn new() -> Result<Self> {
        let table = Box::new(Mutex::new(UridTable::default()));
        let mut map = Box::new(LV2UridMap {
            handle: (&*table as *const Mutex<UridTable>) as *mut c_void,
            map: urid_map,
        });
        let uri = CString::new(LV2_URID__MAP).map_err(|e| PluginError::Protocol(e.to_string()))?;
        let feature = LV2Feature {
            uri: uri.as_ptr(),
            data: (&mut *map as *mut LV2UridMap).cast::<c_void>(),
        };
        Ok(Self {
            _uri: uri,
            feature,
            _map: map,
            table,
        })
    }

    fn map(&self, uri: &str) -> LV2Urid {
        self.table.lock().map(uri)
    }
}

/// Atom sequence storage, u64-aligned.
struct AtomBuffer {
    words: Vec<u64>,
}

impl AtomBuffer {
    fn new() -> Self {
        Self {
            words: vec![0; ATOM_BUFFER_BYTES / 8],
        }
    }

    fn ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    fn reset(&mut self, sequence: LV2Urid, frame_time: LV2Urid, output: bool) {
        self.words.fill(0);
        let seq = self.ptr() as *mut LV2AtomSequence;
        unsafe {
            (*seq).atom.mytype = sequence;
            (*seq).atom.size = if output {
                (ATOM_BUFFER_BYTES - std::mem::size_of::<lv2_raw::LV2Atom>()) as u32
            } else {
                std::mem::size_of::<LV2AtomSequenceBody>() as u32
            };
            (*seq).body.unit = frame_time;
            (*seq).body.pad = 0;
        }
    }
}

enum Lv2Instance {
    Inactive(Instance),
    Active(ActiveInstance),
    Empty,
}

#[derive(Clone, Copy)]
enum Binding {
    AudioIn(usize),
    AudioOut(usize),
    AtomIn(usize),
    AtomOut(usize),
    Control(usize),
}

pub struct Lv2Plugin {
    uri: String,
    info: PluginInfo,
    instance: Lv2Instance,
    bindings: Vec<Binding>,
    values: Box<[f32]>,
    parameters: Vec<Parameter>,
    atom_ins: Vec<AtomBuffer>,
    atom_outs: Vec<AtomBuffer>,
    audio_ins: usize,
    audio_outs: usize,
    sequence_urid: LV2Urid,
    frame_time_urid: LV2Urid,
    midi_urid: LV2Urid,
    ui: Option<(String, PathBuf, PathBuf)>,
    _urid: UridMapFeature,
    _world: World,
}

// Instances are only driven by the thread owning the plugin.
unsafe impl Send for Lv2Plugin {}

fn file_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

impl Lv2Plugin {
    /// Value slot of a control port.
    fn control_slot(&self, port: u32) -> Option<usize> {
        match self.bindings.get(port as usize) {
            Some(Binding::Control(slot)) => Some(*slot),
            _ => None,
        }
    }

    pub fn load(uri: &str, sample_rate: f64, _buffer_size: usize) -> Result<Self> {
        let world = World::new();
        world.load_all();

        let plugin = world
            .plugins()
            .plugin(&world.new_uri(uri))
            .ok_or_else(|| PluginError::load(uri, LoadStage::Opening, "plugin not found"))?;
        if !plugin.verify() {
            return Err(PluginError::load(uri, LoadStage::Descriptor, "plugin failed verification"));
        }

        let urid = UridMapFeature::new()?;
        let instance = unsafe { plugin.instantiate(sample_rate, vec![&urid.feature]) }
            .ok_or_else(|| PluginError::load(uri, LoadStage::Instantiation, "instantiate returned null"))?;

        let input = world.new_uri(LV2_CORE_INPUT);
        let audio = world.new_uri(LV2_CORE_AUDIO);
        let control = world.new_uri(LV2_CORE_CONTROL);
        let atom = world.new_uri(LV2_ATOM_PORT);
        let toggled = world.new_uri(LV2_CORE_TOGGLED);
        let integer = world.new_uri(LV2_CORE_INTEGER);
        let sample_rate_prop = world.new_uri(LV2_CORE_SAMPLE_RATE);
        let logarithmic = world.new_uri(LV2_PORT_PROPS_LOGARITHMIC);

        let mut bindings = Vec::new();
        let mut parameters = Vec::new();
        let mut values = Vec::new();
        let (mut audio_ins, mut audio_outs, mut atom_ins, mut atom_outs) = (0, 0, 0, 0);

        for port in plugin.iter_ports() {
            let is_input = port.is_a(&input);
            let binding = if port.is_a(&audio) {
                if is_input {
                    audio_ins += 1;
                    Binding::AudioIn(audio_ins - 1)
                } else {
                    audio_outs += 1;
                    Binding::AudioOut(audio_outs - 1)
                }
            } else if port.is_a(&atom) {
                if is_input {
                    atom_ins += 1;
                    Binding::AtomIn(atom_ins - 1)
                } else {
                    atom_outs += 1;
                    Binding::AtomOut(atom_outs - 1)
                }
            } else {
                let range = port.range();
                let float = |n: Option<lilv::node::Node>| n.and_then(|n| n.as_float());
                let def = float(range.default).unwrap_or(0.0);
                let mut min = float(range.minimum).unwrap_or(0.0);
                let mut max = float(range.maximum).unwrap_or(1.0);

                let mut hints = if is_input {
                    ParameterHints::ENABLED | ParameterHints::AUTOMABLE
                } else {
                    ParameterHints::ENABLED
                };
                hints.set(ParameterHints::BOOLEAN, port.has_property(&toggled));
                hints.set(ParameterHints::INTEGER, port.has_property(&integer));
                hints.set(ParameterHints::LOGARITHMIC, port.has_property(&logarithmic));
                if port.has_property(&sample_rate_prop) {
                    hints.insert(ParameterHints::USES_SAMPLERATE);
                    min *= sample_rate as f32;
                    max *= sample_rate as f32;
                }

                let slot = values.len();
                let name = port
                    .name()
                    .and_then(|n| n.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("Port {}", port.index()));
                let symbol = port
                    .symbol()
                    .and_then(|n| n.as_str().map(str::to_string))
                    .unwrap_or_default();
                // The backend index is the LV2 port index, shared with plugin UIs.
                let port_index = bindings.len() as i32;
                let data = if is_input {
                    ParameterData::input(slot as i32, port_index)
                } else {
                    ParameterData::output(slot as i32, port_index)
                };
                let mut param = Parameter::new(
                    ParameterData { hints, ..data },
                    ParameterRanges::new(def, min, max),
                    ParameterInfo::new(name),
                );
                param.info.symbol = symbol;
                values.push(param.value);
                if port.is_a(&control) {
                    parameters.push(param);
                }
                Binding::Control(slot)
            };
            bindings.push(binding);
        }

        let name = plugin.name().as_str().map(str::to_string).unwrap_or_else(|| uri.to_string());
        let info = PluginInfo::new(uri, name);

        let x11 = world.new_uri(LV2_UI_X11);
        let ui = plugin.uis().and_then(|uis| {
            uis.iter().find(|ui| ui.is_a(&x11)).and_then(|ui| {
                let ui_uri = ui.uri().as_uri()?.to_string();
                let binary = file_path(ui.binary_uri()?.as_uri()?);
                let bundle = file_path(ui.bundle_uri()?.as_uri()?);
                Some((ui_uri, binary, bundle))
            })
        });

        let mut plugin = Self {
            uri: uri.to_string(),
            info,
            instance: Lv2Instance::Inactive(instance),
            bindings,
            values: values.into_boxed_slice(),
            parameters,
            atom_ins: (0..atom_ins).map(|_| AtomBuffer::new()).collect(),
            atom_outs: (0..atom_outs).map(|_| AtomBuffer::new()).collect(),
            audio_ins,
            audio_outs,
            sequence_urid: urid.map(LV2_ATOM__SEQUENCE),
            frame_time_urid: urid.map(LV2_ATOM__FRAMETIME),
            midi_urid: urid.map(LV2_MIDI_EVENT),
            ui,
            _urid: urid,
            _world: world,
        };
        plugin.connect_static_ports();
        tracing::debug!("loaded LV2 {}", plugin.uri);
        Ok(plugin)
    }

    unsafe fn connect(&mut self, port: usize, ptr: *mut c_void) {
        match &mut self.instance {
            Lv2Instance::Inactive(i) => i.connect_port_mut(port, ptr),
            Lv2Instance::Active(a) => a.instance_mut().connect_port_mut(port, ptr),
            Lv2Instance::Empty => {}
        }
    }

    fn connect_static_ports(&mut self) {
        for port in 0..self.bindings.len() {
            let ptr: *mut c_void = match self.bindings[port] {
                Binding::Control(slot) => (&mut self.values[slot] as *mut f32).cast(),
                Binding::AtomIn(k) => self.atom_ins[k].ptr().cast(),
                Binding::AtomOut(k) => self.atom_outs[k].ptr().cast(),
                _ => continue,
            };
            unsafe { self.connect(port, ptr) };
        }
    }

    fn write_midi(&mut self, events: &[crate::midi::MidiEvent]) {
        let (sequence, frame_time, midi) = (self.sequence_urid, self.frame_time_urid, self.midi_urid);
        for (k, buffer) in self.atom_ins.iter_mut().enumerate() {
            buffer.reset(sequence, frame_time, false);
            if k > 0 {
                continue;
            }
            let seq = buffer.ptr() as *mut LV2AtomSequence;
            let capacity = (ATOM_BUFFER_BYTES - std::mem::size_of::<lv2_raw::LV2Atom>()) as u32;
            for event in events {
                let mut raw = [0u64; 4];
                let ev = raw.as_mut_ptr() as *mut LV2AtomEvent;
                let bytes = event.bytes();
                unsafe {
                    (*ev).time_in_frames = event.frame as i64;
                    (*ev).body.mytype = midi;
                    (*ev).body.size = bytes.len() as u32;
                    let data = (ev as *mut u8).add(std::mem::size_of::<LV2AtomEvent>());
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
                    if lv2_atom_sequence_append_event(seq, capacity, ev).is_null() {
                        break;
                    }
                }
            }
        }
        for buffer in &mut self.atom_outs {
            buffer.reset(sequence, frame_time, true);
        }
    }
}

impl PluginBackend for Lv2Plugin {
    fn kind(&self) -> PluginType {
        PluginType::Lv2
    }

    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        let mut parameters = self.parameters.clone();
        for param in &mut parameters {
            param.value = self.parameter_value(param.data.rindex as u32);
        }
        let mut hints = PluginHints::empty();
        if self.ui.is_some() {
            hints.insert(PluginHints::HAS_GUI);
        }
        if self.audio_ins == 0 && !self.atom_ins.is_empty() {
            hints.insert(PluginHints::IS_SYNTH);
        }
        Ok(PluginLayout {
            audio_ins: PortGroup::sequential(self.audio_ins),
            audio_outs: PortGroup::sequential(self.audio_outs),
            midi_ins: PortGroup::sequential(self.atom_ins.len().min(1)),
            midi_outs: PortGroup::sequential(self.atom_outs.len().min(1)),
            parameters,
            hints,
            ..Default::default()
        })
    }

    fn activate(&mut self) {
        if let Lv2Instance::Inactive(instance) = std::mem::replace(&mut self.instance, Lv2Instance::Empty) {
            self.instance = Lv2Instance::Active(unsafe { instance.activate() });
        }
    }

    fn deactivate(&mut self) {
        if let Lv2Instance::Active(active) = std::mem::replace(&mut self.instance, Lv2Instance::Empty) {
            self.instance = Lv2Instance::Inactive(unsafe { active.deactivate() });
        }
    }

    fn run(&mut self, ctx: RunContext<'_>) {
        if !matches!(self.instance, Lv2Instance::Active(_)) {
            return;
        }
        if ctx.inputs.len() < self.audio_ins || ctx.outputs.len() < self.audio_outs {
            return;
        }
        self.write_midi(ctx.events);
        for port in 0..self.bindings.len() {
            let ptr: *mut c_void = match self.bindings[port] {
                Binding::AudioIn(k) => unsafe { ctx.inputs[k].as_ptr().add(ctx.offset) as *mut c_void },
                Binding::AudioOut(k) => unsafe { ctx.outputs[k].as_mut_ptr().add(ctx.offset).cast() },
                _ => continue,
            };
            unsafe { self.connect(port, ptr) };
        }
        if let Lv2Instance::Active(active) = &mut self.instance {
            unsafe { active.run(ctx.frames) };
        }
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        if let Some(slot) = self.control_slot(rindex) {
            self.values[slot] = value;
        }
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.control_slot(rindex).map_or(0.0, |slot| self.values[slot])
    }

    fn ui_bridge(&self, paths: &BridgePaths, url: &str, title: &str) -> Option<BridgeCommand> {
        let _ = paths;
        self.ui.as_ref().map(|(ui_uri, binary, bundle)| BridgeCommand::Lv2Ui {
            url: url.to_string(),
            plugin_uri: self.uri.clone(),
            ui_uri: ui_uri.clone(),
            ui_binary: binary.clone(),
            ui_bundle: bundle.clone(),
            ui_title: title.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urid_map_is_stable() {
        let feature = UridMapFeature::new().unwrap();
        let a = feature.map(LV2_MIDI_EVENT);
        let b = feature.map(LV2_ATOM__SEQUENCE);
        assert_ne!(a, b);
        assert_eq!(feature.map(LV2_MIDI_EVENT), a);

        let uri = CString::new(LV2_MIDI_EVENT).unwrap();
        let map = unsafe { &*(feature.feature.data as *const LV2UridMap) };
        assert_eq!(urid_map(map.handle, uri.as_ptr()), a);
    }

    #[test]
    fn test_unknown_uri_fails() {
        assert!(Lv2Plugin::load("urn:plinth:does-not-exist", 48000.0, 512).is_err());
    }

    #[test]
    fn test_file_uri_to_path() {
        assert_eq!(file_path("file:///usr/lib/lv2/x.lv2/"), PathBuf::from("/usr/lib/lv2/x.lv2/"));
    }
}
