//! LADSPA plugins, and the descriptor plumbing DSSI builds on.

use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::path::{Path, PathBuf};

use super::{c_string, PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::types::{
    Parameter, ParameterData, ParameterHints, ParameterInfo, ParameterRanges, PluginInfo,
    PluginType, PortGroup,
};

pub(crate) type Handle = *mut c_void;

pub(crate) const PORT_INPUT: c_int = 0x1;
pub(crate) const PORT_OUTPUT: c_int = 0x2;
pub(crate) const PORT_CONTROL: c_int = 0x4;
pub(crate) const PORT_AUDIO: c_int = 0x8;

const HINT_BOUNDED_BELOW: c_int = 0x1;
const HINT_BOUNDED_ABOVE: c_int = 0x2;
const HINT_TOGGLED: c_int = 0x4;
const HINT_SAMPLE_RATE: c_int = 0x8;
const HINT_LOGARITHMIC: c_int = 0x10;
const HINT_INTEGER: c_int = 0x20;

const HINT_DEFAULT_MASK: c_int = 0x3C0;
const HINT_DEFAULT_MINIMUM: c_int = 0x40;
const HINT_DEFAULT_LOW: c_int = 0x80;
const HINT_DEFAULT_MIDDLE: c_int = 0xC0;
const HINT_DEFAULT_HIGH: c_int = 0x100;
const HINT_DEFAULT_MAXIMUM: c_int = 0x140;
const HINT_DEFAULT_0: c_int = 0x200;
const HINT_DEFAULT_1: c_int = 0x240;
const HINT_DEFAULT_100: c_int = 0x280;
const HINT_DEFAULT_440: c_int = 0x2C0;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct LadspaPortRangeHint {
    pub hint_descriptor: c_int,
    pub lower_bound: f32,
    pub upper_bound: f32,
}

#[repr(C)]
pub(crate) struct LadspaDescriptor {
    pub unique_id: c_ulong,
    pub label: *const c_char,
    pub properties: c_int,
    pub name: *const c_char,
    pub maker: *const c_char,
    pub copyright: *const c_char,
    pub port_count: c_ulong,
    pub port_descriptors: *const c_int,
    pub port_names: *const *const c_char,
    pub port_range_hints: *const LadspaPortRangeHint,
    pub implementation_data: *mut c_void,
    pub instantiate: Option<unsafe extern "C" fn(*const LadspaDescriptor, c_ulong) -> Handle>,
    pub connect_port: Option<unsafe extern "C" fn(Handle, c_ulong, *mut f32)>,
    pub activate: Option<unsafe extern "C" fn(Handle)>,
    pub run: Option<unsafe extern "C" fn(Handle, c_ulong)>,
    pub run_adding: Option<unsafe extern "C" fn(Handle, c_ulong)>,
    pub set_run_adding_gain: Option<unsafe extern "C" fn(Handle, f32)>,
    pub deactivate: Option<unsafe extern "C" fn(Handle)>,
    pub cleanup: Option<unsafe extern "C" fn(Handle)>,
}

type LadspaDescriptorFn = unsafe extern "C" fn(c_ulong) -> *const LadspaDescriptor;

/// A control port and the slot its value lives in.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ControlPort {
    pub port: c_ulong,
    pub input: bool,
}

/// An instantiated LADSPA descriptor.
///
/// Control values live in a boxed slice whose addresses are handed to the plugin
/// once, so they must never move. Fields drop in declaration order and the
/// library goes last, after `cleanup` ran in [`Drop`].
pub(crate) struct LadspaCore {
    pub path: PathBuf,
    pub descriptor: *const LadspaDescriptor,
    pub handle: Handle,
    pub audio_ins: Vec<c_ulong>,
    pub audio_outs: Vec<c_ulong>,
    pub controls: Vec<ControlPort>,
    pub values: Box<[f32]>,
    pub sample_rate: f64,
    active: bool,
    _library: libloading::Library,
}

// The handle is only touched by the thread owning the instance.
unsafe impl Send for LadspaCore {}

impl LadspaCore {
    pub fn open_library(path: &Path) -> Result<libloading::Library> {
        unsafe { libloading::Library::new(path) }
            .map_err(|e| PluginError::load(path, LoadStage::Opening, format!("Failed to load library: {e}")))
    }

    /// Instantiates `descriptor` and wires every control port.
    ///
    /// # Safety
    /// `descriptor` must come from `library` and stay valid while it is loaded.
    pub unsafe fn instantiate(
        library: libloading::Library,
        path: &Path,
        descriptor: *const LadspaDescriptor,
        sample_rate: f64,
    ) -> Result<Self> {
        let desc = &*descriptor;
        let (Some(instantiate), Some(connect), Some(_run)) = (desc.instantiate, desc.connect_port, desc.run)
        else {
            return Err(PluginError::load(path, LoadStage::Descriptor, "descriptor lacks required entry points"));
        };

        let mut audio_ins = Vec::new();
        let mut audio_outs = Vec::new();
        let mut controls = Vec::new();
        for port in 0..desc.port_count {
            let flags = *desc.port_descriptors.add(port as usize);
            let input = flags & PORT_INPUT != 0;
            if flags & PORT_AUDIO != 0 {
                if input {
                    audio_ins.push(port);
                } else if flags & PORT_OUTPUT != 0 {
                    audio_outs.push(port);
                }
            } else if flags & PORT_CONTROL != 0 {
                controls.push(ControlPort { port, input });
            }
        }

        let handle = instantiate(descriptor, sample_rate as c_ulong);
        if handle.is_null() {
            return Err(PluginError::load(path, LoadStage::Instantiation, "instantiate returned null"));
        }

        let mut core = Self {
            path: path.to_path_buf(),
            descriptor,
            handle,
            audio_ins,
            audio_outs,
            values: vec![0.0; controls.len()].into_boxed_slice(),
            controls,
            sample_rate,
            active: false,
            _library: library,
        };
        for slot in 0..core.controls.len() {
            core.values[slot] = core.control_ranges(slot).def;
            connect(handle, core.controls[slot].port, core.values.as_mut_ptr().add(slot));
        }
        Ok(core)
    }

    pub fn descriptor(&self) -> &LadspaDescriptor {
        unsafe { &*self.descriptor }
    }

    pub fn info(&self) -> PluginInfo {
        let desc = self.descriptor();
        unsafe {
            PluginInfo::new(c_string(desc.label), c_string(desc.name))
                .maker(c_string(desc.maker))
                .copyright(c_string(desc.copyright))
                .unique_id(desc.unique_id as i64)
        }
    }

    fn port_name(&self, port: c_ulong) -> String {
        unsafe { c_string(*self.descriptor().port_names.add(port as usize)) }
    }

    fn range_hint(&self, port: c_ulong) -> LadspaPortRangeHint {
        unsafe { *self.descriptor().port_range_hints.add(port as usize) }
    }

    pub fn control_hints(&self, slot: usize) -> ParameterHints {
        let hint = self.range_hint(self.controls[slot].port).hint_descriptor;
        let mut hints = if self.controls[slot].input {
            ParameterHints::ENABLED | ParameterHints::AUTOMABLE
        } else {
            ParameterHints::ENABLED
        };
        hints.set(ParameterHints::BOOLEAN, hint & HINT_TOGGLED != 0);
        hints.set(ParameterHints::INTEGER, hint & HINT_INTEGER != 0);
        hints.set(ParameterHints::LOGARITHMIC, hint & HINT_LOGARITHMIC != 0);
        hints.set(ParameterHints::USES_SAMPLERATE, hint & HINT_SAMPLE_RATE != 0);
        hints
    }

    pub fn control_ranges(&self, slot: usize) -> ParameterRanges {
        let LadspaPortRangeHint {
            hint_descriptor: hint,
            lower_bound,
            upper_bound,
        } = self.range_hint(self.controls[slot].port);

        let (mut min, mut max) = if hint & HINT_TOGGLED != 0 {
            (0.0, 1.0)
        } else {
            (
                if hint & HINT_BOUNDED_BELOW != 0 { lower_bound } else { 0.0 },
                if hint & HINT_BOUNDED_ABOVE != 0 { upper_bound } else { 1.0 },
            )
        };
        if hint & HINT_SAMPLE_RATE != 0 {
            min *= self.sample_rate as f32;
            max *= self.sample_rate as f32;
        }

        let log = hint & HINT_LOGARITHMIC != 0 && min > 0.0 && max > 0.0;
        let mix = |low: f32| {
            if log {
                (min.ln() * low + max.ln() * (1.0 - low)).exp()
            } else {
                min * low + max * (1.0 - low)
            }
        };
        let def = match hint & HINT_DEFAULT_MASK {
            HINT_DEFAULT_MINIMUM => min,
            HINT_DEFAULT_LOW => mix(0.75),
            HINT_DEFAULT_MIDDLE => mix(0.5),
            HINT_DEFAULT_HIGH => mix(0.25),
            HINT_DEFAULT_MAXIMUM => max,
            HINT_DEFAULT_0 => 0.0,
            HINT_DEFAULT_1 => 1.0,
            HINT_DEFAULT_100 => 100.0,
            HINT_DEFAULT_440 => 440.0,
            _ => min,
        };

        let mut ranges = ParameterRanges::new(def, min, max);
        if hint & HINT_TOGGLED != 0 {
            ranges.step = 1.0;
            ranges.step_small = 1.0;
            ranges.step_large = 1.0;
        } else if hint & HINT_INTEGER != 0 {
            ranges.step = 1.0;
            ranges.step_small = 1.0;
            ranges.step_large = 10.0;
        }
        ranges
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        (0..self.controls.len())
            .map(|slot| {
                let port = self.controls[slot].port as i32;
                let data = if self.controls[slot].input {
                    ParameterData::input(slot as i32, port)
                } else {
                    ParameterData::output(slot as i32, port)
                };
                let mut param = Parameter::new(
                    ParameterData {
                        hints: self.control_hints(slot),
                        ..data
                    },
                    self.control_ranges(slot),
                    ParameterInfo::new(self.port_name(self.controls[slot].port)),
                );
                param.value = self.values[slot];
                param
            })
            .collect()
    }

    pub fn layout(&self) -> PluginLayout {
        PluginLayout {
            audio_ins: PortGroup::sequential(self.audio_ins.len()),
            audio_outs: PortGroup::sequential(self.audio_outs.len()),
            parameters: self.parameters(),
            ..Default::default()
        }
    }

    pub fn activate(&mut self) {
        if let Some(activate) = self.descriptor().activate {
            unsafe { activate(self.handle) };
        }
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        if let Some(deactivate) = self.descriptor().deactivate {
            unsafe { deactivate(self.handle) };
        }
        self.active = false;
    }

    /// Points the audio ports at the current window.
    pub fn connect_audio(&mut self, ctx: &mut RunContext<'_>) -> bool {
        let Some(connect) = self.descriptor().connect_port else {
            return false;
        };
        if ctx.inputs.len() < self.audio_ins.len() || ctx.outputs.len() < self.audio_outs.len() {
            return false;
        }
        unsafe {
            for (k, port) in self.audio_ins.iter().enumerate() {
                connect(self.handle, *port, ctx.inputs[k].as_ptr().add(ctx.offset) as *mut f32);
            }
            for (k, port) in self.audio_outs.iter().enumerate() {
                connect(self.handle, *port, ctx.outputs[k].as_mut_ptr().add(ctx.offset));
            }
        }
        true
    }

    pub fn run(&mut self, mut ctx: RunContext<'_>) {
        let Some(run) = self.descriptor().run else {
            return;
        };
        if self.connect_audio(&mut ctx) {
            unsafe { run(self.handle, ctx.frames as c_ulong) };
        }
    }

    /// Value slot of a control port.
    pub fn control_slot(&self, port: u32) -> Option<usize> {
        self.controls.iter().position(|c| c.port as u32 == port)
    }

    pub fn set_value(&mut self, port: u32, value: f32) {
        if let Some(slot) = self.control_slot(port) {
            self.values[slot] = value;
        }
    }

    pub fn value(&self, port: u32) -> f32 {
        self.control_slot(port).map_or(0.0, |slot| self.values[slot])
    }
}

impl Drop for LadspaCore {
    fn drop(&mut self) {
        if self.active {
            self.deactivate();
        }
        if let Some(cleanup) = self.descriptor().cleanup {
            unsafe { cleanup(self.handle) };
        }
    }
}

pub struct LadspaPlugin {
    core: LadspaCore,
}

impl LadspaPlugin {
    pub fn load(path: &Path, label: &str, sample_rate: f64) -> Result<Self> {
        let library = LadspaCore::open_library(path)?;
        let entry: LadspaDescriptorFn = unsafe {
            *library
                .get::<LadspaDescriptorFn>(b"ladspa_descriptor\0")
                .map_err(|e| PluginError::load(path, LoadStage::Descriptor, format!("No ladspa_descriptor symbol: {e}")))?
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
            if label.is_empty() || unsafe { c_string((*desc).label) } == label {
                break desc;
            }
            index += 1;
        };

        let core = unsafe { LadspaCore::instantiate(library, path, descriptor, sample_rate)? };
        tracing::debug!("loaded LADSPA {} from {}", label, path.display());
        Ok(Self { core })
    }
}

impl PluginBackend for LadspaPlugin {
    fn kind(&self) -> PluginType {
        PluginType::Ladspa
    }

    fn info(&self) -> PluginInfo {
        self.core.info()
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        Ok(self.core.layout())
    }

    fn activate(&mut self) {
        self.core.activate();
    }

    fn deactivate(&mut self) {
        self.core.deactivate();
    }

    fn run(&mut self, ctx: RunContext<'_>) {
        self.core.run(ctx);
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        self.core.set_value(rindex, value);
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.core.value(rindex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let err = LadspaPlugin::load(Path::new("/nonexistent/amp.so"), "amp", 48000.0);
        assert!(matches!(
            err,
            Err(PluginError::LoadFailed {
                stage: LoadStage::Opening,
                ..
            })
        ));
    }

    #[test]
    fn test_non_plugin_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.so");
        std::fs::write(&path, b"\x7fELF nope").unwrap();
        assert!(LadspaPlugin::load(&path, "", 48000.0).is_err());
    }

    #[test]
    fn test_port_flag_values() {
        assert_eq!(PORT_INPUT | PORT_CONTROL, 5);
        assert_eq!(PORT_OUTPUT | PORT_AUDIO, 10);
        assert_eq!(HINT_DEFAULT_440 & HINT_DEFAULT_MASK, HINT_DEFAULT_440);
    }
}
