//! Format backends behind one trait.
//!
//! A backend knows how to talk to one kind of native plugin. Everything shared by
//! all formats (clamping, notifications, post-processing, program policy) lives in
//! [`PluginInstance`](crate::instance::PluginInstance); the backend only exposes
//! its layout and the native entry points.

use std::path::PathBuf;

use crate::error::{PluginError, Result};
use crate::midi::{MidiEvent, MidiEventVec};
use crate::options::{BridgePaths, HostOptions};
use crate::supervisor::BridgeCommand;
use crate::types::{CustomData, MidiProgramData, Parameter, PluginHints, PluginInfo, PluginType, PortGroup};

pub mod bridge;
pub mod dssi;
pub mod internal;
pub mod ladspa;
#[cfg(feature = "lv2")]
pub mod lv2;
pub mod soundfont;
#[cfg(feature = "vst")]
pub mod vst;

pub use bridge::{BridgeBackend, BridgeEvent, BridgeMirror};
pub use dssi::DssiPlugin;
pub use internal::InternalPlugin;
pub use ladspa::LadspaPlugin;
#[cfg(feature = "lv2")]
pub use lv2::Lv2Plugin;
pub use soundfont::SoundFontPlugin;
#[cfg(feature = "vst")]
pub use vst::VstPlugin;

/// What a plugin looks like right now, as queried on every reload.
#[derive(Clone, Debug, Default)]
pub struct PluginLayout {
    pub audio_ins: PortGroup,
    pub audio_outs: PortGroup,
    pub midi_ins: PortGroup,
    pub midi_outs: PortGroup,
    /// Current values are carried in `Parameter::value`.
    pub parameters: Vec<Parameter>,
    pub programs: Vec<String>,
    pub midi_programs: Vec<MidiProgramData>,
    /// Backend-owned hints: `HAS_GUI`, `IS_SYNTH`, `USES_CHUNKS`.
    pub hints: PluginHints,
}

/// Buffers for one native run call. Audio channels are in logical order and
/// `offset..offset + frames` is the window to render. Event frames are relative
/// to `offset`.
pub struct RunContext<'a> {
    pub inputs: &'a [Vec<f32>],
    pub outputs: &'a mut [Vec<f32>],
    pub offset: usize,
    pub frames: usize,
    pub events: &'a [MidiEvent],
    pub midi_out: &'a mut MidiEventVec,
}

impl RunContext<'_> {
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.frames
    }
}

pub trait PluginBackend: Send {
    fn kind(&self) -> PluginType;

    fn info(&self) -> PluginInfo;

    fn layout(&mut self) -> Result<PluginLayout>;

    fn activate(&mut self);

    fn deactivate(&mut self);

    /// Real-time entry point. Must not allocate or block.
    fn run(&mut self, ctx: RunContext<'_>);

    fn set_parameter(&mut self, rindex: u32, value: f32);

    fn parameter_value(&self, rindex: u32) -> f32;

    fn select_program(&mut self, _index: usize) {}

    /// `(program, midi program)` indexes a backend selects on its own, adopted
    /// on reload instead of resyncing. `-1` means none.
    fn selected_programs(&self) -> Option<(i32, i32)> {
        None
    }

    fn select_midi_program(&mut self, _bank: u32, _program: u32) {}

    fn set_custom_data(&mut self, _data: &CustomData) -> Result<()> {
        Ok(())
    }

    fn chunk(&mut self) -> Result<Vec<u8>> {
        Err(PluginError::Unsupported(format!("{} plugins have no chunks", self.kind())))
    }

    fn set_chunk(&mut self, _data: &[u8]) -> Result<()> {
        Err(PluginError::Unsupported(format!("{} plugins have no chunks", self.kind())))
    }

    /// In-process editor.
    fn show_gui(&mut self, _show: bool) -> Result<()> {
        Err(PluginError::Unsupported("no in-process editor".into()))
    }

    /// Out-of-process GUI, when the plugin has one.
    fn ui_bridge(&self, _paths: &BridgePaths, _url: &str, _title: &str) -> Option<BridgeCommand> {
        None
    }

    /// Non-real-time housekeeping, called from the idle tick.
    fn idle(&mut self) {}

    /// Parameter edits the plugin made on its own, as `(rindex, value)`.
    fn take_automation(&mut self, _out: &mut Vec<(u32, f32)>) {}
}

/// What to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub kind: PluginType,
    pub filename: PathBuf,
    /// Plugin label inside the binary, LV2 URI, or built-in name.
    pub label: String,
    pub name: Option<String>,
    /// Run the plugin in a `plinth-bridge-plugin` child process.
    pub bridged: bool,
}

impl LoadRequest {
    pub fn new(kind: PluginType, filename: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            kind,
            filename: filename.into(),
            label: label.into(),
            name: None,
            bridged: false,
        }
    }

    pub fn internal(label: impl Into<String>) -> Self {
        Self::new(PluginType::Internal, PathBuf::new(), label)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bridged(mut self, bridged: bool) -> Self {
        self.bridged = bridged;
        self
    }
}

/// Closed set of backends a [`PluginInstance`](crate::instance::PluginInstance) can own.
pub enum LoadedBackend {
    Ladspa(LadspaPlugin),
    Dssi(DssiPlugin),
    #[cfg(feature = "lv2")]
    Lv2(Lv2Plugin),
    #[cfg(feature = "vst")]
    Vst(VstPlugin),
    Sf2(SoundFontPlugin),
    Internal(InternalPlugin),
    Bridge(BridgeBackend),
}

impl LoadedBackend {
    /// Loads an in-process backend. Bridged requests go through
    /// [`BridgeBackend::spawn`] instead.
    pub fn load(request: &LoadRequest, options: &HostOptions) -> Result<Self> {
        let sample_rate = options.sample_rate;
        match request.kind {
            PluginType::Ladspa => Ok(LoadedBackend::Ladspa(LadspaPlugin::load(
                &request.filename,
                &request.label,
                sample_rate,
            )?)),
            PluginType::Dssi => Ok(LoadedBackend::Dssi(DssiPlugin::load(
                &request.filename,
                &request.label,
                sample_rate,
            )?)),
            #[cfg(feature = "lv2")]
            PluginType::Lv2 => Ok(LoadedBackend::Lv2(Lv2Plugin::load(
                &request.label,
                sample_rate,
                options.buffer_size,
            )?)),
            #[cfg(feature = "vst")]
            PluginType::Vst => Ok(LoadedBackend::Vst(VstPlugin::load(
                &request.filename,
                sample_rate,
                options.buffer_size,
            )?)),
            PluginType::Sf2 => Ok(LoadedBackend::Sf2(SoundFontPlugin::load(
                &request.filename,
                sample_rate,
            )?)),
            PluginType::Internal => Ok(LoadedBackend::Internal(InternalPlugin::new(
                &request.label,
                sample_rate,
            )?)),
            #[allow(unreachable_patterns)]
            other => Err(PluginError::load(
                &request.filename,
                crate::error::LoadStage::Opening,
                format!("{other} support not compiled in"),
            )),
        }
    }

    pub fn as_backend(&self) -> &dyn PluginBackend {
        match self {
            LoadedBackend::Ladspa(p) => p,
            LoadedBackend::Dssi(p) => p,
            #[cfg(feature = "lv2")]
            LoadedBackend::Lv2(p) => p,
            #[cfg(feature = "vst")]
            LoadedBackend::Vst(p) => p,
            LoadedBackend::Sf2(p) => p,
            LoadedBackend::Internal(p) => p,
            LoadedBackend::Bridge(p) => p,
        }
    }

    pub fn as_backend_mut(&mut self) -> &mut dyn PluginBackend {
        match self {
            LoadedBackend::Ladspa(p) => p,
            LoadedBackend::Dssi(p) => p,
            #[cfg(feature = "lv2")]
            LoadedBackend::Lv2(p) => p,
            #[cfg(feature = "vst")]
            LoadedBackend::Vst(p) => p,
            LoadedBackend::Sf2(p) => p,
            LoadedBackend::Internal(p) => p,
            LoadedBackend::Bridge(p) => p,
        }
    }

    pub fn as_bridge_mut(&mut self) -> Option<&mut BridgeBackend> {
        match self {
            LoadedBackend::Bridge(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_internal(&self) -> Option<&InternalPlugin> {
        match self {
            LoadedBackend::Internal(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self, LoadedBackend::Bridge(_))
    }
}

/// Reads a NUL-terminated C string owned by a plugin binary.
///
/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
pub(crate) unsafe fn c_string(ptr: *const std::os::raw::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
