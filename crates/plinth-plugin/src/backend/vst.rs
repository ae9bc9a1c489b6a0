//! VST 2.x plugins through the `vst` crate.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vst::api;
use vst::buffer::AudioBuffer as VstBuffer;
use vst::editor::Editor;
use vst::host::{Host, PluginInstance, PluginLoader};
use vst::plugin::{Category, Plugin, PluginParameters};

use super::{PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::midi::MAX_MIDI_EVENTS;
use crate::options::BridgePaths;
use crate::supervisor::BridgeCommand;
use crate::types::{
    Parameter, ParameterData, ParameterInfo, ParameterRanges, PluginCategory, PluginHints, PluginInfo,
    PluginType, PortGroup,
};

const MAX_CHANNELS: usize = 32;

/// `VstEvents` with room for a full block of MIDI, built once per instance.
#[repr(C)]
struct EventBuffer {
    num_events: i32,
    _reserved: isize,
    events: [*mut api::Event; MAX_MIDI_EVENTS],
}

struct PluginHost {
    automation: crossbeam_channel::Sender<(i32, f32)>,
}

impl Host for PluginHost {
    fn automate(&self, index: i32, value: f32) {
        let _ = self.automation.try_send((index, value));
    }

    fn get_plugin_id(&self) -> i32 {
        0x504C4E54
    }
}

pub struct VstPlugin {
    path: PathBuf,
    info: vst::plugin::Info,
    params: Arc<dyn PluginParameters>,
    editor: Option<Box<dyn Editor>>,
    event_header: Box<EventBuffer>,
    event_storage: Box<[api::MidiEvent]>,
    input_ptrs: Vec<*const f32>,
    output_ptrs: Vec<*mut f32>,
    automation: crossbeam_channel::Receiver<(i32, f32)>,
    instance: PluginInstance,
    _host: Arc<Mutex<PluginHost>>,
}

// The instance is only driven by the thread owning it.
unsafe impl Send for VstPlugin {}

fn empty_midi_event() -> api::MidiEvent {
    api::MidiEvent {
        event_type: api::EventType::Midi,
        byte_size: std::mem::size_of::<api::MidiEvent>() as i32,
        delta_frames: 0,
        flags: api::MidiEventFlags::REALTIME_EVENT.bits(),
        note_length: 0,
        note_offset: 0,
        midi_data: [0; 3],
        _midi_reserved: 0,
        detune: 0,
        note_off_velocity: 0,
        _reserved1: 0,
        _reserved2: 0,
    }
}

impl VstPlugin {
    pub fn load(path: &Path, sample_rate: f64, buffer_size: usize) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(MAX_MIDI_EVENTS);
        let host = Arc::new(Mutex::new(PluginHost { automation: tx }));

        let mut loader = PluginLoader::load(path, Arc::clone(&host))
            .map_err(|e| PluginError::load(path, LoadStage::Opening, format!("Failed to load VST: {e:?}")))?;
        let mut instance = loader
            .instance()
            .map_err(|e| PluginError::load(path, LoadStage::Instantiation, format!("{e:?}")))?;

        instance.init();
        instance.set_sample_rate(sample_rate as f32);
        instance.set_block_size(buffer_size as i64);

        let info = instance.get_info();
        let params = instance.get_parameter_object();
        let editor = instance.get_editor();

        let event_storage = vec![empty_midi_event(); MAX_MIDI_EVENTS].into_boxed_slice();
        let event_header = Box::new(EventBuffer {
            num_events: 0,
            _reserved: 0,
            events: [std::ptr::null_mut(); MAX_MIDI_EVENTS],
        });

        tracing::debug!("loaded VST {} from {}", info.name, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            info,
            params,
            editor,
            event_header,
            event_storage,
            input_ptrs: Vec::with_capacity(MAX_CHANNELS),
            output_ptrs: Vec::with_capacity(MAX_CHANNELS),
            automation: rx,
            instance,
            _host: host,
        })
    }

    fn send_events(&mut self, events: &[crate::midi::MidiEvent]) {
        let mut count = 0;
        for event in events.iter().take(MAX_MIDI_EVENTS) {
            let slot = &mut self.event_storage[count];
            slot.delta_frames = event.frame as i32;
            slot.midi_data = [event.data[0], event.data[1], event.data[2]];
            self.event_header.events[count] = (slot as *mut api::MidiEvent).cast();
            count += 1;
        }
        if count == 0 {
            return;
        }
        self.event_header.num_events = count as i32;
        let events = &*self.event_header as *const EventBuffer as *const api::Events;
        unsafe { self.instance.process_events(&*events) };
    }
}

impl PluginBackend for VstPlugin {
    fn kind(&self) -> PluginType {
        PluginType::Vst
    }

    fn info(&self) -> PluginInfo {
        let category = match self.info.category {
            Category::Synth | Category::Generator => PluginCategory::Synth,
            Category::Effect | Category::RoomFx | Category::SurroundFx => PluginCategory::Delay,
            Category::Mastering => PluginCategory::Dynamics,
            Category::Analysis => PluginCategory::Utility,
            _ => PluginCategory::Other,
        };
        PluginInfo::new(self.path.to_string_lossy(), self.info.name.clone())
            .maker(self.info.vendor.clone())
            .category(category)
            .unique_id(self.info.unique_id as i64)
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        let parameters = (0..self.info.parameters)
            .map(|i| {
                let mut param = Parameter::new(
                    ParameterData::input(i, i),
                    ParameterRanges::new(0.0, 0.0, 1.0),
                    ParameterInfo::new(self.params.get_parameter_name(i)).unit(self.params.get_parameter_label(i)),
                );
                param.value = self.params.get_parameter(i);
                param
            })
            .collect();
        let programs = (0..self.info.presets)
            .map(|i| self.params.get_preset_name(i))
            .collect();

        let mut hints = PluginHints::empty();
        hints.set(PluginHints::HAS_GUI, self.editor.is_some());
        hints.set(PluginHints::IS_SYNTH, matches!(self.info.category, Category::Synth));
        hints.set(PluginHints::USES_CHUNKS, self.info.preset_chunks);

        Ok(PluginLayout {
            audio_ins: PortGroup::sequential(self.info.inputs.max(0) as usize),
            audio_outs: PortGroup::sequential(self.info.outputs.max(0) as usize),
            midi_ins: PortGroup::sequential(self.info.midi_inputs.clamp(0, 1) as usize),
            midi_outs: PortGroup::sequential(self.info.midi_outputs.clamp(0, 1) as usize),
            parameters,
            programs,
            hints,
            ..Default::default()
        })
    }

    fn activate(&mut self) {
        self.instance.resume();
    }

    fn deactivate(&mut self) {
        self.instance.suspend();
    }

    fn run(&mut self, ctx: RunContext<'_>) {
        let (ins, outs) = (self.info.inputs.max(0) as usize, self.info.outputs.max(0) as usize);
        if ctx.inputs.len() < ins || ctx.outputs.len() < outs || ins > MAX_CHANNELS || outs > MAX_CHANNELS {
            return;
        }
        self.send_events(ctx.events);

        self.input_ptrs.clear();
        self.output_ptrs.clear();
        for input in &ctx.inputs[..ins] {
            self.input_ptrs.push(unsafe { input.as_ptr().add(ctx.offset) });
        }
        for output in ctx.outputs[..outs].iter_mut() {
            self.output_ptrs.push(unsafe { output.as_mut_ptr().add(ctx.offset) });
        }
        let mut buffer = unsafe {
            VstBuffer::from_raw(
                ins,
                outs,
                self.input_ptrs.as_ptr(),
                self.output_ptrs.as_mut_ptr(),
                ctx.frames,
            )
        };
        self.instance.process(&mut buffer);
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        self.params.set_parameter(rindex as i32, value);
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.params.get_parameter(rindex as i32)
    }

    fn select_program(&mut self, index: usize) {
        self.params.change_preset(index as i32);
    }

    fn chunk(&mut self) -> Result<Vec<u8>> {
        if !self.info.preset_chunks {
            return Err(PluginError::Unsupported("plugin does not use chunks".into()));
        }
        Ok(self.params.get_preset_data())
    }

    fn set_chunk(&mut self, data: &[u8]) -> Result<()> {
        if !self.info.preset_chunks {
            return Err(PluginError::Unsupported("plugin does not use chunks".into()));
        }
        self.params.load_preset_data(data);
        Ok(())
    }

    fn ui_bridge(&self, _paths: &BridgePaths, url: &str, title: &str) -> Option<BridgeCommand> {
        self.editor.as_ref()?;
        Some(BridgeCommand::VstUi {
            url: url.to_string(),
            binary: self.path.clone(),
            ui_title: title.to_string(),
        })
    }

    fn idle(&mut self) {
        if let Some(editor) = self.editor.as_mut() {
            editor.idle();
        }
    }

    fn take_automation(&mut self, out: &mut Vec<(u32, f32)>) {
        out.extend(
            self.automation
                .try_iter()
                .filter(|(index, _)| *index >= 0)
                .map(|(index, value)| (index as u32, value)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_header_matches_vst_layout() {
        assert_eq!(
            std::mem::offset_of!(EventBuffer, events),
            std::mem::offset_of!(api::Events, events)
        );
    }

    #[test]
    fn test_missing_binary() {
        let err = VstPlugin::load(Path::new("/nonexistent/synth.so"), 48000.0, 512);
        assert!(matches!(
            err,
            Err(PluginError::LoadFailed {
                stage: LoadStage::Opening,
                ..
            })
        ));
    }
}
