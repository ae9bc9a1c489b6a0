//! SoundFont (.sf2) banks rendered with rustysynth.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};

use super::{PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::midi::{STATUS_CONTROL_CHANGE, STATUS_NOTE_OFF, STATUS_NOTE_ON, STATUS_PITCH_BEND};
use crate::types::{
    MidiProgramData, Parameter, ParameterData, ParameterInfo, ParameterRanges, PluginCategory,
    PluginHints, PluginInfo, PluginType, PortGroup,
};

const PERCUSSION_CHANNEL: i32 = 9;

pub struct SoundFontPlugin {
    path: PathBuf,
    name: String,
    synth: Synthesizer,
    presets: Vec<MidiProgramData>,
    volume: f32,
}

impl SoundFontPlugin {
    pub fn load(path: &Path, sample_rate: f64) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| PluginError::load(path, LoadStage::Opening, e.to_string()))?;
        let soundfont = Arc::new(
            SoundFont::new(&mut file)
                .map_err(|e| PluginError::load(path, LoadStage::Descriptor, format!("{e:?}")))?,
        );

        let settings = SynthesizerSettings::new(sample_rate as i32);
        let synth = Synthesizer::new(&soundfont, &settings)
            .map_err(|e| PluginError::load(path, LoadStage::Instantiation, format!("{e:?}")))?;

        let mut presets: Vec<MidiProgramData> = soundfont
            .get_presets()
            .iter()
            .map(|p| {
                MidiProgramData::new(
                    p.get_bank_number().max(0) as u32,
                    p.get_patch_number().max(0) as u32,
                    p.get_name(),
                )
            })
            .collect();
        presets.sort_by_key(|p| (p.bank, p.program));

        let name = soundfont.get_info().get_bank_name().to_string();
        let name = if name.is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "SoundFont".into())
        } else {
            name
        };

        tracing::debug!("loaded {} with {} presets", path.display(), presets.len());
        Ok(Self {
            path: path.to_path_buf(),
            name,
            volume: synth.get_master_volume(),
            synth,
            presets,
        })
    }

    fn handle_event(&mut self, data: &[u8]) {
        let channel = (data[0] & 0x0F) as i32;
        let command = (data[0] & 0xF0) as i32;
        let (d1, d2) = (data[1] as i32, data[2] as i32);
        match data[0] & 0xF0 {
            STATUS_NOTE_ON | STATUS_NOTE_OFF | STATUS_CONTROL_CHANGE | STATUS_PITCH_BEND => {
                self.synth.process_midi_message(channel, command, d1, d2)
            }
            _ => {}
        }
    }
}

impl PluginBackend for SoundFontPlugin {
    fn kind(&self) -> PluginType {
        PluginType::Sf2
    }

    fn info(&self) -> PluginInfo {
        PluginInfo::new(self.path.to_string_lossy(), self.name.clone()).category(PluginCategory::Synth)
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        let mut volume = Parameter::new(
            ParameterData::input(0, 0),
            ParameterRanges::new(0.5, 0.0, 1.0),
            ParameterInfo::new("Master Volume"),
        );
        volume.value = self.volume;
        Ok(PluginLayout {
            audio_outs: PortGroup::sequential(2),
            midi_ins: PortGroup::sequential(1),
            parameters: vec![volume],
            midi_programs: self.presets.clone(),
            hints: PluginHints::IS_SYNTH,
            ..Default::default()
        })
    }

    fn activate(&mut self) {}

    fn deactivate(&mut self) {
        self.synth.note_off_all(true);
    }

    fn run(&mut self, ctx: RunContext<'_>) {
        let RunContext {
            outputs,
            offset,
            frames,
            events,
            ..
        } = ctx;
        let [left, right, ..] = outputs else {
            return;
        };

        let mut pos = 0usize;
        for event in events {
            let at = (event.frame as usize).min(frames);
            if at > pos {
                self.synth
                    .render(&mut left[offset + pos..offset + at], &mut right[offset + pos..offset + at]);
                pos = at;
            }
            self.handle_event(&event.data);
        }
        if frames > pos {
            self.synth.render(
                &mut left[offset + pos..offset + frames],
                &mut right[offset + pos..offset + frames],
            );
        }
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        if rindex == 0 {
            self.volume = value;
            self.synth.set_master_volume(value);
        }
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        if rindex == 0 {
            self.volume
        } else {
            0.0
        }
    }

    /// Applies the preset to every melodic channel.
    fn select_midi_program(&mut self, bank: u32, program: u32) {
        for channel in (0..16).filter(|c| *c != PERCUSSION_CHANNEL) {
            self.synth
                .process_midi_message(channel, STATUS_CONTROL_CHANGE as i32, 0x00, bank as i32);
            self.synth.process_midi_message(channel, 0xC0, program as i32, 0);
        }
    }
}
