//! Built-in plugins that need no native binary.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{PluginBackend, PluginLayout, RunContext};
use crate::error::{LoadStage, PluginError, Result};
use crate::midi::{STATUS_NOTE_OFF, STATUS_NOTE_ON};
use crate::types::{
    Parameter, ParameterData, ParameterHints, ParameterInfo, ParameterRanges, PluginCategory,
    PluginHints, PluginInfo, PluginType, PortGroup,
};

pub const INTERNAL_LABELS: &[&str] = &["passthrough", "gain", "sine"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Passthrough,
    Gain,
    Sine,
}

/// Sine program levels, by program index.
const SINE_PROGRAMS: [(&str, f32); 2] = [("Soft", 0.25), ("Loud", 0.75)];

/// Activation and deactivation counters, shared so tests can observe edges.
#[derive(Debug, Default)]
pub struct ActivationCounters {
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
}

pub struct InternalPlugin {
    kind: Kind,
    sample_rate: f32,
    values: Vec<f32>,
    counters: Arc<ActivationCounters>,
    note: Option<u8>,
    phase: f32,
}

impl InternalPlugin {
    pub fn new(label: &str, sample_rate: f64) -> Result<Self> {
        let kind = match label {
            "passthrough" => Kind::Passthrough,
            "gain" => Kind::Gain,
            "sine" => Kind::Sine,
            other => {
                return Err(PluginError::load(
                    "internal",
                    LoadStage::Descriptor,
                    format!("no built-in plugin '{other}'"),
                ))
            }
        };
        let values = match kind {
            Kind::Passthrough => vec![],
            Kind::Gain => vec![1.0, 0.0],
            Kind::Sine => vec![0.5],
        };
        Ok(Self {
            kind,
            sample_rate: sample_rate as f32,
            values,
            counters: Arc::new(ActivationCounters::default()),
            note: None,
            phase: 0.0,
        })
    }

    pub fn counters(&self) -> Arc<ActivationCounters> {
        Arc::clone(&self.counters)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = match self.kind {
            Kind::Passthrough => vec![],
            Kind::Gain => {
                let mut invert = Parameter::new(
                    ParameterData::input(1, 1),
                    ParameterRanges::new(0.0, 0.0, 1.0),
                    ParameterInfo::new("Invert"),
                );
                invert.data.hints.insert(ParameterHints::BOOLEAN);
                vec![
                    Parameter::new(
                        ParameterData::input(0, 0),
                        ParameterRanges::new(1.0, 0.0, 2.0),
                        ParameterInfo::new("Gain"),
                    ),
                    invert,
                ]
            }
            Kind::Sine => vec![Parameter::new(
                ParameterData::input(0, 0),
                ParameterRanges::new(0.5, 0.0, 1.0),
                ParameterInfo::new("Level"),
            )],
        };
        for (param, value) in params.iter_mut().zip(&self.values) {
            param.value = *value;
        }
        params
    }

    fn render_sine(&mut self, ctx: &mut RunContext<'_>) {
        let range = ctx.range();
        for out in ctx.outputs.iter_mut() {
            out[range.clone()].fill(0.0);
        }

        let level = self.values[0];
        let mut pos = 0usize;
        for event in ctx.events.iter() {
            let at = (event.frame as usize).min(ctx.frames);
            self.write_sine(ctx, pos, at, level);
            pos = at;
            match event.status() {
                STATUS_NOTE_ON if event.data[2] > 0 => self.note = Some(event.data[1]),
                STATUS_NOTE_ON | STATUS_NOTE_OFF if self.note == Some(event.data[1]) => {
                    self.note = None
                }
                _ => {}
            }
        }
        self.write_sine(ctx, pos, ctx.frames, level);
    }

    fn write_sine(&mut self, ctx: &mut RunContext<'_>, from: usize, to: usize, level: f32) {
        let Some(note) = self.note else {
            return;
        };
        let freq = 440.0 * 2f32.powf((note as f32 - 69.0) / 12.0);
        let step = freq / self.sample_rate;
        let mut phase = self.phase;
        for k in from..to {
            let sample = (phase * TAU).sin() * level;
            for out in ctx.outputs.iter_mut() {
                out[ctx.offset + k] = sample;
            }
            phase = (phase + step).fract();
        }
        self.phase = phase;
    }
}

impl PluginBackend for InternalPlugin {
    fn kind(&self) -> PluginType {
        PluginType::Internal
    }

    fn info(&self) -> PluginInfo {
        let (label, name, category) = match self.kind {
            Kind::Passthrough => ("passthrough", "Passthrough", PluginCategory::Utility),
            Kind::Gain => ("gain", "Gain", PluginCategory::Utility),
            Kind::Sine => ("sine", "Sine", PluginCategory::Synth),
        };
        PluginInfo::new(label, name)
            .maker("plinth")
            .category(category)
            .unique_id(self.kind as i64 + 1)
    }

    fn layout(&mut self) -> Result<PluginLayout> {
        let mut layout = PluginLayout {
            parameters: self.parameters(),
            ..Default::default()
        };
        match self.kind {
            Kind::Passthrough | Kind::Gain => {
                layout.audio_ins = PortGroup::sequential(2);
                layout.audio_outs = PortGroup::sequential(2);
            }
            Kind::Sine => {
                layout.audio_outs = PortGroup::sequential(2);
                layout.midi_ins = PortGroup::sequential(1);
                layout.programs = SINE_PROGRAMS.iter().map(|(n, _)| n.to_string()).collect();
                layout.hints = PluginHints::IS_SYNTH;
            }
        }
        if !layout.parameters.is_empty() {
            layout.hints.insert(PluginHints::USES_CHUNKS);
        }
        Ok(layout)
    }

    fn activate(&mut self) {
        self.counters.activations.fetch_add(1, Ordering::Relaxed);
    }

    fn deactivate(&mut self) {
        self.note = None;
        self.counters.deactivations.fetch_add(1, Ordering::Relaxed);
    }

    fn run(&mut self, mut ctx: RunContext<'_>) {
        let range = ctx.range();
        match self.kind {
            Kind::Passthrough | Kind::Gain => {
                let gain = match self.kind {
                    Kind::Gain if self.values[1] >= 0.5 => -self.values[0],
                    Kind::Gain => self.values[0],
                    _ => 1.0,
                };
                for (out, input) in ctx.outputs.iter_mut().zip(ctx.inputs.iter()) {
                    for k in range.clone() {
                        out[k] = input[k] * gain;
                    }
                }
            }
            Kind::Sine => self.render_sine(&mut ctx),
        }
    }

    fn set_parameter(&mut self, rindex: u32, value: f32) {
        if let Some(slot) = self.values.get_mut(rindex as usize) {
            *slot = value;
        }
    }

    fn parameter_value(&self, rindex: u32) -> f32 {
        self.values.get(rindex as usize).copied().unwrap_or(0.0)
    }

    fn select_program(&mut self, index: usize) {
        if self.kind == Kind::Sine {
            if let Some((_, level)) = SINE_PROGRAMS.get(index) {
                self.values[0] = *level;
            }
        }
    }

    fn chunk(&mut self) -> Result<Vec<u8>> {
        Ok(self.values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    fn set_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.values.len() * 4 {
            return Err(PluginError::Protocol(format!(
                "chunk of {} bytes does not match {} parameters",
                data.len(),
                self.values.len()
            )));
        }
        for (value, bytes) in self.values.iter_mut().zip(data.chunks_exact(4)) {
            *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{MidiEvent, MidiEventVec};

    fn run(plugin: &mut InternalPlugin, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], events: &[MidiEvent]) {
        let frames = outputs[0].len();
        let mut midi_out = MidiEventVec::new();
        plugin.run(RunContext {
            inputs,
            outputs,
            offset: 0,
            frames,
            events,
            midi_out: &mut midi_out,
        });
    }

    #[test]
    fn test_unknown_label() {
        assert!(InternalPlugin::new("reverb", 48000.0).is_err());
    }

    #[test]
    fn test_gain_and_invert() {
        let mut plugin = InternalPlugin::new("gain", 48000.0).unwrap();
        let inputs = vec![vec![0.5f32; 8], vec![-0.25f32; 8]];
        let mut outputs = vec![vec![0.0f32; 8]; 2];

        plugin.set_parameter(0, 2.0);
        run(&mut plugin, &inputs, &mut outputs, &[]);
        assert_eq!(outputs[0][0], 1.0);
        assert_eq!(outputs[1][7], -0.5);

        plugin.set_parameter(1, 1.0);
        run(&mut plugin, &inputs, &mut outputs, &[]);
        assert_eq!(outputs[0][0], -1.0);
    }

    #[test]
    fn test_sine_sounds_only_while_held() {
        let mut plugin = InternalPlugin::new("sine", 48000.0).unwrap();
        let mut outputs = vec![vec![0.0f32; 64]; 2];

        run(&mut plugin, &[], &mut outputs, &[]);
        assert!(outputs[0].iter().all(|s| *s == 0.0));

        run(&mut plugin, &[], &mut outputs, &[MidiEvent::note_on(16, 0, 69, 100)]);
        assert!(outputs[0][..16].iter().all(|s| *s == 0.0));
        assert!(outputs[0][16..].iter().any(|s| s.abs() > 0.1));

        run(&mut plugin, &[], &mut outputs, &[MidiEvent::note_off(0, 0, 69, 0)]);
        assert!(outputs[0].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_sine_programs_set_level() {
        let mut plugin = InternalPlugin::new("sine", 48000.0).unwrap();
        let layout = plugin.layout().unwrap();
        assert_eq!(layout.programs, vec!["Soft", "Loud"]);
        assert!(layout.hints.contains(PluginHints::IS_SYNTH));

        plugin.select_program(1);
        assert_eq!(plugin.parameter_value(0), 0.75);
    }

    #[test]
    fn test_chunk_restores_values() {
        let mut plugin = InternalPlugin::new("gain", 48000.0).unwrap();
        plugin.set_parameter(0, 1.5);
        let chunk = plugin.chunk().unwrap();

        plugin.set_parameter(0, 0.1);
        plugin.set_chunk(&chunk).unwrap();
        assert_eq!(plugin.parameter_value(0), 1.5);
        assert!(plugin.set_chunk(&[1, 2, 3]).is_err());
    }
}
