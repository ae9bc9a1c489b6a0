//! Fixtures for plinth integration tests.
//!
//! Engines here never start the idle thread: tests drive `idle()` by hand so
//! callbacks arrive at known points.

pub mod tolerances;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use plinth::plugin::{ControlEvent, MidiEvent};
use plinth::prelude::*;

pub const TEST_SAMPLE_RATE: f64 = 48000.0;
pub const TEST_BUFFER_SIZE: usize = 512;

pub fn test_engine() -> PlinthEngine {
    PlinthEngine::builder()
        .sample_rate(TEST_SAMPLE_RATE)
        .buffer_size(TEST_BUFFER_SIZE)
        .idle_thread(false)
        .build()
        .expect("Failed to create test engine")
}

/// One recorded host callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Recorded {
    pub kind: CallbackKind,
    pub id: PluginId,
    pub value1: i32,
    pub value3: f64,
}

pub type CallbackLog = Arc<Mutex<Vec<Recorded>>>;

/// A test engine whose callbacks land in the returned log.
pub fn recording_engine() -> (PlinthEngine, CallbackLog) {
    let log: CallbackLog = Arc::default();
    let sink = Arc::clone(&log);
    let engine = PlinthEngine::builder()
        .sample_rate(TEST_SAMPLE_RATE)
        .buffer_size(TEST_BUFFER_SIZE)
        .idle_thread(false)
        .callback(move |kind, id, value1, _, value3| {
            sink.lock().unwrap().push(Recorded { kind, id, value1, value3 });
        })
        .build()
        .expect("Failed to create test engine");
    (engine, log)
}

pub fn recorded_kinds(log: &CallbackLog, id: PluginId) -> Vec<CallbackKind> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|r| r.id == id)
        .map(|r| r.kind)
        .collect()
}

/// Mock audio I/O: constant input level, queued events, captured outputs.
#[derive(Default)]
pub struct TestIo {
    pub input_level: f32,
    pub controls: Vec<ControlEvent>,
    pub notes: Vec<MidiEvent>,
    pub outputs: HashMap<PluginId, Vec<Vec<f32>>>,
}

impl TestIo {
    pub fn with_input(level: f32) -> Self {
        Self {
            input_level: level,
            ..Self::default()
        }
    }

    /// Output channel of a plugin from the last block it rendered.
    pub fn output(&self, id: PluginId, channel: usize) -> &[f32] {
        self.outputs
            .get(&id)
            .and_then(|channels| channels.get(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl BlockIo for TestIo {
    fn read(&mut self, _id: PluginId, ports: &mut PortBuffers, offset: usize, frames: usize) {
        for channel in &mut ports.audio_in {
            channel[offset..offset + frames].fill(self.input_level);
        }
        ports.control_in.extend(self.controls.drain(..));
        ports.midi_in.extend(self.notes.drain(..));
    }

    fn write(&mut self, id: PluginId, ports: &PortBuffers, offset: usize, frames: usize) {
        let channels = ports
            .audio_out
            .iter()
            .map(|channel| channel[offset..offset + frames].to_vec())
            .collect();
        self.outputs.insert(id, channels);
    }
}

/// Absolute peak of a block.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}
