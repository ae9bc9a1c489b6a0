//! Per-plugin block buffers handed to `PluginInstance::process`.

use crate::midi::{ControlEventVec, MidiEventVec};

/// Audio and event buffers of one plugin for one block.
///
/// The host resizes these under the process lock whenever the plugin reloads, so
/// the audio thread never allocates.
#[derive(Debug, Default)]
pub struct PortBuffers {
    pub audio_in: Vec<Vec<f32>>,
    pub audio_out: Vec<Vec<f32>>,
    pub control_in: ControlEventVec,
    pub midi_in: MidiEventVec,
    pub midi_out: MidiEventVec,
}

impl PortBuffers {
    pub fn new(inputs: usize, outputs: usize, frames: usize) -> Self {
        let mut ports = Self::default();
        ports.resize(inputs, outputs, frames);
        ports
    }

    pub fn resize(&mut self, inputs: usize, outputs: usize, frames: usize) {
        self.audio_in.resize_with(inputs, Vec::new);
        self.audio_out.resize_with(outputs, Vec::new);
        for channel in self.audio_in.iter_mut().chain(self.audio_out.iter_mut()) {
            channel.clear();
            channel.resize(frames, 0.0);
        }
        self.control_in.clear();
        self.midi_in.clear();
        self.midi_out.clear();
    }

    /// Frames every channel can hold.
    pub fn capacity(&self) -> usize {
        self.audio_in
            .iter()
            .chain(self.audio_out.iter())
            .map(Vec::len)
            .min()
            .unwrap_or(usize::MAX)
    }

    pub fn matches(&self, inputs: usize, outputs: usize) -> bool {
        self.audio_in.len() == inputs && self.audio_out.len() == outputs
    }

    pub fn zero_outputs(&mut self, range: std::ops::Range<usize>) {
        for channel in &mut self.audio_out {
            let end = range.end.min(channel.len());
            let start = range.start.min(end);
            channel[start..end].fill(0.0);
        }
    }

    /// Drops the events of the finished block.
    pub fn clear_events(&mut self) {
        self.control_in.clear();
        self.midi_in.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_and_capacity() {
        let mut ports = PortBuffers::new(1, 2, 128);
        assert!(ports.matches(1, 2));
        assert_eq!(ports.capacity(), 128);

        ports.audio_out[1][5] = 1.0;
        ports.resize(2, 2, 64);
        assert!(ports.matches(2, 2));
        assert_eq!(ports.capacity(), 64);
        assert_eq!(ports.audio_out[1][5], 0.0);
    }

    #[test]
    fn test_no_channels_has_unbounded_capacity() {
        let ports = PortBuffers::default();
        assert_eq!(ports.capacity(), usize::MAX);
    }

    #[test]
    fn test_zero_outputs_window() {
        let mut ports = PortBuffers::new(0, 1, 8);
        ports.audio_out[0].fill(1.0);
        ports.zero_outputs(2..4);
        assert_eq!(ports.audio_out[0], vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }
}
