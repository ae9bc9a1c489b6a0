//! Process-wide peak meters, two channels per plugin.

use atomic_float::AtomicF32;
use std::sync::atomic::Ordering;

use crate::types::PluginId;

pub struct PeakMeters {
    inputs: Box<[AtomicF32]>,
    outputs: Box<[AtomicF32]>,
}

impl PeakMeters {
    pub fn new(max_plugins: usize) -> Self {
        let make = || (0..max_plugins * 2).map(|_| AtomicF32::new(0.0)).collect();
        Self {
            inputs: make(),
            outputs: make(),
        }
    }

    #[inline]
    fn slot(id: PluginId, channel: usize) -> usize {
        id.index() * 2 + channel
    }

    #[inline]
    pub fn set_input(&self, id: PluginId, peaks: [f32; 2]) {
        Self::store(&self.inputs, id, peaks);
    }

    #[inline]
    pub fn set_output(&self, id: PluginId, peaks: [f32; 2]) {
        Self::store(&self.outputs, id, peaks);
    }

    /// Channel 0 or 1; anything else reads as silence.
    pub fn input(&self, id: PluginId, channel: usize) -> f32 {
        Self::load(&self.inputs, id, channel)
    }

    pub fn output(&self, id: PluginId, channel: usize) -> f32 {
        Self::load(&self.outputs, id, channel)
    }

    pub fn reset(&self, id: PluginId) {
        self.set_input(id, [0.0; 2]);
        self.set_output(id, [0.0; 2]);
    }

    fn store(table: &[AtomicF32], id: PluginId, peaks: [f32; 2]) {
        for (channel, peak) in peaks.iter().enumerate() {
            if let Some(cell) = table.get(Self::slot(id, channel)) {
                cell.store(*peak, Ordering::Relaxed);
            }
        }
    }

    fn load(table: &[AtomicF32], id: PluginId, channel: usize) -> f32 {
        if channel > 1 {
            return 0.0;
        }
        table
            .get(Self::slot(id, channel))
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0.0)
    }
}

/// Largest absolute sample of the first two channels within `range`.
pub fn measure<B: AsRef<[f32]>>(channels: &[B], range: std::ops::Range<usize>) -> [f32; 2] {
    let mut peaks = [0.0f32; 2];
    for (peak, channel) in peaks.iter_mut().zip(channels.iter()) {
        let samples = channel.as_ref();
        let end = range.end.min(samples.len());
        let start = range.start.min(end);
        *peak = samples[start..end]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_measures_zero() {
        let channels = vec![vec![0.0f32; 64], vec![0.0f32; 64]];
        assert_eq!(measure(&channels, 0..64), [0.0, 0.0]);
    }

    #[test]
    fn test_single_sample_peak() {
        let mut left = vec![0.1f32; 64];
        left[17] = -0.8;
        let right = vec![0.25f32; 64];
        let peaks = measure(&[left, right], 0..64);
        assert_eq!(peaks, [0.8, 0.25]);
    }

    #[test]
    fn test_only_first_two_channels() {
        let channels = vec![vec![0.1f32; 8], vec![0.2f32; 8], vec![0.9f32; 8]];
        assert_eq!(measure(&channels, 0..8), [0.1, 0.2]);
    }

    #[test]
    fn test_mono_leaves_second_channel_silent() {
        let channels = vec![vec![0.5f32; 8]];
        assert_eq!(measure(&channels, 2..6), [0.5, 0.0]);
    }

    #[test]
    fn test_meter_slots_by_id() {
        let meters = PeakMeters::new(3);
        meters.set_input(PluginId(2), [0.3, 0.4]);
        meters.set_output(PluginId(1), [0.7, 0.0]);

        assert_eq!(meters.input(PluginId(2), 0), 0.3);
        assert_eq!(meters.input(PluginId(2), 1), 0.4);
        assert_eq!(meters.output(PluginId(1), 0), 0.7);
        assert_eq!(meters.input(PluginId(0), 0), 0.0);
        assert_eq!(meters.input(PluginId(2), 2), 0.0);

        // Out of range ids are ignored.
        meters.set_input(PluginId(40), [1.0, 1.0]);
        assert_eq!(meters.input(PluginId(40), 0), 0.0);

        meters.reset(PluginId(2));
        assert_eq!(meters.input(PluginId(2), 1), 0.0);
    }
}
