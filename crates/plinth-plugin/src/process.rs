//! Sample-level helpers of the real-time path: automation mapping and the
//! dry/wet, balance and volume post-processing.

use std::ops::Range;

use crate::types::{Parameter, ParameterHints};

/// Dry/wet, balance and volume as read from the internal parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostProcess {
    pub dry_wet: f32,
    pub volume: f32,
    pub balance_left: f32,
    pub balance_right: f32,
}

impl Default for PostProcess {
    fn default() -> Self {
        Self {
            dry_wet: 1.0,
            volume: 1.0,
            balance_left: -1.0,
            balance_right: 1.0,
        }
    }
}

impl PostProcess {
    pub fn has_dry_wet(&self) -> bool {
        self.dry_wet != 1.0
    }

    pub fn has_volume(&self) -> bool {
        self.volume != 1.0
    }

    pub fn has_balance(&self) -> bool {
        self.balance_left != -1.0 || self.balance_right != 1.0
    }
}

/// Linear crossfade of each output against its dry input.
///
/// Output `i` mixes with input `i`, or with input 0 when the plugin has a single
/// input or output.
pub fn apply_dry_wet(inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], range: Range<usize>, wet: f32) {
    if inputs.is_empty() {
        return;
    }
    let mono = inputs.len() == 1 || outputs.len() == 1;
    let dry = 1.0 - wet;
    for (i, out) in outputs.iter_mut().enumerate() {
        let src = if mono || i >= inputs.len() { 0 } else { i };
        let input = &inputs[src];
        for k in range.clone() {
            out[k] = input[k] * dry + out[k] * wet;
        }
    }
}

/// Pairwise stereo balance on (even, odd) output channels.
pub fn apply_balance(outputs: &mut [Vec<f32>], range: Range<usize>, left: f32, right: f32) {
    let range_l = (left + 1.0) / 2.0;
    let range_r = (right + 1.0) / 2.0;
    for pair in outputs.chunks_exact_mut(2) {
        let (l, r) = pair.split_at_mut(1);
        let (l, r) = (&mut l[0], &mut r[0]);
        for k in range.clone() {
            let old_l = l[k];
            let old_r = r[k];
            l[k] = old_l * (1.0 - range_l) + old_r * (1.0 - range_r);
            r[k] = old_r * range_r + old_l * range_l;
        }
    }
}

pub fn apply_volume(outputs: &mut [Vec<f32>], range: Range<usize>, volume: f32) {
    for out in outputs.iter_mut() {
        for sample in &mut out[range.clone()] {
            *sample *= volume;
        }
    }
}

/// Scales a normalized controller value into a parameter's range, honoring
/// integer and boolean hints.
pub fn automation_value(param: &Parameter, normalized: f32) -> f32 {
    let ranges = &param.ranges;
    let hints = param.data.hints;
    if hints.contains(ParameterHints::BOOLEAN) {
        return if normalized < 0.5 { ranges.min } else { ranges.max };
    }
    let value = ranges.unnormalize(normalized);
    if hints.contains(ParameterHints::INTEGER) {
        ranges.clamp(value.round())
    } else {
        value
    }
}

/// Maps the balance controller (0..1, centre 0.5) to the left/right pair.
pub fn balance_from_controller(value: f32) -> (f32, f32) {
    let v = value / 0.5 - 1.0;
    if v < 0.0 {
        (-1.0, v * 2.0 + 1.0)
    } else if v > 0.0 {
        (v * 2.0 - 1.0, 1.0)
    } else {
        (-1.0, 1.0)
    }
}

/// Volume controller (0..1) to gain (0..1.27).
#[inline]
pub fn volume_from_controller(value: f32) -> f32 {
    value * 127.0 / 100.0
}
