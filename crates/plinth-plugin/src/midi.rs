//! Raw MIDI events as they cross the real-time boundary.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const MAX_MIDI_EVENTS: usize = 512;

pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_POLY_AFTERTOUCH: u8 = 0xA0;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_CHANNEL_PRESSURE: u8 = 0xD0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;

pub const CC_BANK_SELECT: u8 = 0x00;
pub const CC_BREATH: u8 = 0x02;
pub const CC_VOLUME: u8 = 0x07;
pub const CC_BALANCE: u8 = 0x08;
pub const CC_EFFECT_CONTROL_1: u8 = 0x0C;
pub const CC_ALL_SOUND_OFF: u8 = 0x78;
pub const CC_ALL_NOTES_OFF: u8 = 0x7B;

/// A short channel message with its frame offset inside the block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame: u32,
    pub data: [u8; 4],
    pub size: u8,
}

pub type MidiEventVec = SmallVec<[MidiEvent; 64]>;

impl MidiEvent {
    /// Copies up to four bytes of `bytes`.
    pub fn new(frame: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 4];
        let size = bytes.len().min(4);
        data[..size].copy_from_slice(&bytes[..size]);
        Self {
            frame,
            data,
            size: size as u8,
        }
    }

    pub fn note_on(frame: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(
            frame,
            &[STATUS_NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
        )
    }

    pub fn note_off(frame: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(
            frame,
            &[STATUS_NOTE_OFF | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
        )
    }

    pub fn control_change(frame: u32, channel: u8, control: u8, value: u8) -> Self {
        Self::new(
            frame,
            &[STATUS_CONTROL_CHANGE | (channel & 0x0F), control & 0x7F, value & 0x7F],
        )
    }

    pub fn program_change(frame: u32, channel: u8, program: u8) -> Self {
        Self::new(frame, &[STATUS_PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F])
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Status nibble without the channel.
    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0] & 0xF0
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.status() == STATUS_NOTE_ON && self.data[2] != 0
    }

    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.status() == STATUS_NOTE_OFF || (self.status() == STATUS_NOTE_ON && self.data[2] == 0)
    }

    /// Rewrites a velocity-zero note-on as the note-off it means.
    pub fn normalized(mut self) -> Self {
        if self.status() == STATUS_NOTE_ON && self.data[2] == 0 {
            self.data[0] = STATUS_NOTE_OFF | self.channel();
        }
        self
    }
}

/// Automation arriving on the control-input port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlEvent {
    pub frame: u32,
    pub channel: u8,
    pub kind: ControlEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlEventKind {
    /// Controller number plus a normalized 0..1 value.
    Parameter { control: u16, value: f32 },
    MidiBank { bank: u16 },
    MidiProgram { program: u16 },
    AllSoundOff,
    AllNotesOff,
}

impl ControlEvent {
    pub fn parameter(frame: u32, channel: u8, control: u16, value: f32) -> Self {
        Self {
            frame,
            channel,
            kind: ControlEventKind::Parameter { control, value },
        }
    }
}

pub type ControlEventVec = SmallVec<[ControlEvent; 32]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_velocity_zero_note_on_is_note_off() {
        let ev = MidiEvent::note_on(3, 2, 60, 0).normalized();
        assert_eq!(ev.status(), STATUS_NOTE_OFF);
        assert_eq!(ev.channel(), 2);
        assert!(ev.is_note_off());
        assert_eq!(ev.frame, 3);
    }

    #[test]
    fn test_bytes_are_truncated() {
        let ev = MidiEvent::new(0, &[0xF0, 1, 2, 3, 4, 5]);
        assert_eq!(ev.size, 4);
        assert_eq!(ev.bytes(), &[0xF0, 1, 2, 3]);

        let ev = MidiEvent::program_change(0, 1, 5);
        assert_eq!(ev.bytes(), &[0xC1, 5]);
    }
}
