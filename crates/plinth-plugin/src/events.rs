//! Postponed events and injected notes.
//!
//! Both tables are written by one thread and emptied by another under their own
//! short lock. Neither is ever guarded by the process lock.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const MAX_POST_EVENTS: usize = 152;
pub const MAX_EXTERNAL_NOTES: usize = 512;

/// Free slots all-notes-off leaves for the audio thread.
pub const POST_EVENT_RESERVE: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostEventKind {
    #[default]
    Null,
    Debug,
    ParameterChange,
    ProgramChange,
    MidiProgramChange,
    NoteOn,
    NoteOff,
    Custom,
}

/// A state change seen on the audio thread and delivered later by the idle thread.
///
/// Field use per kind:
/// - `ParameterChange`: index, rindex, value
/// - `ProgramChange`: index
/// - `MidiProgramChange`: index, bank, program
/// - `NoteOn` / `NoteOff`: channel, note, velocity
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PostEvent {
    pub kind: PostEventKind,
    pub value1: i32,
    pub value2: i32,
    pub value3: f64,
    pub payload: Option<Arc<[u8]>>,
}

impl PostEvent {
    pub fn new(kind: PostEventKind, value1: i32, value2: i32, value3: f64) -> Self {
        Self {
            kind,
            value1,
            value2,
            value3,
            payload: None,
        }
    }
}

pub type PostEventVec = SmallVec<[PostEvent; MAX_POST_EVENTS]>;

/// Bounded single-producer / single-consumer event table.
pub struct PostEventQueue {
    events: Mutex<PostEventVec>,
    dropped: AtomicUsize,
}

impl Default for PostEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PostEventQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(SmallVec::new()),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Returns false when the table is full; the event is then discarded.
    pub fn push(&self, event: PostEvent) -> bool {
        let mut events = self.events.lock();
        if events.len() >= MAX_POST_EVENTS {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        events.push(event);
        true
    }

    /// Takes every pending event and leaves the table empty.
    pub fn drain(&self) -> PostEventVec {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_slots(&self) -> usize {
        MAX_POST_EVENTS.saturating_sub(self.len())
    }

    /// Events discarded because the table was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A note injected from outside the MIDI input port. Velocity 0 means note-off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalNote {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

pub struct ExternalNoteTable {
    notes: Mutex<SmallVec<[ExternalNote; MAX_EXTERNAL_NOTES]>>,
}

impl Default for ExternalNoteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalNoteTable {
    pub fn new() -> Self {
        Self {
            notes: Mutex::new(SmallVec::new()),
        }
    }

    pub fn push(&self, note: ExternalNote) -> bool {
        let mut notes = self.notes.lock();
        if notes.len() >= MAX_EXTERNAL_NOTES {
            return false;
        }
        notes.push(note);
        true
    }

    /// Audio-thread side: hands every queued note to `f` unless the control
    /// side holds the lock, in which case the notes wait for the next block.
    pub fn try_drain(&self, mut f: impl FnMut(ExternalNote)) {
        if let Some(mut notes) = self.notes.try_lock() {
            for note in notes.drain(..) {
                f(note);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_silently() {
        let queue = PostEventQueue::new();
        for i in 0..(MAX_POST_EVENTS + 20) {
            queue.push(PostEvent::new(PostEventKind::ParameterChange, i as i32, 0, 0.0));
        }
        assert_eq!(queue.len(), MAX_POST_EVENTS);
        assert_eq!(queue.dropped(), 20);
        assert_eq!(queue.free_slots(), 0);

        let drained = queue.drain();
        assert_eq!(drained.len(), MAX_POST_EVENTS);
        assert_eq!(drained[0].value1, 0);
        assert_eq!(drained[MAX_POST_EVENTS - 1].value1, MAX_POST_EVENTS as i32 - 1);
    }

    #[test]
    fn test_drain_clears_table() {
        let queue = PostEventQueue::new();
        queue.push(PostEvent::new(PostEventKind::NoteOn, 0, 60, 100.0));
        queue.push(PostEvent::new(PostEventKind::NoteOff, 0, 60, 0.0));

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
        assert!(queue.push(PostEvent::default()));
    }

    #[test]
    fn test_external_notes_drain_in_order() {
        let table = ExternalNoteTable::new();
        table.push(ExternalNote { channel: 0, note: 60, velocity: 100 });
        table.push(ExternalNote { channel: 0, note: 60, velocity: 0 });

        let mut seen = Vec::new();
        table.try_drain(|n| seen.push(n));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].velocity, 100);
        assert_eq!(seen[1].velocity, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_external_notes_capacity() {
        let table = ExternalNoteTable::new();
        for i in 0..MAX_EXTERNAL_NOTES {
            assert!(table.push(ExternalNote { channel: 0, note: (i % 128) as u8, velocity: 1 }));
        }
        assert!(!table.push(ExternalNote::default()));
    }
}
