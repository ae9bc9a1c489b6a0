//! Embedder notification surface.

use std::sync::Arc;

use crate::types::PluginId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackKind {
    Debug,
    ParameterChanged,
    ParameterMidiChannelChanged,
    ParameterMidiCcChanged,
    ProgramChanged,
    MidiProgramChanged,
    NoteOn,
    NoteOff,
    ShowGui,
    ResizeGui,
    Update,
    ReloadInfo,
    ReloadParameters,
    ReloadPrograms,
    ReloadAll,
    Quit,
}

/// `(kind, plugin, value1, value2, value3)`. Always invoked from a
/// non-real-time thread with no host lock held.
pub type HostCallback = Arc<dyn Fn(CallbackKind, PluginId, i32, i32, f64) + Send + Sync>;

/// A callback deferred until the caller has released the process lock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingCallback {
    pub kind: CallbackKind,
    pub value1: i32,
    pub value2: i32,
    pub value3: f64,
}

impl PendingCallback {
    pub fn new(kind: CallbackKind, value1: i32, value2: i32, value3: f64) -> Self {
        Self {
            kind,
            value1,
            value2,
            value3,
        }
    }
}
