//! Messages from the OSC thread, applied on the toolkit thread.
//!
//! The OSC receive loop only pushes; everything that touches the plugin or the
//! UI happens when the toolkit drains the queue.

use std::ops::ControlFlow;

use plinth_plugin::transport::MessageQueue;
use plinth_plugin::BridgeMessage;

use crate::error::Result;

pub const TOOLKIT_QUEUE_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum ToolkitMessage {
    Parameter { rindex: i32, value: f32 },
    Program(i32),
    MidiProgram { bank: i32, program: i32 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ShowGui(bool),
    ResizeGui { width: i32, height: i32 },
    Configure { key: String, value: String },
    Chunk(Vec<u8>),
    SaveNow,
    /// The host answered the handshake with its URL.
    Update(String),
    Quit,
}

impl ToolkitMessage {
    /// Maps a message the host sends to a bridge. `None` for anything a bridge
    /// does not act on.
    pub fn from_osc(msg: BridgeMessage) -> Option<Self> {
        Some(match msg {
            BridgeMessage::Control { rindex, value } => Self::Parameter { rindex, value },
            BridgeMessage::Program(index) => Self::Program(index),
            BridgeMessage::MidiProgram { bank, program } => Self::MidiProgram { bank, program },
            BridgeMessage::Midi([_, status, note, velocity]) => {
                let channel = status & 0x0F;
                match status & 0xF0 {
                    0x90 if velocity > 0 => Self::NoteOn {
                        channel,
                        note,
                        velocity,
                    },
                    0x80 | 0x90 => Self::NoteOff { channel, note },
                    _ => return None,
                }
            }
            BridgeMessage::Configure { key, value } => Self::Configure { key, value },
            BridgeMessage::Show => Self::ShowGui(true),
            BridgeMessage::Hide => Self::ShowGui(false),
            BridgeMessage::Quit => Self::Quit,
            BridgeMessage::Update(url) => Self::Update(url),
            BridgeMessage::Chunk(data) => Self::Chunk(data),
            BridgeMessage::SaveNow => Self::SaveNow,
            _ => return None,
        })
    }
}

/// What a bridge does with toolkit messages.
pub trait ToolkitHandler {
    fn handle(&mut self, msg: ToolkitMessage) -> Result<()>;

    /// Called once per toolkit tick after the queue was drained.
    fn idle(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once when the toolkit loop ends.
    fn quit(&mut self) {}
}

pub struct ToolkitQueue {
    items: MessageQueue<ToolkitMessage>,
}

impl Default for ToolkitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolkitQueue {
    pub fn new() -> Self {
        Self {
            items: MessageQueue::new(TOOLKIT_QUEUE_SIZE),
        }
    }

    /// Returns false and drops the message when the queue is full.
    pub fn push(&self, msg: ToolkitMessage) -> bool {
        let pushed = self.items.push(msg);
        if !pushed {
            tracing::warn!("toolkit queue full, dropping message");
        }
        pushed
    }

    /// Pushes the toolkit form of an OSC message, if it has one.
    pub fn push_osc(&self, msg: BridgeMessage) {
        let method = msg.method();
        match ToolkitMessage::from_osc(msg) {
            Some(msg) => {
                self.push(msg);
            }
            None => tracing::debug!("ignoring '{method}'"),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hands every queued message to `handler` in arrival order. Stops at
    /// `Quit`, dropping what was queued behind it.
    pub fn drain(&self, handler: &mut dyn ToolkitHandler) -> ControlFlow<()> {
        for msg in self.items.drain() {
            if msg == ToolkitMessage::Quit {
                return ControlFlow::Break(());
            }
            if let Err(e) = handler.handle(msg) {
                tracing::warn!("toolkit message failed: {e}");
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<ToolkitMessage>,
    }

    impl ToolkitHandler for Recorder {
        fn handle(&mut self, msg: ToolkitMessage) -> Result<()> {
            self.seen.push(msg);
            Ok(())
        }
    }

    #[test]
    fn test_drain_in_order() {
        let queue = ToolkitQueue::new();
        queue.push(ToolkitMessage::Program(2));
        queue.push(ToolkitMessage::Parameter { rindex: 1, value: 0.5 });

        let mut recorder = Recorder::default();
        assert_eq!(queue.drain(&mut recorder), ControlFlow::Continue(()));
        assert_eq!(
            recorder.seen,
            vec![
                ToolkitMessage::Program(2),
                ToolkitMessage::Parameter { rindex: 1, value: 0.5 }
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_quit_stops_drain() {
        let queue = ToolkitQueue::new();
        queue.push(ToolkitMessage::ShowGui(true));
        queue.push(ToolkitMessage::Quit);
        queue.push(ToolkitMessage::Program(0));

        let mut recorder = Recorder::default();
        assert_eq!(queue.drain(&mut recorder), ControlFlow::Break(()));
        assert_eq!(recorder.seen, vec![ToolkitMessage::ShowGui(true)]);
    }

    #[test]
    fn test_full_queue_drops() {
        let queue = ToolkitQueue::new();
        for i in 0..TOOLKIT_QUEUE_SIZE {
            assert!(queue.push(ToolkitMessage::Program(i as i32)));
        }
        assert!(!queue.push(ToolkitMessage::SaveNow));
        assert_eq!(queue.len(), TOOLKIT_QUEUE_SIZE);
    }

    #[test]
    fn test_from_osc() {
        assert_eq!(
            ToolkitMessage::from_osc(BridgeMessage::Midi([0, 0x91, 60, 100])),
            Some(ToolkitMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            })
        );
        assert_eq!(
            ToolkitMessage::from_osc(BridgeMessage::Midi([0, 0x90, 60, 0])),
            Some(ToolkitMessage::NoteOff { channel: 0, note: 60 })
        );
        assert_eq!(ToolkitMessage::from_osc(BridgeMessage::Midi([0, 0xB0, 7, 100])), None);
        assert_eq!(ToolkitMessage::from_osc(BridgeMessage::Hide), Some(ToolkitMessage::ShowGui(false)));
        assert_eq!(ToolkitMessage::from_osc(BridgeMessage::Exiting), None);
    }
}
