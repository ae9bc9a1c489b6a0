//! Plugin hosting for plinth
//!
//! One lifecycle, parameter and program interface over LADSPA, DSSI, LV2, VST and
//! SoundFont plugins, plus built-in plugins and plugins running in a separate
//! `plinth-bridge-plugin` process controlled over OSC.
//!
//! ## Usage
//!
//! ```ignore
//! use plinth_plugin::{HostContext, HostOptions, LoadRequest, SilentIo};
//!
//! let host = HostContext::new(HostOptions::default())?;
//! let id = host.add_plugin(LoadRequest::internal("sine"))?;
//! host.send_midi_note(id, 0, 69, 100)?;
//!
//! // Audio thread
//! host.process_block(&mut SilentIo, 512, 0);
//!
//! // Idle thread
//! host.idle();
//! ```

pub mod error;
pub use error::{LoadStage, PluginError, Result};

pub mod types;
pub use types::{
    CustomData, CustomDataType, MidiProgramData, Parameter, ParameterData, ParameterDirection,
    ParameterHints, ParameterInfo, ParameterRanges, PluginCategory, PluginHints, PluginId,
    PluginInfo, PluginType, PortGroup,
};

pub mod midi;
pub use midi::{ControlEvent, ControlEventKind, MidiEvent, MidiEventVec};

pub mod events;
pub use events::{PostEvent, PostEventKind, PostEventQueue};

pub mod callback;
pub use callback::{CallbackKind, HostCallback};

pub mod options;
pub use options::{BridgePaths, HostOptions};

pub mod peaks;
pub use peaks::PeakMeters;

pub mod ports;
pub use ports::PortBuffers;

pub mod process;
pub mod program;

pub mod protocol;
pub use protocol::BridgeMessage;

pub mod transport;
pub use transport::{BridgeChannel, OscEndpoint, OscSender, OscServer};

pub mod supervisor;
pub use supervisor::{BridgeCommand, BridgeProcess, BridgeState};

pub mod backend;
pub use backend::{LoadRequest, LoadedBackend, PluginBackend, PluginLayout};

pub mod instance;
pub use instance::{MessageSource, Outbox, PluginInstance, PluginShared};

pub mod state;
pub use state::{HostState, PluginState};

pub mod context;
pub use context::{BlockIo, HostContext, HostShared, SilentIo};
