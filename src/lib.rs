//! # plinth - Plugin Hosting Engine
//!
//! One lifecycle, parameter and program interface over several plugin formats,
//! with the real-time callback and an OSC control channel around it.
//!
//! ## Architecture
//!
//! plinth is an umbrella crate over:
//! - **plinth-plugin** - Host library (instances, backends, postponed events, OSC protocol, bridge supervisor, peaks)
//! - **plinth-plugin-server** - Bridge processes running one plugin or one plugin GUI out of process
//!
//! ## Quick Start
//!
//! ```ignore
//! use plinth::prelude::*;
//!
//! let engine = PlinthEngine::builder()
//!     .sample_rate(48000.0)
//!     .callback(|kind, id, v1, _, v3| println!("{id}: {kind:?} {v1} {v3}"))
//!     .build()?;
//!
//! let gain = engine.try_add_plugin(LoadRequest::internal("gain"))?;
//! engine.context().set_parameter_value(gain, 0, 0.5)?;
//!
//! // Audio callback
//! engine.process(&mut SilentIo, 512, 0);
//! ```
//!
//! ## Feature Flags
//!
//! - `vst` - VST 2.x plugins and editors
//! - `lv2` - LV2 plugins (needs liblilv)
//! - `all-plugins` - Both

/// Re-export of plinth-plugin for direct access
pub use plinth_plugin as plugin;

pub use plinth_plugin::{
    BlockIo, BridgePaths, CallbackKind, CustomDataType, HostCallback, HostContext, HostOptions, HostState,
    LoadRequest, PluginError, PluginHints, PluginId, PluginInfo, PluginState, PluginType, PortBuffers,
    SilentIo,
};

mod builder;
mod engine;
mod error;

pub use builder::PlinthEngineBuilder;
pub use engine::PlinthEngine;
pub use error::{Error, Result};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{PlinthEngine, PlinthEngineBuilder};

    pub use crate::{BlockIo, CallbackKind, HostOptions, LoadRequest, PluginId, PluginType, PortBuffers, SilentIo};
}
