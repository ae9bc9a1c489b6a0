//! Bridge processes for plinth-plugin
//!
//! The host runs a plugin out of process by spawning `plinth-bridge-plugin`, and
//! shows a plugin GUI out of process by spawning `plinth-bridge-lv2-ui` or
//! `plinth-bridge-vst-ui`. Each child talks OSC back to the URL it was given.
//!
//! This crate is used by those binaries and is not intended for direct use by
//! applications. Use `plinth-plugin` for the host-side API.

pub mod cli;
pub mod error;
pub mod plugin_adapter;
pub mod queue;
pub mod toolkit;
pub mod ui_adapter;

pub use error::{Result, ServerError};
pub use plugin_adapter::PluginAdapter;
pub use queue::{ToolkitHandler, ToolkitMessage, ToolkitQueue};
pub use toolkit::{HeadlessToolkit, Toolkit};
pub use ui_adapter::{Lv2Ui, UiAdapter, UiBackend, UiEdit};

#[cfg(feature = "vst")]
pub use ui_adapter::VstUi;

// Re-export shared types from plinth-plugin
pub use plinth_plugin::{BridgeMessage, HostOptions, LoadRequest, PluginError, PluginType};
