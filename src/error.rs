//! Centralized error type for the plinth umbrella crate.
//!
//! Wraps the plugin host errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Plugin(#[from] plinth_plugin::PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
