//! Bridge process errors.

use thiserror::Error;

use plinth_plugin::PluginError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("UI failed to load from {path}: {reason}")]
    UiLoad { path: String, reason: String },

    #[error("UI error: {0}")]
    Ui(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn ui_load(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::UiLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}
