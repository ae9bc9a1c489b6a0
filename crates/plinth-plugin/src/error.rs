//! Error types for plugin hosting

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Opening,
    Descriptor,
    Instantiation,
    Layout,
    Activation,
    Spawning,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Descriptor => write!(f, "finding descriptor"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::Layout => write!(f, "querying port layout"),
            LoadStage::Activation => write!(f, "activating"),
            LoadStage::Spawning => write!(f, "spawning bridge"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("Invalid plugin id {0}")]
    InvalidId(u16),

    #[error("Maximum number of plugins reached ({0})")]
    NoFreeSlot(usize),

    #[error("Invalid parameter index {0}")]
    InvalidParameter(i32),

    #[error("Invalid program index {0}")]
    InvalidProgram(i32),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    State(#[from] bincode::Error),
}

impl PluginError {
    pub(crate) fn load(path: impl Into<PathBuf>, stage: LoadStage, reason: impl Into<String>) -> Self {
        PluginError::LoadFailed {
            path: path.into(),
            stage,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_stage_display() {
        assert_eq!(LoadStage::Opening.to_string(), "opening library");
        assert_eq!(LoadStage::Descriptor.to_string(), "finding descriptor");
        assert_eq!(LoadStage::Instantiation.to_string(), "creating instance");
        assert_eq!(LoadStage::Layout.to_string(), "querying port layout");
        assert_eq!(LoadStage::Activation.to_string(), "activating");
        assert_eq!(LoadStage::Spawning.to_string(), "spawning bridge");
    }

    #[test]
    fn test_plugin_error_display() {
        let err = PluginError::load("/usr/lib/ladspa/amp.so", LoadStage::Descriptor, "no label 'amp'");
        let text = err.to_string();
        assert!(text.contains("finding descriptor"));
        assert!(text.contains("amp.so"));
        assert!(text.contains("no label 'amp'"));

        let err = PluginError::Timeout {
            operation: "show gui".to_string(),
            duration_ms: 4000,
        };
        assert!(err.to_string().contains("4000ms"));

        assert_eq!(PluginError::InvalidId(7).to_string(), "Invalid plugin id 7");
    }
}
