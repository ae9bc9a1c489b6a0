//! Host configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PluginError, Result};

/// Hard upper bound for the plugin table.
pub const MAX_PLUGINS_LIMIT: usize = 99;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    pub sample_rate: f64,
    pub buffer_size: usize,

    /// Plugin table capacity. A bridge child runs with 1.
    pub max_plugins: usize,

    /// MIDI channel carrying the host's own automation (0-15).
    pub control_channel: u8,

    /// Parameters beyond this count are not exposed.
    pub max_parameters: usize,

    /// Show plugin GUIs through a UI bridge process when one is available.
    pub prefer_ui_bridges: bool,

    pub osc_ui_timeout_ms: u64,
    pub osc_ui_poll_ms: u64,
    pub idle_interval_ms: u64,

    /// Address the OSC control server binds to.
    pub osc_bind: String,

    pub bridge_paths: BridgePaths,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            buffer_size: 512,
            max_plugins: MAX_PLUGINS_LIMIT,
            control_channel: 0,
            max_parameters: 200,
            prefer_ui_bridges: true,
            osc_ui_timeout_ms: 4000,
            osc_ui_poll_ms: 100,
            idle_interval_ms: 50,
            osc_bind: "127.0.0.1:0".to_string(),
            bridge_paths: BridgePaths::default(),
        }
    }
}

/// Executables spawned for out-of-process plugins and GUIs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgePaths {
    pub plugin: PathBuf,
    pub lv2_ui: PathBuf,
    pub vst_ui: PathBuf,
}

impl Default for BridgePaths {
    fn default() -> Self {
        Self {
            plugin: PathBuf::from("plinth-bridge-plugin"),
            lv2_ui: PathBuf::from("plinth-bridge-lv2-ui"),
            vst_ui: PathBuf::from("plinth-bridge-vst-ui"),
        }
    }
}

impl HostOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: HostOptions =
            toml::from_str(text).map_err(|e| PluginError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| PluginError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(PluginError::Config(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.buffer_size == 0 {
            return Err(PluginError::Config("buffer_size must be non-zero".into()));
        }
        if self.max_plugins == 0 || self.max_plugins > MAX_PLUGINS_LIMIT {
            return Err(PluginError::Config(format!(
                "max_plugins must be within 1..={MAX_PLUGINS_LIMIT}, got {}",
                self.max_plugins
            )));
        }
        if self.control_channel > 15 {
            return Err(PluginError::Config(format!(
                "control_channel must be within 0..=15, got {}",
                self.control_channel
            )));
        }
        if self.osc_ui_poll_ms == 0 || self.idle_interval_ms == 0 {
            return Err(PluginError::Config("poll and idle intervals must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let options = HostOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.max_plugins, 99);
        assert_eq!(options.osc_ui_timeout_ms, 4000);
        assert_eq!(options.idle_interval_ms, 50);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let options = HostOptions::from_toml_str(
            r#"
            sample_rate = 44100.0
            control_channel = 9

            [bridge_paths]
            plugin = "/opt/plinth/bridge"
            "#,
        )
        .unwrap();

        assert_eq!(options.sample_rate, 44100.0);
        assert_eq!(options.control_channel, 9);
        assert_eq!(options.buffer_size, 512);
        assert_eq!(options.bridge_paths.plugin, PathBuf::from("/opt/plinth/bridge"));
        assert_eq!(options.bridge_paths.vst_ui, PathBuf::from("plinth-bridge-vst-ui"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(HostOptions::from_toml_str("control_channel = 16").is_err());
        assert!(HostOptions::from_toml_str("max_plugins = 0").is_err());
        assert!(HostOptions::from_toml_str("max_plugins = 100").is_err());
        assert!(HostOptions::from_toml_str("sample_rate = -1.0").is_err());
        assert!(HostOptions::from_toml_str("buffer_size = \"big\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_size = 256\nprefer_ui_bridges = false").unwrap();

        let options = HostOptions::from_file(file.path()).unwrap();
        assert_eq!(options.buffer_size, 256);
        assert!(!options.prefer_ui_bridges);
    }

    #[test]
    fn test_toml_round_trip() {
        let options = HostOptions {
            max_plugins: 4,
            ..Default::default()
        };
        let text = options.to_toml_string().unwrap();
        assert_eq!(HostOptions::from_toml_str(&text).unwrap(), options);
    }
}
