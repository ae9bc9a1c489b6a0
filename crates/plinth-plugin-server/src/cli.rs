//! Command lines of the bridge executables, in the order the host passes them.

use clap::Parser;
use std::path::PathBuf;

use plinth_plugin::PluginType;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "plinth-bridge-plugin", about = "Runs one plugin for a plinth host")]
pub struct PluginArgs {
    /// OSC URL of the plugin on the host
    pub url: String,

    /// LADSPA, DSSI, LV2, VST, SF2 or INTERNAL
    #[arg(value_parser = parse_kind)]
    pub kind: PluginType,

    /// Plugin binary, bundle or SoundFont. Empty for built-in plugins.
    #[arg(value_parser = parse_path)]
    pub filename: PathBuf,

    /// Plugin label or URI
    pub label: String,
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "plinth-bridge-lv2-ui", about = "Shows an LV2 plugin UI for a plinth host")]
pub struct Lv2UiArgs {
    /// OSC URL of the plugin on the host
    pub url: String,

    pub plugin_uri: String,
    pub ui_uri: String,

    /// Shared library holding the UI descriptor
    pub ui_binary: PathBuf,

    pub ui_bundle: PathBuf,
    pub ui_title: String,
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "plinth-bridge-vst-ui", about = "Shows a VST plugin editor for a plinth host")]
pub struct VstUiArgs {
    /// OSC URL of the plugin on the host
    pub url: String,

    /// The VST binary itself
    pub binary: PathBuf,

    pub ui_title: String,
}

fn parse_path(value: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(value))
}

fn parse_kind(value: &str) -> Result<PluginType, String> {
    value.parse().map_err(|e: plinth_plugin::PluginError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_args_positional() {
        let args = PluginArgs::try_parse_from([
            "plinth-bridge-plugin",
            "osc.udp://127.0.0.1:9000/plinth/2",
            "ladspa",
            "/usr/lib/ladspa/amp.so",
            "amp_stereo",
        ])
        .unwrap();
        assert_eq!(args.kind, PluginType::Ladspa);
        assert_eq!(args.filename, PathBuf::from("/usr/lib/ladspa/amp.so"));
        assert_eq!(args.label, "amp_stereo");
    }

    #[test]
    fn test_internal_plugin_without_file() {
        let args = PluginArgs::try_parse_from(["plinth-bridge-plugin", "osc.udp://h:1/p", "INTERNAL", "", "sine"]).unwrap();
        assert_eq!(args.kind, PluginType::Internal);
        assert!(args.filename.as_os_str().is_empty());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = PluginArgs::try_parse_from(["plinth-bridge-plugin", "osc.udp://h:1/p", "AU", "x", "y"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_lv2_ui_args_match_bridge_command() {
        use plinth_plugin::BridgeCommand;

        let command = BridgeCommand::Lv2Ui {
            url: "osc.udp://127.0.0.1:9000/plinth/0".into(),
            plugin_uri: "urn:example:amp".into(),
            ui_uri: "urn:example:amp#ui".into(),
            ui_binary: "/lv2/amp.lv2/ui.so".into(),
            ui_bundle: "/lv2/amp.lv2/".into(),
            ui_title: "Amp (GUI)".into(),
        };
        let argv = std::iter::once("plinth-bridge-lv2-ui".into()).chain(command.args());
        let args = Lv2UiArgs::try_parse_from(argv).unwrap();
        assert_eq!(args.ui_uri, "urn:example:amp#ui");
        assert_eq!(args.ui_title, "Amp (GUI)");
    }

    #[test]
    fn test_vst_ui_args() {
        let args = VstUiArgs::try_parse_from(["plinth-bridge-vst-ui", "osc.udp://h:1/p", "/vst/synth.so", "Synth"]).unwrap();
        assert_eq!(args.binary, PathBuf::from("/vst/synth.so"));
    }
}
