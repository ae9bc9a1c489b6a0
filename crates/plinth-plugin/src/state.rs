//! Saved plugin state, serialized with bincode.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backend::LoadRequest;
use crate::error::Result;
use crate::instance::{Outbox, PluginInstance};
use crate::types::{CustomData, PluginHints, PluginType};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub rindex: i32,
    pub value: f32,
    pub midi_channel: u8,
    pub midi_cc: i16,
}

/// Everything needed to bring a plugin back: what to load and how it was set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub kind: PluginType,
    pub filename: PathBuf,
    pub label: String,
    pub name: String,
    pub bridged: bool,
    pub active: bool,
    pub dry_wet: f32,
    pub volume: f32,
    pub balance_left: f32,
    pub balance_right: f32,
    pub program: i32,
    pub midi_program: i32,
    pub parameters: Vec<ParameterState>,
    pub custom_data: Vec<CustomData>,
    pub chunk: Option<Vec<u8>>,
}

impl PluginState {
    pub fn capture(plugin: &mut PluginInstance) -> Self {
        let chunk = if plugin.hints().contains(PluginHints::USES_CHUNKS) {
            plugin
                .chunk_data()
                .map_err(|e| tracing::warn!("{}: chunk not saved: {e}", plugin.name()))
                .ok()
        } else {
            None
        };
        Self {
            kind: plugin.kind(),
            filename: plugin.filename().to_path_buf(),
            label: plugin.label().to_string(),
            name: plugin.name().to_string(),
            bridged: plugin.hints().contains(PluginHints::IS_BRIDGE),
            active: plugin.is_active(),
            dry_wet: plugin.dry_wet(),
            volume: plugin.volume(),
            balance_left: plugin.balance_left(),
            balance_right: plugin.balance_right(),
            program: plugin.programs().current,
            midi_program: plugin.midi_programs().current,
            parameters: plugin
                .parameters()
                .iter()
                .filter(|p| p.is_input())
                .map(|p| ParameterState {
                    rindex: p.data.rindex,
                    value: p.value,
                    midi_channel: p.data.midi_channel,
                    midi_cc: p.data.midi_cc,
                })
                .collect(),
            custom_data: plugin.custom_data().to_vec(),
            chunk,
        }
    }

    pub fn request(&self) -> LoadRequest {
        LoadRequest::new(self.kind, self.filename.clone(), self.label.clone())
            .name(self.name.clone())
            .bridged(self.bridged)
    }

    /// Restores custom data, programs, then chunk or parameter values, then the
    /// internal parameters. Parameters the plugin no longer has are skipped.
    pub fn apply(&self, plugin: &mut PluginInstance, outbox: &mut Outbox) -> Result<()> {
        for data in &self.custom_data {
            plugin.set_custom_data(data.kind, &data.key, &data.value, true)?;
        }
        if self.program >= 0 && (self.program as usize) < plugin.programs().count() {
            plugin.set_program(self.program, true, true, true, outbox)?;
        }
        if self.midi_program >= 0 && (self.midi_program as usize) < plugin.midi_programs().count() {
            plugin.set_midi_program(self.midi_program, true, true, true, outbox)?;
        }

        let chunk_restored = match &self.chunk {
            Some(chunk) => match plugin.set_chunk_data(chunk) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("{}: chunk not restored: {e}", plugin.name());
                    false
                }
            },
            None => false,
        };

        for saved in &self.parameters {
            let Some(index) = plugin
                .parameters()
                .iter()
                .position(|p| p.data.rindex == saved.rindex)
            else {
                tracing::debug!("{}: saved parameter {} is gone", plugin.name(), saved.rindex);
                continue;
            };
            if !chunk_restored {
                plugin.set_parameter_value(index, saved.value, true, true, false, outbox)?;
            }
            plugin.set_parameter_midi_channel(index, saved.midi_channel, false, outbox)?;
            plugin.set_parameter_midi_cc(index, saved.midi_cc, false, outbox)?;
        }

        plugin.set_dry_wet(self.dry_wet, true, true, outbox);
        plugin.set_volume(self.volume, true, true, outbox);
        plugin.set_balance_left(self.balance_left, true, true, outbox);
        plugin.set_balance_right(self.balance_right, true, true, outbox);
        plugin.set_active(self.active, true, true, outbox);
        Ok(())
    }
}

/// A whole session: every plugin in slot order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub plugins: Vec<PluginState>,
}

impl HostState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoadedBackend;
    use crate::instance::PluginShared;
    use crate::options::HostOptions;
    use crate::peaks::PeakMeters;
    use crate::types::{CustomDataType, PluginId};
    use std::sync::Arc;

    fn gain() -> (PluginInstance, Outbox) {
        let options = HostOptions::default();
        let request = LoadRequest::internal("gain");
        let backend = LoadedBackend::load(&request, &options).unwrap();
        let mut plugin = PluginInstance::new(
            Arc::new(PluginShared::new(PluginId(0))),
            backend,
            &request,
            "Gain",
            &options,
            Arc::new(PeakMeters::new(1)),
        );
        let mut outbox = Outbox::new();
        plugin.reload(&mut outbox).unwrap();
        (plugin, outbox)
    }

    #[test]
    fn test_capture_and_apply() {
        let (mut source, mut outbox) = gain();
        source.set_parameter_value(0, 1.5, false, false, false, &mut outbox).unwrap();
        source.set_parameter_midi_cc(1, 21, false, &mut outbox).unwrap();
        source.set_volume(0.5, false, false, &mut outbox);
        source.set_active(true, false, false, &mut outbox);
        source
            .set_custom_data(CustomDataType::String, "mode", "fine", false)
            .unwrap();

        let state = PluginState::capture(&mut source);
        assert_eq!(state.parameters.len(), 2);
        assert!(state.chunk.is_some());
        assert_eq!(state.request().label, "gain");

        let (mut target, mut outbox) = gain();
        state.apply(&mut target, &mut outbox).unwrap();
        assert_eq!(target.parameter_value(0), Some(1.5));
        assert_eq!(target.parameter(1).unwrap().data.midi_cc, 21);
        assert_eq!(target.volume(), 0.5);
        assert!(target.is_active());
        assert_eq!(target.custom_data(), source.custom_data());
    }

    #[test]
    fn test_host_state_file() {
        let (mut plugin, _) = gain();
        let state = HostState {
            plugins: vec![PluginState::capture(&mut plugin)],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.plinth");
        state.save(&path).unwrap();
        assert_eq!(HostState::load(&path).unwrap(), state);

        assert!(HostState::from_bytes(&[0xFF; 3]).is_err());
    }
}
