//! Builder for configuring and constructing a `PlinthEngine`.

use std::path::Path;
use std::sync::Arc;

use plinth_plugin::{CallbackKind, HostCallback, HostContext, HostOptions, PluginId};

use crate::{PlinthEngine, Result};

/// Setters apply on top of the current options, so call
/// [`options`](Self::options) or [`config_file`](Self::config_file) first.
///
/// # Example
///
/// ```ignore
/// use plinth::prelude::*;
///
/// let engine = PlinthEngine::builder()
///     .sample_rate(44100.0)
///     .buffer_size(256)
///     .osc(true)
///     .build()?;
/// ```
pub struct PlinthEngineBuilder {
    options: HostOptions,
    callback: Option<HostCallback>,
    osc: bool,
    idle_thread: bool,
}

impl Default for PlinthEngineBuilder {
    fn default() -> Self {
        Self {
            options: HostOptions::default(),
            callback: None,
            osc: false,
            idle_thread: true,
        }
    }
}

impl PlinthEngineBuilder {
    /// Replaces every option.
    pub fn options(mut self, options: HostOptions) -> Self {
        self.options = options;
        self
    }

    /// Loads the options from a TOML file.
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.options = HostOptions::from_file(path)?;
        Ok(self)
    }

    /// Default: 48000
    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.options.sample_rate = sample_rate;
        self
    }

    /// Default: 512
    pub fn buffer_size(mut self, frames: usize) -> Self {
        self.options.buffer_size = frames;
        self
    }

    /// Default: 99
    pub fn max_plugins(mut self, count: usize) -> Self {
        self.options.max_plugins = count;
        self
    }

    pub fn callback(
        mut self,
        callback: impl Fn(CallbackKind, PluginId, i32, i32, f64) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Start the OSC server. Needed for bridged plugins, GUI bridges and
    /// control clients. Default: off
    pub fn osc(mut self, enabled: bool) -> Self {
        self.osc = enabled;
        self
    }

    /// Run idle work on the `plinth-idle` thread. Without it the embedder calls
    /// [`PlinthEngine::idle`] itself. Default: on
    pub fn idle_thread(mut self, enabled: bool) -> Self {
        self.idle_thread = enabled;
        self
    }

    pub fn build(self) -> Result<PlinthEngine> {
        let context = if self.osc {
            HostContext::with_osc(self.options)?
        } else {
            HostContext::new(self.options)?
        };
        context.set_callback(self.callback);
        PlinthEngine::new(context, self.idle_thread)
    }
}
