//! PlinthEngine: the host context plus the idle thread

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use plinth_plugin::{BlockIo, HostContext, HostState, LoadRequest, PluginId};

use crate::Result;

struct IdleThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

fn idle_loop(context: Arc<HostContext>, interval: Duration, stop: Receiver<()>) {
    tracing::debug!("idle thread running every {interval:?}");
    loop {
        context.idle();
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Plugin host engine.
///
/// The embedder's audio callback calls [`process`](Self::process) once per
/// block; everything else is control plane and may be called from any
/// non-real-time thread. Callbacks are delivered from the idle thread, or from
/// the calling thread for direct edits, never while the process lock is held.
///
/// # Example
///
/// ```ignore
/// use plinth::prelude::*;
///
/// let engine = PlinthEngine::builder().sample_rate(48000.0).build()?;
/// let synth = engine.add_plugin(LoadRequest::internal("sine"));
/// engine.context().send_midi_note(synth, 0, 69, 100)?;
///
/// // In the audio callback
/// engine.process(&mut io, 512, 0);
/// ```
pub struct PlinthEngine {
    context: Arc<HostContext>,
    idle: Option<IdleThread>,
}

impl PlinthEngine {
    pub fn builder() -> crate::PlinthEngineBuilder {
        crate::PlinthEngineBuilder::default()
    }

    pub(crate) fn new(context: HostContext, idle_thread: bool) -> Result<Self> {
        let context = Arc::new(context);
        let idle = if idle_thread {
            let (stop, stopped) = crossbeam_channel::bounded(1);
            let interval = Duration::from_millis(context.options().idle_interval_ms.max(1));
            let ctx = Arc::clone(&context);
            let handle = std::thread::Builder::new()
                .name("plinth-idle".into())
                .spawn(move || idle_loop(ctx, interval, stopped))?;
            Some(IdleThread { stop, handle })
        } else {
            None
        };
        tracing::info!(
            "engine ready at {} Hz, {} frames",
            context.options().sample_rate,
            context.options().buffer_size
        );
        Ok(Self { context, idle })
    }

    /// The full control surface: parameters, programs, GUIs, state.
    pub fn context(&self) -> &HostContext {
        &self.context
    }

    pub fn sample_rate(&self) -> f64 {
        self.context.options().sample_rate
    }

    pub fn buffer_size(&self) -> usize {
        self.context.options().buffer_size
    }

    /// Adds a plugin, returning [`PluginId::INVALID`] on failure. The reason is
    /// in [`last_error`](Self::last_error).
    pub fn add_plugin(&self, request: LoadRequest) -> PluginId {
        self.context.add_plugin(request).unwrap_or(PluginId::INVALID)
    }

    pub fn try_add_plugin(&self, request: LoadRequest) -> Result<PluginId> {
        Ok(self.context.add_plugin(request)?)
    }

    pub fn remove_plugin(&self, id: PluginId) -> Result<()> {
        Ok(self.context.remove_plugin(id)?)
    }

    pub fn remove_all(&self) {
        self.context.remove_all();
    }

    pub fn plugin_count(&self) -> usize {
        self.context.plugin_count()
    }

    pub fn last_error(&self) -> String {
        self.context.last_error()
    }

    /// Runs every enabled plugin for one block. Call from the audio thread only.
    #[inline]
    pub fn process(&self, io: &mut dyn BlockIo, frames: usize, offset: usize) {
        self.context.process_block(io, frames, offset);
    }

    /// One idle tick on the calling thread.
    pub fn idle(&self) {
        self.context.idle();
    }

    pub fn has_idle_thread(&self) -> bool {
        self.idle.is_some()
    }

    /// `[left, right]` input peaks of a plugin.
    pub fn input_peaks(&self, id: PluginId) -> [f32; 2] {
        [self.context.input_peak(id, 0), self.context.input_peak(id, 1)]
    }

    /// `[left, right]` output peaks of a plugin.
    pub fn output_peaks(&self, id: PluginId) -> [f32; 2] {
        [self.context.output_peak(id, 0), self.context.output_peak(id, 1)]
    }

    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        self.context.save_state().save(path)?;
        Ok(())
    }

    /// Adds the plugins saved in `path` next to the current ones.
    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<Vec<PluginId>> {
        let state = HostState::load(path)?;
        Ok(self.context.load_state(&state))
    }
}

impl Drop for PlinthEngine {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            let _ = idle.stop.send(());
            if idle.handle.join().is_err() {
                tracing::error!("idle thread panicked");
            }
        }
        self.context.remove_all();
    }
}
