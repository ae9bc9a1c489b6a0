//! Child processes hosting a bridged plugin or a plugin GUI.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LoadStage, PluginError, Result};
use crate::options::BridgePaths;
use crate::protocol::BridgeMessage;
use crate::transport::BridgeChannel;
use crate::types::PluginType;

/// How long a closing child gets before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// Process started, no message from it yet.
    Spawned,
    /// The child announced its address.
    Registered,
    /// The child reported its full state.
    Active,
    Closing,
    Gone,
}

/// What to launch, with the argument order each bridge executable expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeCommand {
    Plugin {
        url: String,
        kind: PluginType,
        filename: PathBuf,
        label: String,
    },
    Lv2Ui {
        url: String,
        plugin_uri: String,
        ui_uri: String,
        ui_binary: PathBuf,
        ui_bundle: PathBuf,
        ui_title: String,
    },
    VstUi {
        url: String,
        binary: PathBuf,
        ui_title: String,
    },
    /// A DSSI GUI speaks the same OSC dialect and is launched directly.
    DssiUi {
        gui: PathBuf,
        url: String,
        filename: PathBuf,
        label: String,
        ui_title: String,
    },
}

impl BridgeCommand {
    pub fn program<'a>(&'a self, paths: &'a BridgePaths) -> &'a Path {
        match self {
            BridgeCommand::Plugin { .. } => &paths.plugin,
            BridgeCommand::Lv2Ui { .. } => &paths.lv2_ui,
            BridgeCommand::VstUi { .. } => &paths.vst_ui,
            BridgeCommand::DssiUi { gui, .. } => gui,
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        match self {
            BridgeCommand::Plugin {
                url,
                kind,
                filename,
                label,
            } => vec![
                url.into(),
                kind.as_str().into(),
                filename.into(),
                label.into(),
            ],
            BridgeCommand::Lv2Ui {
                url,
                plugin_uri,
                ui_uri,
                ui_binary,
                ui_bundle,
                ui_title,
            } => vec![
                url.into(),
                plugin_uri.into(),
                ui_uri.into(),
                ui_binary.into(),
                ui_bundle.into(),
                ui_title.into(),
            ],
            BridgeCommand::VstUi {
                url,
                binary,
                ui_title,
            } => vec![url.into(), binary.into(), ui_title.into()],
            BridgeCommand::DssiUi {
                url,
                filename,
                label,
                ui_title,
                ..
            } => vec![url.into(), filename.into(), label.into(), ui_title.into()],
        }
    }

    pub fn is_ui(&self) -> bool {
        !matches!(self, BridgeCommand::Plugin { .. })
    }
}

/// One child process and the channel used to talk to it.
pub struct BridgeProcess {
    child: Option<Child>,
    state: BridgeState,
    channel: Arc<BridgeChannel>,
    spawned_at: Instant,
    closing_since: Option<Instant>,
}

impl BridgeProcess {
    pub fn spawn(paths: &BridgePaths, command: &BridgeCommand, channel: Arc<BridgeChannel>) -> Result<Self> {
        let program = command.program(paths);
        let child = Command::new(program)
            .args(command.args())
            .spawn()
            .map_err(|e| PluginError::load(program, LoadStage::Spawning, e.to_string()))?;

        tracing::info!("spawned bridge {} (pid {})", program.display(), child.id());
        Ok(Self::with_child(Some(child), channel))
    }

    /// A process record without a child, for peers started elsewhere.
    pub fn detached(channel: Arc<BridgeChannel>) -> Self {
        Self::with_child(None, channel)
    }

    fn with_child(child: Option<Child>, channel: Arc<BridgeChannel>) -> Self {
        channel.endpoint.clear_target();
        Self {
            child,
            state: BridgeState::Spawned,
            channel,
            spawned_at: Instant::now(),
            closing_since: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn channel(&self) -> &Arc<BridgeChannel> {
        &self.channel
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn mark_registered(&mut self) {
        if self.state == BridgeState::Spawned {
            self.state = BridgeState::Registered;
        }
    }

    pub fn mark_active(&mut self) {
        if matches!(self.state, BridgeState::Spawned | BridgeState::Registered) {
            self.state = BridgeState::Active;
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, BridgeState::Gone)
    }

    /// Queues `/quit` and starts the grace period.
    pub fn close(&mut self) {
        if matches!(self.state, BridgeState::Closing | BridgeState::Gone) {
            return;
        }
        self.channel.push(BridgeMessage::Quit);
        self.state = BridgeState::Closing;
        self.closing_since = Some(Instant::now());
    }

    /// The peer said it is exiting.
    pub fn exited(&mut self) {
        self.channel.endpoint.clear_target();
        self.state = BridgeState::Gone;
    }

    /// Reaps the child. Returns true on the transition to [`BridgeState::Gone`].
    pub fn poll(&mut self) -> bool {
        if self.state == BridgeState::Gone {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!("bridge exited with {status}");
                self.child = None;
                self.exited();
                true
            }
            Ok(None) => {
                if let Some(since) = self.closing_since {
                    if since.elapsed() > EXIT_GRACE {
                        tracing::warn!("bridge did not quit in time, killing it");
                        self.kill();
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                tracing::warn!("cannot poll bridge: {e}");
                false
            }
        }
    }

    /// Blocks until the child exits after [`close`](Self::close), killing it
    /// once the grace period runs out. A child that never got an address
    /// cannot have seen `/quit` and is killed straight away.
    pub fn wait_exit(&mut self) {
        if self.child.is_none() {
            return;
        }
        if !self.channel.endpoint.has_target() {
            self.kill();
            return;
        }
        self.close();
        let deadline = Instant::now() + EXIT_GRACE;
        while self.child.is_some() && !self.poll() {
            if Instant::now() >= deadline {
                tracing::warn!("bridge did not quit in time, killing it");
                self.kill();
                break;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.exited();
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        self.kill();
    }
}
