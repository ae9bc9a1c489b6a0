//! Child side of a bridged plugin.
//!
//! The adapter runs the plugin in a one-slot [`HostContext`] and speaks the
//! bridge dialect to the host:
//!
//! 1. [`start`](PluginAdapter::start) sends `bridge_update <child url>`;
//! 2. the host answers `update <host url>` and the adapter dumps the plugin
//!    description, ending with a second `bridge_update`;
//! 3. from then on host edits arrive through the [`ToolkitQueue`] and plugin
//!    automation, program changes and peaks flow back.
//!
//! Audio I/O belongs to the host, so the plugin runs on silent buffers at the
//! host's sample rate, one toolkit tick of frames at a time.

use crossbeam_channel::{Receiver, Sender};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use plinth_plugin::protocol::HOST_PATH;
use plinth_plugin::transport::parse_url;
use plinth_plugin::{
    BridgeMessage, CallbackKind, CustomDataType, HostContext, HostOptions, LoadRequest, OscSender,
    OscServer, PluginError, PluginHints, PluginId, SilentIo,
};

use crate::error::Result;
use crate::queue::{ToolkitHandler, ToolkitMessage, ToolkitQueue};

const CALLBACK_QUEUE_SIZE: usize = 1024;

type Notification = (CallbackKind, i32, f64);

pub struct PluginAdapter {
    context: HostContext,
    id: PluginId,
    server: OscServer,
    sender: OscSender,
    url: String,
    host: SocketAddr,
    host_path: String,
    notifications: Receiver<Notification>,
    frames_per_tick: usize,
}

impl PluginAdapter {
    /// Loads the plugin and starts listening. Host messages land in `queue`.
    pub fn new(
        host_url: &str,
        request: LoadRequest,
        mut options: HostOptions,
        queue: Arc<ToolkitQueue>,
    ) -> Result<Self> {
        let (host, host_path) = parse_url(host_url)?;
        options.max_plugins = 1;
        options.prefer_ui_bridges = false;
        let frames_per_tick =
            (options.sample_rate * Duration::from_millis(options.idle_interval_ms).as_secs_f64()) as usize;

        let context = HostContext::new(options)?;
        let (tx, rx): (Sender<Notification>, Receiver<Notification>) =
            crossbeam_channel::bounded(CALLBACK_QUEUE_SIZE);
        context.set_callback(Some(Arc::new(move |kind, _id, value1, _value2, value3| {
            if matches!(
                kind,
                CallbackKind::ParameterChanged | CallbackKind::ProgramChanged | CallbackKind::MidiProgramChanged
            ) {
                let _ = tx.try_send((kind, value1, value3));
            }
        })));
        let id = context.add_plugin(request.bridged(false))?;

        let server = OscServer::bind(
            "127.0.0.1:0",
            Box::new(move |_prefix, _from, msg| queue.push_osc(msg)),
        )?;
        let url = server.url(HOST_PATH);
        tracing::info!("bridge for '{}' at {url}", context.plugin_name(id)?);

        Ok(Self {
            sender: server.sender(),
            server,
            context,
            id,
            url,
            host,
            host_path,
            notifications: rx,
            frames_per_tick: frames_per_tick.max(1),
        })
    }

    /// URL the host sends to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    pub fn plugin_id(&self) -> PluginId {
        self.id
    }

    /// First step of the handshake.
    pub fn start(&self) {
        self.send(BridgeMessage::BridgeUpdate(self.url.clone()));
    }

    fn send(&self, msg: BridgeMessage) {
        if let Err(e) = self.sender.send(self.host, &self.host_path, &msg) {
            tracing::warn!("send '{}' to host failed: {e}", msg.method());
        }
    }

    fn describe(&self) -> Result<()> {
        let url = self.url.clone();
        let msgs = self.context.with_plugin(self.id, |p, _| Ok(p.describe(&url)))?;
        for msg in msgs {
            self.send(msg);
        }
        Ok(())
    }

    /// Reports every parameter value, after anything that may have moved them.
    fn send_parameter_values(&self) -> Result<()> {
        let values = self.context.inspect(self.id, |p| {
            p.parameters()
                .iter()
                .map(|param| BridgeMessage::Control {
                    rindex: param.data.rindex,
                    value: param.value,
                })
                .collect::<Vec<_>>()
        })?;
        for msg in values {
            self.send(msg);
        }
        Ok(())
    }

    fn save_now(&self) -> Result<()> {
        let (custom_data, chunk) = self.context.with_plugin(self.id, |p, _| {
            let chunk = if p.hints().contains(PluginHints::USES_CHUNKS) {
                Some(p.chunk_data()?)
            } else {
                None
            };
            Ok((p.custom_data().to_vec(), chunk))
        })?;
        for data in custom_data {
            self.send(BridgeMessage::CustomData {
                kind: data.kind.as_str().to_string(),
                key: data.key,
                value: data.value,
            });
        }
        if let Some(chunk) = chunk {
            self.send(BridgeMessage::BridgeChunk(chunk));
        }
        Ok(())
    }

    /// Runs one tick of frames in host-sized blocks.
    fn run_blocks(&self) {
        let block = self.context.options().buffer_size.max(1);
        let mut remaining = self.frames_per_tick;
        while remaining > 0 {
            let frames = remaining.min(block);
            self.context.process_block(&mut SilentIo, frames, 0);
            remaining -= frames;
        }
    }

    fn send_peaks(&self) {
        let peaks = self.context.peaks();
        self.send(BridgeMessage::InputPeak {
            left: peaks.input(self.id, 0),
            right: peaks.input(self.id, 1),
        });
        self.send(BridgeMessage::OutputPeak {
            left: peaks.output(self.id, 0),
            right: peaks.output(self.id, 1),
        });
    }

    /// Forwards what the plugin changed on its own.
    fn forward_notifications(&self) -> Result<()> {
        let pending: Vec<Notification> = self.notifications.try_iter().collect();
        for (kind, value1, value3) in pending {
            match kind {
                CallbackKind::ParameterChanged => {
                    let rindex = match usize::try_from(value1) {
                        Ok(index) => self
                            .context
                            .inspect(self.id, |p| p.parameter(index).map(|param| param.data.rindex))?
                            .ok_or(PluginError::InvalidParameter(value1))?,
                        Err(_) => value1,
                    };
                    self.send(BridgeMessage::Control {
                        rindex,
                        value: value3 as f32,
                    });
                }
                CallbackKind::ProgramChanged => {
                    self.send(BridgeMessage::Program(value1));
                    self.send_parameter_values()?;
                }
                CallbackKind::MidiProgramChanged => {
                    let program = self.context.inspect(self.id, |p| {
                        usize::try_from(value1)
                            .ok()
                            .and_then(|i| p.midi_programs().data.get(i))
                            .map(|m| (m.bank as i32, m.program as i32))
                    })?;
                    if let Some((bank, program)) = program {
                        self.send(BridgeMessage::MidiProgram { bank, program });
                    }
                    self.send_parameter_values()?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl ToolkitHandler for PluginAdapter {
    fn handle(&mut self, msg: ToolkitMessage) -> Result<()> {
        let id = self.id;
        match msg {
            ToolkitMessage::Update(url) => {
                (self.host, self.host_path) = parse_url(&url)?;
                self.describe()?;
            }
            ToolkitMessage::Parameter { rindex, value } => {
                self.context.with_plugin(id, |p, o| {
                    p.set_parameter_value_by_rindex(rindex, value, false, false, false, o)
                })?;
            }
            ToolkitMessage::Program(index) => {
                self.context
                    .with_plugin(id, |p, o| p.set_program(index, false, false, false, o))?;
                self.send_parameter_values()?;
            }
            ToolkitMessage::MidiProgram { bank, program } => {
                self.context.with_plugin(id, |p, o| {
                    let index = p
                        .midi_programs()
                        .find(bank.max(0) as u32, program.max(0) as u32)
                        .ok_or(PluginError::InvalidProgram(program))?;
                    p.set_midi_program(index as i32, false, false, false, o)
                })?;
                self.send_parameter_values()?;
            }
            ToolkitMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                self.context.with_plugin(id, |p, o| {
                    p.send_midi_single_note(channel, note, velocity, false, false, false, o)
                })?;
            }
            ToolkitMessage::NoteOff { channel, note } => {
                self.context
                    .with_plugin(id, |p, o| p.send_midi_single_note(channel, note, 0, false, false, false, o))?;
            }
            ToolkitMessage::ShowGui(show) => self.context.show_gui(id, show)?,
            ToolkitMessage::ResizeGui { width, height } => {
                tracing::debug!("resize to {width}x{height} ignored");
            }
            ToolkitMessage::Configure { key, value } => {
                self.context
                    .with_plugin(id, |p, _| p.set_custom_data(CustomDataType::String, &key, &value, false))?;
            }
            ToolkitMessage::Chunk(data) => {
                self.context.set_chunk_data(id, &data)?;
                self.send_parameter_values()?;
            }
            ToolkitMessage::SaveNow => self.save_now()?,
            ToolkitMessage::Quit => {}
        }
        Ok(())
    }

    fn idle(&mut self) -> ControlFlow<()> {
        self.context.idle();
        self.run_blocks();
        if let Err(e) = self.forward_notifications() {
            tracing::warn!("forwarding plugin changes failed: {e}");
        }
        self.send_peaks();
        ControlFlow::Continue(())
    }

    fn quit(&mut self) {
        self.send(BridgeMessage::Exiting);
        self.context.remove_all();
        self.server.shutdown();
        tracing::info!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_plugin::protocol::plugin_path;
    use std::net::UdpSocket;

    struct FakeHost {
        socket: UdpSocket,
        url: String,
    }

    impl FakeHost {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let url = plinth_plugin::transport::make_url(socket.local_addr().unwrap(), &plugin_path(4));
            Self { socket, url }
        }

        fn recv(&self) -> (String, BridgeMessage) {
            let mut buf = vec![0u8; 65536];
            let (len, _) = self.socket.recv_from(&mut buf).unwrap();
            plinth_plugin::protocol::decode_datagram(&buf[..len])
                .unwrap()
                .remove(0)
        }
    }

    fn adapter(host: &FakeHost, label: &str) -> PluginAdapter {
        PluginAdapter::new(
            &host.url,
            LoadRequest::internal(label),
            HostOptions::default(),
            Arc::new(ToolkitQueue::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_start_announces_url() {
        let host = FakeHost::new();
        let adapter = adapter(&host, "gain");
        adapter.start();
        let (prefix, msg) = host.recv();
        assert_eq!(prefix, plugin_path(4));
        assert_eq!(msg, BridgeMessage::BridgeUpdate(adapter.url().to_string()));
    }

    #[test]
    fn test_update_dumps_description() {
        let host = FakeHost::new();
        let mut adapter = adapter(&host, "gain");
        adapter.handle(ToolkitMessage::Update(host.url.clone())).unwrap();

        let mut methods = Vec::new();
        loop {
            let (_, msg) = host.recv();
            let done = matches!(msg, BridgeMessage::BridgeUpdate(_));
            methods.push(msg.method());
            if done {
                break;
            }
        }
        assert_eq!(methods[0], "bridge_plugin_info");
        assert!(methods.contains(&"bridge_param_ranges"));
        assert_eq!(methods.last(), Some(&"bridge_update"));
    }

    #[test]
    fn test_update_reports_current_selection_and_values() {
        let host = FakeHost::new();
        let mut adapter = adapter(&host, "sine");
        adapter.handle(ToolkitMessage::Program(1)).unwrap();
        adapter
            .handle(ToolkitMessage::Parameter { rindex: 0, value: 0.6 })
            .unwrap();
        adapter.handle(ToolkitMessage::Update(host.url.clone())).unwrap();

        // Skip the values sent for the program change.
        let mut dump = Vec::new();
        loop {
            let (_, msg) = host.recv();
            if dump.is_empty() && !matches!(msg, BridgeMessage::PluginInfo { .. }) {
                continue;
            }
            let done = matches!(msg, BridgeMessage::BridgeUpdate(_));
            dump.push(msg);
            if done {
                break;
            }
        }

        let program_at = dump.iter().position(|m| *m == BridgeMessage::Program(1));
        let control_at = dump.iter().position(|m| matches!(m, BridgeMessage::Control { .. }));
        assert!(program_at.is_some(), "no current program in {dump:?}");
        assert!(program_at < control_at);

        let values: Vec<(i32, f32)> = dump
            .iter()
            .filter_map(|m| match m {
                BridgeMessage::Control { rindex, value } => Some((*rindex, *value)),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![(0, 0.6)]);
        assert!(dump.contains(&BridgeMessage::BridgeChunk(0.6f32.to_le_bytes().to_vec())));
    }

    #[test]
    fn test_program_change_reports_values() {
        let host = FakeHost::new();
        let mut adapter = adapter(&host, "sine");
        adapter.handle(ToolkitMessage::Program(1)).unwrap();
        assert_eq!(adapter.context().current_program(adapter.plugin_id()).unwrap(), 1);

        let (_, msg) = host.recv();
        assert!(matches!(msg, BridgeMessage::Control { .. }));
    }

    #[test]
    fn test_parameter_edit_applies_silently() {
        let host = FakeHost::new();
        let mut adapter = adapter(&host, "gain");
        adapter
            .handle(ToolkitMessage::Parameter { rindex: 0, value: 1.5 })
            .unwrap();
        assert_eq!(adapter.context().parameter_value(adapter.plugin_id(), 0).unwrap(), 1.5);
        assert!(adapter.notifications.try_recv().is_err());
    }

    #[test]
    fn test_unknown_parameter_is_an_error() {
        let host = FakeHost::new();
        let mut adapter = adapter(&host, "gain");
        assert!(adapter
            .handle(ToolkitMessage::Parameter { rindex: 9, value: 0.0 })
            .is_err());
    }
}
