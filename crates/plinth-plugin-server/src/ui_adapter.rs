//! Child side of a plugin GUI shown out of process.
//!
//! The adapter announces itself with `update <child url>`, mirrors whatever the
//! host sends into the [`UiBackend`], and reports the edits made in the GUI.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use plinth_plugin::protocol::HOST_PATH;
use plinth_plugin::transport::parse_url;
use plinth_plugin::{BridgeMessage, OscSender, OscServer};

use crate::error::{Result, ServerError};
use crate::queue::{ToolkitHandler, ToolkitMessage, ToolkitQueue};

/// An edit made in the GUI, reported to the host.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEdit {
    Control { rindex: i32, value: f32 },
    Program(i32),
    MidiProgram { bank: i32, program: i32 },
    Configure { key: String, value: String },
    Note { channel: u8, note: u8, velocity: u8 },
}

impl UiEdit {
    fn into_message(self) -> BridgeMessage {
        match self {
            UiEdit::Control { rindex, value } => BridgeMessage::Control { rindex, value },
            UiEdit::Program(index) => BridgeMessage::Program(index),
            UiEdit::MidiProgram { bank, program } => BridgeMessage::MidiProgram { bank, program },
            UiEdit::Configure { key, value } => BridgeMessage::Configure { key, value },
            UiEdit::Note {
                channel,
                note,
                velocity,
            } => {
                let status = if velocity > 0 { 0x90 } else { 0x80 };
                BridgeMessage::Midi([0, status | (channel & 0x0F), note, velocity])
            }
        }
    }
}

/// A plugin GUI as seen by the bridge.
pub trait UiBackend {
    fn set_parameter(&mut self, rindex: i32, value: f32);

    fn set_program(&mut self, _index: i32) {}

    fn set_midi_program(&mut self, _bank: i32, _program: i32) {}

    fn configure(&mut self, _key: &str, _value: &str) {}

    fn show(&mut self) -> Result<()>;

    fn hide(&mut self);

    fn idle(&mut self) {}

    /// Moves the edits made since the last call into `out`.
    fn take_edits(&mut self, out: &mut Vec<UiEdit>);

    /// True once the user closed the GUI.
    fn is_closed(&self) -> bool {
        false
    }
}

pub struct UiAdapter {
    backend: Box<dyn UiBackend>,
    server: OscServer,
    sender: OscSender,
    url: String,
    host: SocketAddr,
    host_path: String,
    edits: Vec<UiEdit>,
}

impl UiAdapter {
    pub fn new(host_url: &str, backend: Box<dyn UiBackend>, queue: Arc<ToolkitQueue>) -> Result<Self> {
        let (host, host_path) = parse_url(host_url)?;
        let server = OscServer::bind(
            "127.0.0.1:0",
            Box::new(move |_prefix, _from, msg| queue.push_osc(msg)),
        )?;
        let url = server.url(HOST_PATH);
        Ok(Self {
            backend,
            sender: server.sender(),
            server,
            url,
            host,
            host_path,
            edits: Vec::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Announces the GUI. The host answers with the current plugin state.
    pub fn start(&self) {
        self.send(BridgeMessage::Update(self.url.clone()));
    }

    fn send(&self, msg: BridgeMessage) {
        if let Err(e) = self.sender.send(self.host, &self.host_path, &msg) {
            tracing::warn!("send '{}' to host failed: {e}", msg.method());
        }
    }
}

impl ToolkitHandler for UiAdapter {
    fn handle(&mut self, msg: ToolkitMessage) -> Result<()> {
        match msg {
            ToolkitMessage::Parameter { rindex, value } => self.backend.set_parameter(rindex, value),
            ToolkitMessage::Program(index) => self.backend.set_program(index),
            ToolkitMessage::MidiProgram { bank, program } => self.backend.set_midi_program(bank, program),
            ToolkitMessage::Configure { key, value } => self.backend.configure(&key, &value),
            ToolkitMessage::ShowGui(true) => self.backend.show()?,
            ToolkitMessage::ShowGui(false) => self.backend.hide(),
            other => tracing::debug!("GUI ignores {other:?}"),
        }
        Ok(())
    }

    fn idle(&mut self) -> ControlFlow<()> {
        self.backend.idle();
        self.backend.take_edits(&mut self.edits);
        for edit in std::mem::take(&mut self.edits) {
            self.send(edit.into_message());
        }
        if self.backend.is_closed() {
            tracing::info!("GUI closed");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn quit(&mut self) {
        self.backend.hide();
        self.send(BridgeMessage::Exiting);
        self.server.shutdown();
    }
}

// ---------------------------------------------------------------------------
// LV2 UI
// ---------------------------------------------------------------------------

const LV2_UI_IDLE_INTERFACE: &CStr = c"http://lv2plug.in/ns/extensions/ui#idleInterface";
const LV2_UI_SHOW_INTERFACE: &CStr = c"http://lv2plug.in/ns/extensions/ui#showInterface";

/// `ui:floatProtocol`, a single float written to a control port.
const PORT_PROTOCOL_FLOAT: u32 = 0;

type Lv2UiHandle = *mut c_void;

type WriteFunction = unsafe extern "C" fn(
    controller: *mut c_void,
    port_index: u32,
    buffer_size: u32,
    port_protocol: u32,
    buffer: *const c_void,
);

#[repr(C)]
struct Lv2Feature {
    uri: *const c_char,
    data: *mut c_void,
}

#[repr(C)]
struct Lv2UiDescriptor {
    uri: *const c_char,
    instantiate: Option<
        unsafe extern "C" fn(
            descriptor: *const Lv2UiDescriptor,
            plugin_uri: *const c_char,
            bundle_path: *const c_char,
            write_function: WriteFunction,
            controller: *mut c_void,
            widget: *mut *mut c_void,
            features: *const *const Lv2Feature,
        ) -> Lv2UiHandle,
    >,
    cleanup: Option<unsafe extern "C" fn(Lv2UiHandle)>,
    port_event: Option<
        unsafe extern "C" fn(handle: Lv2UiHandle, port_index: u32, buffer_size: u32, format: u32, buffer: *const c_void),
    >,
    extension_data: Option<unsafe extern "C" fn(uri: *const c_char) -> *const c_void>,
}

#[repr(C)]
struct ShowInterface {
    show: unsafe extern "C" fn(Lv2UiHandle) -> c_int,
    hide: unsafe extern "C" fn(Lv2UiHandle) -> c_int,
}

#[repr(C)]
struct IdleInterface {
    idle: unsafe extern "C" fn(Lv2UiHandle) -> c_int,
}

type DescriptorFn = unsafe extern "C" fn(index: u32) -> *const Lv2UiDescriptor;

/// Port writes collected by the write function between idle ticks.
type PortWrites = Mutex<Vec<(u32, f32)>>;

unsafe extern "C" fn write_port(
    controller: *mut c_void,
    port_index: u32,
    buffer_size: u32,
    port_protocol: u32,
    buffer: *const c_void,
) {
    if controller.is_null() || buffer.is_null() {
        return;
    }
    if port_protocol != PORT_PROTOCOL_FLOAT || buffer_size as usize != std::mem::size_of::<f32>() {
        return;
    }
    let writes = &*(controller as *const PortWrites);
    let value = *(buffer as *const f32);
    writes.lock().push((port_index, value));
}

/// An LV2 UI loaded straight from its binary through `lv2ui_descriptor`.
///
/// Only UIs that expose `ui:showInterface` can be shown without a parent
/// window; others are instantiated and idled but stay invisible.
pub struct Lv2Ui {
    descriptor: *const Lv2UiDescriptor,
    handle: Lv2UiHandle,
    show: Option<*const ShowInterface>,
    idle: Option<*const IdleInterface>,
    writes: Box<PortWrites>,
    visible: bool,
    closed: bool,
    _library: libloading::Library,
}

// The UI is only driven by the toolkit thread.
unsafe impl Send for Lv2Ui {}

impl Lv2Ui {
    pub fn load(binary: &Path, bundle: &Path, plugin_uri: &str, ui_uri: &str) -> Result<Self> {
        let library =
            unsafe { libloading::Library::new(binary) }.map_err(|e| ServerError::ui_load(binary, e.to_string()))?;
        let entry: DescriptorFn = unsafe {
            *library
                .get::<DescriptorFn>(b"lv2ui_descriptor\0")
                .map_err(|e| ServerError::ui_load(binary, e.to_string()))?
        };

        let descriptor = (0..)
            .map(|i| unsafe { entry(i) })
            .take_while(|d| !d.is_null())
            .find(|d| unsafe { !(**d).uri.is_null() && CStr::from_ptr((**d).uri).to_bytes() == ui_uri.as_bytes() })
            .ok_or_else(|| ServerError::ui_load(binary, format!("no UI '{ui_uri}'")))?;

        let writes: Box<PortWrites> = Box::new(Mutex::new(Vec::new()));
        let plugin_uri = CString::new(plugin_uri).map_err(|e| ServerError::Ui(e.to_string()))?;
        let mut bundle_path = bundle.to_string_lossy().into_owned();
        if !bundle_path.ends_with('/') {
            bundle_path.push('/');
        }
        let bundle_path = CString::new(bundle_path).map_err(|e| ServerError::Ui(e.to_string()))?;

        let idle_feature = Lv2Feature {
            uri: LV2_UI_IDLE_INTERFACE.as_ptr(),
            data: std::ptr::null_mut(),
        };
        let features: [*const Lv2Feature; 2] = [&idle_feature, std::ptr::null()];

        let desc = unsafe { &*descriptor };
        let instantiate = desc
            .instantiate
            .ok_or_else(|| ServerError::ui_load(binary, "descriptor has no instantiate"))?;
        let mut widget: *mut c_void = std::ptr::null_mut();
        let handle = unsafe {
            instantiate(
                descriptor,
                plugin_uri.as_ptr(),
                bundle_path.as_ptr(),
                write_port,
                &*writes as *const PortWrites as *mut c_void,
                &mut widget,
                features.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ServerError::ui_load(binary, "instantiate returned null"));
        }

        let extension = |uri: &CStr| {
            desc.extension_data
                .map(|f| unsafe { f(uri.as_ptr()) })
                .filter(|p| !p.is_null())
        };
        let show = extension(LV2_UI_SHOW_INTERFACE).map(|p| p as *const ShowInterface);
        let idle = extension(LV2_UI_IDLE_INTERFACE).map(|p| p as *const IdleInterface);
        tracing::info!(
            "loaded LV2 UI {ui_uri} (show: {}, idle: {})",
            show.is_some(),
            idle.is_some()
        );

        Ok(Self {
            descriptor,
            handle,
            show,
            idle,
            writes,
            visible: false,
            closed: false,
            _library: library,
        })
    }
}

impl UiBackend for Lv2Ui {
    fn set_parameter(&mut self, rindex: i32, value: f32) {
        let Ok(port) = u32::try_from(rindex) else {
            return;
        };
        if let Some(port_event) = unsafe { (*self.descriptor).port_event } {
            unsafe {
                port_event(
                    self.handle,
                    port,
                    std::mem::size_of::<f32>() as u32,
                    PORT_PROTOCOL_FLOAT,
                    (&value as *const f32).cast(),
                )
            };
        }
    }

    fn show(&mut self) -> Result<()> {
        let Some(show) = self.show else {
            return Err(ServerError::Ui("UI cannot show itself without a parent window".into()));
        };
        if unsafe { ((*show).show)(self.handle) } != 0 {
            return Err(ServerError::Ui("UI refused to show".into()));
        }
        self.visible = true;
        Ok(())
    }

    fn hide(&mut self) {
        if let (Some(show), true) = (self.show, self.visible) {
            unsafe { ((*show).hide)(self.handle) };
            self.visible = false;
        }
    }

    fn idle(&mut self) {
        if let Some(idle) = self.idle {
            // A non-zero return means the user closed the window.
            if unsafe { ((*idle).idle)(self.handle) } != 0 {
                self.closed = true;
            }
        }
    }

    fn take_edits(&mut self, out: &mut Vec<UiEdit>) {
        out.extend(self.writes.lock().drain(..).map(|(port, value)| UiEdit::Control {
            rindex: port as i32,
            value,
        }));
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Lv2Ui {
    fn drop(&mut self) {
        self.hide();
        if let Some(cleanup) = unsafe { (*self.descriptor).cleanup } {
            unsafe { cleanup(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// VST editor
// ---------------------------------------------------------------------------

#[cfg(feature = "vst")]
mod vst_ui {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use vst::editor::Editor;
    use vst::host::{Host, PluginInstance, PluginLoader};
    use vst::plugin::{Plugin, PluginParameters};

    use super::{UiBackend, UiEdit};
    use crate::error::{Result, ServerError};

    struct EditorHost {
        edits: crossbeam_channel::Sender<(i32, f32)>,
    }

    impl Host for EditorHost {
        fn automate(&self, index: i32, value: f32) {
            let _ = self.edits.try_send((index, value));
        }
    }

    /// A second instance of the VST, loaded only for its editor. Edits in the
    /// editor are reported as parameter changes of the host's instance.
    pub struct VstUi {
        params: Arc<dyn PluginParameters>,
        editor: Box<dyn Editor>,
        edits: crossbeam_channel::Receiver<(i32, f32)>,
        open: bool,
        _instance: PluginInstance,
        _host: Arc<Mutex<EditorHost>>,
    }

    impl VstUi {
        pub fn load(binary: &Path) -> Result<Self> {
            let (tx, rx) = crossbeam_channel::bounded(1024);
            let host = Arc::new(Mutex::new(EditorHost { edits: tx }));
            let mut loader =
                PluginLoader::load(binary, Arc::clone(&host)).map_err(|e| ServerError::ui_load(binary, format!("{e:?}")))?;
            let mut instance = loader
                .instance()
                .map_err(|e| ServerError::ui_load(binary, format!("{e:?}")))?;
            instance.init();
            let editor = instance
                .get_editor()
                .ok_or_else(|| ServerError::ui_load(binary, "plugin has no editor"))?;
            Ok(Self {
                params: instance.get_parameter_object(),
                editor,
                edits: rx,
                open: false,
                _instance: instance,
                _host: host,
            })
        }
    }

    impl UiBackend for VstUi {
        fn set_parameter(&mut self, rindex: i32, value: f32) {
            if rindex >= 0 {
                self.params.set_parameter(rindex, value);
            }
        }

        fn set_program(&mut self, index: i32) {
            self.params.change_preset(index);
        }

        fn show(&mut self) -> Result<()> {
            if !self.open {
                if !self.editor.open(std::ptr::null_mut()) {
                    return Err(ServerError::Ui("editor did not open".into()));
                }
                self.open = true;
            }
            Ok(())
        }

        fn hide(&mut self) {
            if self.open {
                self.editor.close();
                self.open = false;
            }
        }

        fn idle(&mut self) {
            if self.open {
                self.editor.idle();
            }
        }

        fn take_edits(&mut self, out: &mut Vec<UiEdit>) {
            out.extend(
                self.edits
                    .try_iter()
                    .filter(|(index, _)| *index >= 0)
                    .map(|(rindex, value)| UiEdit::Control { rindex, value }),
            );
        }
    }
}

#[cfg(feature = "vst")]
pub use vst_ui::VstUi;
