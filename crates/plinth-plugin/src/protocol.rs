//! OSC messages exchanged between the host, bridge processes and control clients.
//!
//! Every entity owns a path prefix (`/plinth/<id>`); a message travels as
//! `<prefix>/<method>` with the typed arguments below.

use rosc::{OscMessage, OscMidiMessage, OscPacket, OscType};

use crate::error::{PluginError, Result};

/// Path prefix of the host itself.
pub const HOST_PATH: &str = "/plinth";

pub fn plugin_path(id: u16) -> String {
    format!("{HOST_PATH}/{id}")
}

/// Splits `/plinth/3/control` into (`/plinth/3`, `control`).
pub fn split_address(addr: &str) -> Option<(&str, &str)> {
    let (prefix, method) = addr.rsplit_once('/')?;
    if method.is_empty() {
        return None;
    }
    Some((prefix, method))
}

/// Plugin id carried by a `/plinth/<id>` prefix.
pub fn plugin_id_from_path(prefix: &str) -> Option<u16> {
    prefix
        .strip_prefix(HOST_PATH)?
        .strip_prefix('/')?
        .parse()
        .ok()
}

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeMessage {
    Control { rindex: i32, value: f32 },
    Program(i32),
    MidiProgram { bank: i32, program: i32 },
    Midi([u8; 4]),
    Configure { key: String, value: String },
    Show,
    Hide,
    Quit,
    Update(String),
    Exiting,
    Register(String),
    Unregister,
    Chunk(Vec<u8>),
    SaveNow,

    PluginInfo {
        category: i32,
        hints: i32,
        name: String,
        label: String,
        maker: String,
        copyright: String,
        unique_id: i64,
    },
    AudioCount { ins: i32, outs: i32, total: i32 },
    MidiCount { ins: i32, outs: i32, total: i32 },
    ParamCount { ins: i32, outs: i32, total: i32 },
    ParamInfo { index: i32, name: String, unit: String },
    ParamData {
        direction: i32,
        index: i32,
        rindex: i32,
        hints: i32,
        midi_channel: i32,
        midi_cc: i32,
    },
    ParamRanges {
        index: i32,
        def: f32,
        min: f32,
        max: f32,
        step: f32,
        step_small: f32,
        step_large: f32,
    },
    ProgramCount(i32),
    ProgramInfo { index: i32, name: String },
    MidiProgramCount(i32),
    MidiProgramInfo { index: i32, bank: i32, program: i32, name: String },
    CustomData { kind: String, key: String, value: String },
    BridgeChunk(Vec<u8>),
    InputPeak { left: f32, right: f32 },
    OutputPeak { left: f32, right: f32 },
    BridgeUpdate(String),
}

impl BridgeMessage {
    pub fn method(&self) -> &'static str {
        match self {
            BridgeMessage::Control { .. } => "control",
            BridgeMessage::Program(_) => "program",
            BridgeMessage::MidiProgram { .. } => "midi_program",
            BridgeMessage::Midi(_) => "midi",
            BridgeMessage::Configure { .. } => "configure",
            BridgeMessage::Show => "show",
            BridgeMessage::Hide => "hide",
            BridgeMessage::Quit => "quit",
            BridgeMessage::Update(_) => "update",
            BridgeMessage::Exiting => "exiting",
            BridgeMessage::Register(_) => "register",
            BridgeMessage::Unregister => "unregister",
            BridgeMessage::Chunk(_) => "chunk",
            BridgeMessage::SaveNow => "save_now",
            BridgeMessage::PluginInfo { .. } => "bridge_plugin_info",
            BridgeMessage::AudioCount { .. } => "bridge_audio_count",
            BridgeMessage::MidiCount { .. } => "bridge_midi_count",
            BridgeMessage::ParamCount { .. } => "bridge_param_count",
            BridgeMessage::ParamInfo { .. } => "bridge_param_info",
            BridgeMessage::ParamData { .. } => "bridge_param_data",
            BridgeMessage::ParamRanges { .. } => "bridge_param_ranges",
            BridgeMessage::ProgramCount(_) => "bridge_program_count",
            BridgeMessage::ProgramInfo { .. } => "bridge_program_info",
            BridgeMessage::MidiProgramCount(_) => "bridge_midi_program_count",
            BridgeMessage::MidiProgramInfo { .. } => "bridge_midi_program_info",
            BridgeMessage::CustomData { .. } => "bridge_custom_data",
            BridgeMessage::BridgeChunk(_) => "bridge_chunk",
            BridgeMessage::InputPeak { .. } => "bridge_input_peak",
            BridgeMessage::OutputPeak { .. } => "bridge_output_peak",
            BridgeMessage::BridgeUpdate(_) => "bridge_update",
        }
    }

    /// Messages only a plugin bridge sends back to the host.
    pub fn is_bridge_report(&self) -> bool {
        self.method().starts_with("bridge_")
    }

    pub fn args(&self) -> Vec<OscType> {
        use OscType::{Blob, Float, Int, Long, String as Str};

        match self {
            BridgeMessage::Control { rindex, value } => vec![Int(*rindex), Float(*value)],
            BridgeMessage::Program(index) => vec![Int(*index)],
            BridgeMessage::MidiProgram { bank, program } => vec![Int(*bank), Int(*program)],
            BridgeMessage::Midi(data) => vec![OscType::Midi(OscMidiMessage {
                port: data[0],
                status: data[1],
                data1: data[2],
                data2: data[3],
            })],
            BridgeMessage::Configure { key, value } => vec![Str(key.clone()), Str(value.clone())],
            BridgeMessage::Show
            | BridgeMessage::Hide
            | BridgeMessage::Quit
            | BridgeMessage::Exiting
            | BridgeMessage::Unregister
            | BridgeMessage::SaveNow => Vec::new(),
            BridgeMessage::Update(url)
            | BridgeMessage::Register(url)
            | BridgeMessage::BridgeUpdate(url) => vec![Str(url.clone())],
            BridgeMessage::Chunk(data) | BridgeMessage::BridgeChunk(data) => vec![Blob(frame_blob(data))],
            BridgeMessage::PluginInfo {
                category,
                hints,
                name,
                label,
                maker,
                copyright,
                unique_id,
            } => vec![
                Int(*category),
                Int(*hints),
                Str(name.clone()),
                Str(label.clone()),
                Str(maker.clone()),
                Str(copyright.clone()),
                Long(*unique_id),
            ],
            BridgeMessage::AudioCount { ins, outs, total }
            | BridgeMessage::MidiCount { ins, outs, total }
            | BridgeMessage::ParamCount { ins, outs, total } => {
                vec![Int(*ins), Int(*outs), Int(*total)]
            }
            BridgeMessage::ParamInfo { index, name, unit } => {
                vec![Int(*index), Str(name.clone()), Str(unit.clone())]
            }
            BridgeMessage::ParamData {
                direction,
                index,
                rindex,
                hints,
                midi_channel,
                midi_cc,
            } => vec![
                Int(*direction),
                Int(*index),
                Int(*rindex),
                Int(*hints),
                Int(*midi_channel),
                Int(*midi_cc),
            ],
            BridgeMessage::ParamRanges {
                index,
                def,
                min,
                max,
                step,
                step_small,
                step_large,
            } => vec![
                Int(*index),
                Float(*def),
                Float(*min),
                Float(*max),
                Float(*step),
                Float(*step_small),
                Float(*step_large),
            ],
            BridgeMessage::ProgramCount(count) | BridgeMessage::MidiProgramCount(count) => {
                vec![Int(*count)]
            }
            BridgeMessage::ProgramInfo { index, name } => vec![Int(*index), Str(name.clone())],
            BridgeMessage::MidiProgramInfo {
                index,
                bank,
                program,
                name,
            } => vec![Int(*index), Int(*bank), Int(*program), Str(name.clone())],
            BridgeMessage::CustomData { kind, key, value } => {
                vec![Str(kind.clone()), Str(key.clone()), Str(value.clone())]
            }
            BridgeMessage::InputPeak { left, right } | BridgeMessage::OutputPeak { left, right } => {
                vec![Float(*left), Float(*right)]
            }
        }
    }

    pub fn decode(method: &str, args: &[OscType]) -> Result<Self> {
        let mut a = Args { method, args, pos: 0 };

        let msg = match method {
            "control" => BridgeMessage::Control {
                rindex: a.int()?,
                value: a.float()?,
            },
            "program" => BridgeMessage::Program(a.int()?),
            "midi_program" => BridgeMessage::MidiProgram {
                bank: a.int()?,
                program: a.int()?,
            },
            "midi" => BridgeMessage::Midi(a.midi()?),
            "configure" => BridgeMessage::Configure {
                key: a.string()?,
                value: a.string()?,
            },
            "show" => BridgeMessage::Show,
            "hide" => BridgeMessage::Hide,
            "quit" => BridgeMessage::Quit,
            "update" => BridgeMessage::Update(a.string()?),
            "exiting" => BridgeMessage::Exiting,
            "register" => BridgeMessage::Register(a.string()?),
            "unregister" => BridgeMessage::Unregister,
            "chunk" => BridgeMessage::Chunk(a.blob()?),
            "save_now" => BridgeMessage::SaveNow,
            "bridge_plugin_info" => BridgeMessage::PluginInfo {
                category: a.int()?,
                hints: a.int()?,
                name: a.string()?,
                label: a.string()?,
                maker: a.string()?,
                copyright: a.string()?,
                unique_id: a.long()?,
            },
            "bridge_audio_count" => BridgeMessage::AudioCount {
                ins: a.int()?,
                outs: a.int()?,
                total: a.int()?,
            },
            "bridge_midi_count" => BridgeMessage::MidiCount {
                ins: a.int()?,
                outs: a.int()?,
                total: a.int()?,
            },
            "bridge_param_count" => BridgeMessage::ParamCount {
                ins: a.int()?,
                outs: a.int()?,
                total: a.int()?,
            },
            "bridge_param_info" => BridgeMessage::ParamInfo {
                index: a.int()?,
                name: a.string()?,
                unit: a.string()?,
            },
            "bridge_param_data" => BridgeMessage::ParamData {
                direction: a.int()?,
                index: a.int()?,
                rindex: a.int()?,
                hints: a.int()?,
                midi_channel: a.int()?,
                midi_cc: a.int()?,
            },
            "bridge_param_ranges" => BridgeMessage::ParamRanges {
                index: a.int()?,
                def: a.float()?,
                min: a.float()?,
                max: a.float()?,
                step: a.float()?,
                step_small: a.float()?,
                step_large: a.float()?,
            },
            "bridge_program_count" => BridgeMessage::ProgramCount(a.int()?),
            "bridge_program_info" => BridgeMessage::ProgramInfo {
                index: a.int()?,
                name: a.string()?,
            },
            "bridge_midi_program_count" => BridgeMessage::MidiProgramCount(a.int()?),
            "bridge_midi_program_info" => BridgeMessage::MidiProgramInfo {
                index: a.int()?,
                bank: a.int()?,
                program: a.int()?,
                name: a.string()?,
            },
            "bridge_custom_data" => BridgeMessage::CustomData {
                kind: a.string()?,
                key: a.string()?,
                value: a.string()?,
            },
            "bridge_chunk" => BridgeMessage::BridgeChunk(a.blob()?),
            "bridge_input_peak" => BridgeMessage::InputPeak {
                left: a.float()?,
                right: a.float()?,
            },
            "bridge_output_peak" => BridgeMessage::OutputPeak {
                left: a.float()?,
                right: a.float()?,
            },
            "bridge_update" => BridgeMessage::BridgeUpdate(a.string()?),
            other => {
                return Err(PluginError::Protocol(format!("unknown method '{other}'")));
            }
        };
        Ok(msg)
    }

    pub fn to_packet(&self, prefix: &str) -> OscPacket {
        OscPacket::Message(OscMessage {
            addr: format!("{prefix}/{}", self.method()),
            args: self.args(),
        })
    }

    pub fn encode(&self, prefix: &str) -> Result<Vec<u8>> {
        rosc::encoder::encode(&self.to_packet(prefix))
            .map_err(|e| PluginError::Protocol(format!("encode failed: {e:?}")))
    }
}

/// Decodes one datagram into `(prefix, message)` pairs. Bundles are flattened.
pub fn decode_datagram(buf: &[u8]) -> Result<Vec<(String, BridgeMessage)>> {
    let (_, packet) = rosc::decoder::decode_udp(buf)
        .map_err(|e| PluginError::Protocol(format!("malformed packet: {e:?}")))?;
    let mut out = Vec::new();
    flatten(packet, &mut out)?;
    Ok(out)
}

fn flatten(packet: OscPacket, out: &mut Vec<(String, BridgeMessage)>) -> Result<()> {
    match packet {
        OscPacket::Message(msg) => {
            let (prefix, method) = split_address(&msg.addr)
                .ok_or_else(|| PluginError::Protocol(format!("bad address '{}'", msg.addr)))?;
            let decoded = BridgeMessage::decode(method, &msg.args)?;
            out.push((prefix.to_string(), decoded));
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out)?;
            }
        }
    }
    Ok(())
}

struct Args<'a> {
    method: &'a str,
    args: &'a [OscType],
    pos: usize,
}

impl Args<'_> {
    fn next(&mut self) -> Result<&OscType> {
        let arg = self.args.get(self.pos).ok_or_else(|| {
            PluginError::Protocol(format!("'{}' is missing argument {}", self.method, self.pos))
        })?;
        self.pos += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: &str) -> PluginError {
        PluginError::Protocol(format!(
            "'{}' argument {} should be {expected}",
            self.method,
            self.pos - 1
        ))
    }

    fn int(&mut self) -> Result<i32> {
        match *self.next()? {
            OscType::Int(v) => Ok(v),
            OscType::Long(v) => i32::try_from(v).map_err(|_| self.mismatch("int")),
            _ => Err(self.mismatch("int")),
        }
    }

    fn long(&mut self) -> Result<i64> {
        match *self.next()? {
            OscType::Long(v) => Ok(v),
            OscType::Int(v) => Ok(v as i64),
            _ => Err(self.mismatch("long")),
        }
    }

    fn float(&mut self) -> Result<f32> {
        match *self.next()? {
            OscType::Float(v) => Ok(v),
            OscType::Double(v) => Ok(v as f32),
            OscType::Int(v) => Ok(v as f32),
            _ => Err(self.mismatch("float")),
        }
    }

    fn string(&mut self) -> Result<String> {
        match self.next()? {
            OscType::String(s) => Ok(s.clone()),
            _ => Err(self.mismatch("string")),
        }
    }

    fn blob(&mut self) -> Result<Vec<u8>> {
        match self.next()? {
            OscType::Blob(b) => unframe_blob(b),
            _ => Err(self.mismatch("blob")),
        }
    }

    fn midi(&mut self) -> Result<[u8; 4]> {
        match self.next()? {
            OscType::Midi(m) => Ok([m.port, m.status, m.data1, m.data2]),
            _ => Err(self.mismatch("midi")),
        }
    }
}

/// Pads a blob with a trailer so its wire length is never a multiple of
/// four. rosc 0.10 skips four extra bytes after an aligned blob. The last
/// byte counts the trailer bytes, itself included.
fn frame_blob(data: &[u8]) -> Vec<u8> {
    let trailer: &[u8] = if data.len() % 4 == 3 { &[0, 2] } else { &[1] };
    let mut framed = Vec::with_capacity(data.len() + trailer.len());
    framed.extend_from_slice(data);
    framed.extend_from_slice(trailer);
    framed
}

fn unframe_blob(framed: &[u8]) -> Result<Vec<u8>> {
    match framed.last() {
        Some(&(n @ (1 | 2))) if framed.len() >= n as usize => Ok(framed[..framed.len() - n as usize].to_vec()),
        _ => Err(PluginError::Protocol("blob without a valid trailer".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_wire(msg: &BridgeMessage) -> (String, BridgeMessage) {
        let bytes = msg.encode("/plinth/4").unwrap();
        let mut decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.remove(0)
    }

    #[test]
    fn test_control_on_the_wire() {
        let msg = BridgeMessage::Control {
            rindex: -3,
            value: 0.25,
        };
        let (prefix, back) = through_wire(&msg);
        assert_eq!(prefix, "/plinth/4");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_reports_keep_strings_and_blobs() {
        let info = BridgeMessage::PluginInfo {
            category: 1,
            hints: 0x0C,
            name: "Sine".into(),
            label: "sine".into(),
            maker: "plinth".into(),
            copyright: "MIT".into(),
            unique_id: 1 << 40,
        };
        assert_eq!(through_wire(&info).1, info);

        let chunk = BridgeMessage::BridgeChunk(vec![0, 1, 2, 255]);
        assert_eq!(through_wire(&chunk).1, chunk);
        assert!(chunk.is_bridge_report());
        assert!(!BridgeMessage::Quit.is_bridge_report());
    }

    #[test]
    fn test_chunks_of_every_length_cross_the_wire() {
        for len in [0usize, 1, 3, 4, 5, 7, 8, 13, 16, 64, 1023, 4096] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let chunk = BridgeMessage::Chunk(data.clone());
            assert_eq!(through_wire(&chunk).1, chunk, "chunk of {len} bytes");
            let report = BridgeMessage::BridgeChunk(data);
            assert_eq!(through_wire(&report).1, report, "bridge chunk of {len} bytes");
        }
    }

    #[test]
    fn test_float_state_chunk() {
        let floats = [0.25f32, -1.0, 440.0, 0.0];
        let data: Vec<u8> = floats.iter().flat_map(|f| f.to_le_bytes()).collect();
        assert_eq!(data.len() % 4, 0);
        let (_, back) = through_wire(&BridgeMessage::BridgeChunk(data.clone()));
        assert_eq!(back, BridgeMessage::BridgeChunk(data));
    }

    #[test]
    fn test_blob_without_trailer_is_rejected() {
        let err = BridgeMessage::decode("chunk", &[OscType::Blob(vec![9, 9, 9, 9])]);
        assert!(matches!(err, Err(PluginError::Protocol(_))));
        let err = BridgeMessage::decode("chunk", &[OscType::Blob(Vec::new())]);
        assert!(matches!(err, Err(PluginError::Protocol(_))));
    }

    #[test]
    fn test_midi_bytes() {
        let msg = BridgeMessage::Midi([0, 0x90, 60, 100]);
        assert_eq!(through_wire(&msg).1, msg);
    }

    #[test]
    fn test_wrong_argument_type_is_rejected() {
        let err = BridgeMessage::decode("control", &[OscType::String("x".into()), OscType::Float(1.0)]);
        assert!(matches!(err, Err(PluginError::Protocol(_))));

        let err = BridgeMessage::decode("program", &[]);
        assert!(matches!(err, Err(PluginError::Protocol(_))));

        let err = BridgeMessage::decode("teleport", &[]);
        assert!(matches!(err, Err(PluginError::Protocol(_))));
    }

    #[test]
    fn test_address_helpers() {
        assert_eq!(split_address("/plinth/12/control"), Some(("/plinth/12", "control")));
        assert_eq!(split_address("/plinth/"), None);
        assert_eq!(plugin_id_from_path("/plinth/12"), Some(12));
        assert_eq!(plugin_id_from_path("/plinth"), None);
        assert_eq!(plugin_id_from_path("/other/1"), None);
        assert_eq!(plugin_path(3), "/plinth/3");
    }

    #[test]
    fn test_garbage_datagram() {
        assert!(decode_datagram(&[1, 2, 3]).is_err());
    }
}
