//! Plugin descriptor model shared by the host, the backends and the bridges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PluginError;

/// Index into the host's fixed-capacity plugin table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(pub u16);

impl PluginId {
    pub const INVALID: PluginId = PluginId(u16::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hint_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn from_bits_truncate(bits: u32) -> Self {
                Self(bits & (0 $(| $bit)*))
            }

            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut list = f.debug_set();
                $(if self.contains(Self::$flag) {
                    list.entry(&stringify!($flag));
                })*
                list.finish()
            }
        }
    };
}

hint_flags! {
    /// Capability flags of a loaded plugin, recomputed on every reload.
    PluginHints {
        HAS_GUI = 0x001,
        IS_BRIDGE = 0x002,
        IS_SYNTH = 0x004,
        USES_CHUNKS = 0x008,
        CAN_DRYWET = 0x010,
        CAN_VOLUME = 0x020,
        CAN_BALANCE = 0x040,
    }
}

hint_flags! {
    ParameterHints {
        ENABLED = 0x01,
        AUTOMABLE = 0x02,
        BOOLEAN = 0x04,
        INTEGER = 0x08,
        LOGARITHMIC = 0x10,
        USES_SAMPLERATE = 0x20,
        STRICT_BOUNDS = 0x40,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginType {
    Ladspa,
    Dssi,
    Lv2,
    Vst,
    Sf2,
    Internal,
}

impl PluginType {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginType::Ladspa => "LADSPA",
            PluginType::Dssi => "DSSI",
            PluginType::Lv2 => "LV2",
            PluginType::Vst => "VST",
            PluginType::Sf2 => "SF2",
            PluginType::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LADSPA" => Ok(PluginType::Ladspa),
            "DSSI" => Ok(PluginType::Dssi),
            "LV2" => Ok(PluginType::Lv2),
            "VST" => Ok(PluginType::Vst),
            "SF2" => Ok(PluginType::Sf2),
            "INTERNAL" => Ok(PluginType::Internal),
            other => Err(PluginError::Config(format!("unknown plugin type '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginCategory {
    #[default]
    None,
    Synth,
    Delay,
    Eq,
    Filter,
    Dynamics,
    Modulator,
    Utility,
    Other,
}

impl PluginCategory {
    pub fn to_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => PluginCategory::Synth,
            2 => PluginCategory::Delay,
            3 => PluginCategory::Eq,
            4 => PluginCategory::Filter,
            5 => PluginCategory::Dynamics,
            6 => PluginCategory::Modulator,
            7 => PluginCategory::Utility,
            8 => PluginCategory::Other,
            _ => PluginCategory::None,
        }
    }
}

/// Static identity of a plugin, as reported by its backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub category: PluginCategory,
    pub name: String,
    pub label: String,
    pub maker: String,
    pub copyright: String,
    pub unique_id: i64,
}

impl PluginInfo {
    pub fn new(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn maker(mut self, maker: impl Into<String>) -> Self {
        self.maker = maker.into();
        self
    }

    pub fn copyright(mut self, copyright: impl Into<String>) -> Self {
        self.copyright = copyright.into();
        self
    }

    pub fn category(mut self, category: PluginCategory) -> Self {
        self.category = category;
        self
    }

    pub fn unique_id(mut self, id: i64) -> Self {
        self.unique_id = id;
        self
    }
}

/// Logical port index to backend-native index ("rindex") mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortGroup {
    pub rindices: Vec<u32>,
}

impl PortGroup {
    pub fn new(rindices: Vec<u32>) -> Self {
        Self { rindices }
    }

    /// A group whose rindices equal its logical indices.
    pub fn sequential(count: usize) -> Self {
        Self {
            rindices: (0..count as u32).collect(),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.rindices.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterDirection {
    #[default]
    Unknown,
    Input,
    Output,
    Internal,
}

impl ParameterDirection {
    pub fn to_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ParameterDirection::Input,
            2 => ParameterDirection::Output,
            3 => ParameterDirection::Internal,
            _ => ParameterDirection::Unknown,
        }
    }
}

/// Reserved rindices of the host-side parameters every instance carries.
pub mod internal_param {
    pub const NULL: i32 = -1;
    pub const ACTIVE: i32 = -2;
    pub const DRYWET: i32 = -3;
    pub const VOLUME: i32 = -4;
    pub const BALANCE_LEFT: i32 = -5;
    pub const BALANCE_RIGHT: i32 = -6;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterData {
    pub direction: ParameterDirection,
    pub index: i32,
    pub rindex: i32,
    pub hints: ParameterHints,
    pub midi_channel: u8,
    /// -1 when unmapped.
    pub midi_cc: i16,
}

impl ParameterData {
    pub fn input(index: i32, rindex: i32) -> Self {
        Self {
            direction: ParameterDirection::Input,
            index,
            rindex,
            hints: ParameterHints::ENABLED | ParameterHints::AUTOMABLE,
            midi_channel: 0,
            midi_cc: -1,
        }
    }

    pub fn output(index: i32, rindex: i32) -> Self {
        Self {
            direction: ParameterDirection::Output,
            index,
            rindex,
            hints: ParameterHints::ENABLED,
            midi_channel: 0,
            midi_cc: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub def: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

impl Default for ParameterRanges {
    fn default() -> Self {
        Self {
            def: 0.0,
            min: 0.0,
            max: 1.0,
            step: 0.01,
            step_small: 0.0001,
            step_large: 0.1,
        }
    }
}

impl ParameterRanges {
    pub fn new(def: f32, min: f32, max: f32) -> Self {
        let range = max - min;
        Self {
            def,
            min,
            max,
            step: range / 100.0,
            step_small: range / 1000.0,
            step_large: range / 10.0,
        }
        .fixed()
    }

    /// Repairs misreported bounds: swaps inverted limits, widens an empty
    /// range and pulls the default inside.
    pub fn fixed(mut self) -> Self {
        if !self.min.is_finite() {
            self.min = 0.0;
        }
        if !self.max.is_finite() {
            self.max = self.min + 1.0;
        }
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if self.max - self.min <= f32::EPSILON * self.min.abs().max(1.0) {
            self.max = self.min + 0.1;
        }
        if !self.def.is_finite() {
            self.def = self.min;
        }
        self.def = self.clamp(self.def);
        self
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.def.clamp(self.min, self.max);
        }
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        ((self.clamp(value) - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }

    #[inline]
    pub fn unnormalize(&self, normalized: f32) -> f32 {
        self.min + (self.max - self.min) * normalized.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub symbol: String,
    pub unit: String,
}

impl ParameterInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// One exposed parameter: its mapping, its bounds and its current value.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub data: ParameterData,
    pub ranges: ParameterRanges,
    pub info: ParameterInfo,
    pub value: f32,
}

impl Parameter {
    pub fn new(data: ParameterData, ranges: ParameterRanges, info: ParameterInfo) -> Self {
        let ranges = ranges.fixed();
        Self {
            data,
            ranges,
            info,
            value: ranges.def,
        }
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.data.direction == ParameterDirection::Input
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramTable {
    pub names: Vec<String>,
    /// -1 when no program is selected.
    pub current: i32,
}

impl Default for ProgramTable {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            current: -1,
        }
    }
}

impl ProgramTable {
    #[inline]
    pub fn count(&self) -> usize {
        self.names.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiProgramData {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

impl MidiProgramData {
    pub fn new(bank: u32, program: u32, name: impl Into<String>) -> Self {
        Self {
            bank,
            program,
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiProgramTable {
    pub data: Vec<MidiProgramData>,
    pub current: i32,
}

impl Default for MidiProgramTable {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            current: -1,
        }
    }
}

impl MidiProgramTable {
    #[inline]
    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn find(&self, bank: u32, program: u32) -> Option<usize> {
        self.data
            .iter()
            .position(|p| p.bank == bank && p.program == program)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomDataType {
    String,
    Path,
    Chunk,
    Binary,
}

impl CustomDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            CustomDataType::String => "string",
            CustomDataType::Path => "path",
            CustomDataType::Chunk => "chunk",
            CustomDataType::Binary => "binary",
        }
    }
}

impl FromStr for CustomDataType {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(CustomDataType::String),
            "path" => Ok(CustomDataType::Path),
            "chunk" => Ok(CustomDataType::Chunk),
            "binary" => Ok(CustomDataType::Binary),
            other => Err(PluginError::Protocol(format!("unknown custom data type '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomData {
    pub kind: CustomDataType,
    pub key: String,
    pub value: String,
}

/// Key prefixes that carry protocol traffic rather than plugin state.
pub const INTERNAL_KEY_PREFIXES: &[&str] = &["DSSI:", "plinth:"];

pub fn is_internal_key(key: &str) -> bool {
    INTERNAL_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
}
