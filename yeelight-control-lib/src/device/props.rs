use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::Value;

/// Returned by typed getters when a property is missing.
pub const UNDEFINED_VALUE: i32 = -1;

/// How the string value of a property is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Int,
    Text,
    OnOff,
    ColorMode,
    /// Kept verbatim, e.g. flow parameters.
    Array,
}

/// Properties reported by the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Prop {
    Power,
    Bright,
    Ct,
    Rgb,
    Hue,
    Sat,
    ColorMode,
    Flowing,
    Delayoff,
    FlowParams,
    MusicOn,
    Name,
    BgPower,
    BgFlowing,
    BgFlowParams,
    BgCt,
    BgLmode,
    BgBright,
    BgRgb,
    BgHue,
    BgSat,
    NlBr,
    ActiveMode,
}

const PROP_TABLE: &[(Prop, &str, PropKind)] = &[
    (Prop::Power, "power", PropKind::OnOff),
    (Prop::Bright, "bright", PropKind::Int),
    (Prop::Ct, "ct", PropKind::Int),
    (Prop::Rgb, "rgb", PropKind::Int),
    (Prop::Hue, "hue", PropKind::Int),
    (Prop::Sat, "sat", PropKind::Int),
    (Prop::ColorMode, "color_mode", PropKind::ColorMode),
    (Prop::Flowing, "flowing", PropKind::Int),
    (Prop::Delayoff, "delayoff", PropKind::Int),
    (Prop::FlowParams, "flow_params", PropKind::Array),
    (Prop::MusicOn, "music_on", PropKind::Int),
    (Prop::Name, "name", PropKind::Text),
    (Prop::BgPower, "bg_power", PropKind::OnOff),
    (Prop::BgFlowing, "bg_flowing", PropKind::Int),
    (Prop::BgFlowParams, "bg_flow_params", PropKind::Array),
    (Prop::BgCt, "bg_ct", PropKind::Int),
    (Prop::BgLmode, "bg_lmode", PropKind::ColorMode),
    (Prop::BgBright, "bg_bright", PropKind::Int),
    (Prop::BgRgb, "bg_rgb", PropKind::Int),
    (Prop::BgHue, "bg_hue", PropKind::Int),
    (Prop::BgSat, "bg_sat", PropKind::Int),
    (Prop::NlBr, "nl_br", PropKind::Int),
    (Prop::ActiveMode, "active_mode", PropKind::Int),
];

impl Prop {
    fn entry(self) -> &'static (Prop, &'static str, PropKind) {
        PROP_TABLE
            .iter()
            .find(|(prop, _, _)| *prop == self)
            .unwrap_or(&PROP_TABLE[0])
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    pub fn kind(self) -> PropKind {
        self.entry().2
    }

    pub fn from_name(name: &str) -> Option<Prop> {
        PROP_TABLE
            .iter()
            .find(|(_, prop_name, _)| *prop_name == name)
            .map(|(prop, _, _)| *prop)
    }

    /// Every property, in table order.
    pub fn all() -> impl Iterator<Item = Prop> {
        PROP_TABLE.iter().map(|(prop, _, _)| *prop)
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<Prop> for Value {
    fn from(prop: Prop) -> Self {
        Value::from(prop.name())
    }
}

/// Color mode of `color_mode` and `bg_lmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Unknown,
    Rgb,
    ColorTemperature,
    Hsv,
}

impl ColorMode {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => ColorMode::Rgb,
            2 => ColorMode::ColorTemperature,
            3 => ColorMode::Hsv,
            _ => ColorMode::Unknown,
        }
    }

    pub fn wire_value(self) -> i32 {
        match self {
            ColorMode::Unknown => 0,
            ColorMode::Rgb => 1,
            ColorMode::ColorTemperature => 2,
            ColorMode::Hsv => 3,
        }
    }
}

/// A property value after type coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Int(i32),
    Bool(bool),
    Text(String),
    ColorMode(ColorMode),
}

impl PropValue {
    /// Coerces the raw string sent by the device into the type of `prop`.
    pub fn parse(prop: Prop, raw: &str) -> Self {
        match prop.kind() {
            PropKind::Int => PropValue::Int(raw.trim().parse().unwrap_or(UNDEFINED_VALUE)),
            PropKind::OnOff => PropValue::Bool(raw == "on"),
            PropKind::ColorMode => {
                PropValue::ColorMode(ColorMode::from_wire(raw.trim().parse().unwrap_or(0)))
            }
            PropKind::Text | PropKind::Array => PropValue::Text(raw.to_string()),
        }
    }

    /// The string form the device would send.
    pub fn to_raw(&self) -> String {
        match self {
            PropValue::Int(value) => value.to_string(),
            PropValue::Bool(on) => (if *on { "on" } else { "off" }).to_string(),
            PropValue::Text(text) => text.clone(),
            PropValue::ColorMode(mode) => mode.wire_value().to_string(),
        }
    }
}

/// Renders a JSON scalar the way the device would have written it as a string.
pub(crate) fn value_as_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Typed property storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropMap {
    values: HashMap<Prop, PropValue>,
}

impl PropMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from discovery headers; keys that are not properties are skipped.
    pub fn from_raw_map(map: &HashMap<String, String>) -> Self {
        let mut props = PropMap::new();
        for (key, value) in map {
            props.insert_raw(key, value);
        }
        props
    }

    /// Builds a map from the `params` object of a property push.
    pub fn from_json_object(object: &serde_json::Map<String, Value>) -> Self {
        let mut props = PropMap::new();
        for (key, value) in object {
            props.insert_raw(key, &value_as_raw(value));
        }
        props
    }

    /// Inserts by property name. Returns false when the name is not a known property.
    pub fn insert_raw(&mut self, key: &str, value: &str) -> bool {
        match Prop::from_name(key) {
            Some(prop) => {
                self.insert(prop, value);
                true
            }
            None => false,
        }
    }

    /// Coerces and stores a value, returning the previous one.
    pub fn insert(&mut self, prop: Prop, raw: &str) -> Option<PropValue> {
        self.values.insert(prop, PropValue::parse(prop, raw))
    }

    pub fn get(&self, prop: Prop) -> Option<&PropValue> {
        self.values.get(&prop)
    }

    /// Integer value or [`UNDEFINED_VALUE`].
    pub fn get_int(&self, prop: Prop) -> i32 {
        match self.values.get(&prop) {
            Some(PropValue::Int(value)) => *value,
            _ => UNDEFINED_VALUE,
        }
    }

    pub fn get_bool(&self, prop: Prop) -> bool {
        matches!(self.values.get(&prop), Some(PropValue::Bool(true)))
    }

    pub fn get_text(&self, prop: Prop) -> Option<&str> {
        match self.values.get(&prop) {
            Some(PropValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_color_mode(&self, prop: Prop) -> ColorMode {
        match self.values.get(&prop) {
            Some(PropValue::ColorMode(mode)) => *mode,
            _ => ColorMode::Unknown,
        }
    }

    pub fn extend(&mut self, other: &PropMap) {
        for (prop, value) in &other.values {
            self.values.insert(*prop, value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Prop, &PropValue)> {
        self.values.iter()
    }

    /// Name to raw string pairs, as the device would report them.
    pub fn to_raw_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(prop, value)| (prop.name().to_string(), value.to_raw()))
            .collect()
    }
}
