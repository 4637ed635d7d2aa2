use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use lazy_static::lazy_static;
use serde_json::Value;

/// Methods understood by the devices.
///
/// Wire names and capability bits are listed explicitly in [`METHOD_TABLE`], so
/// reordering the variants never changes what goes over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetProp,
    SetCtAbx,
    SetRgb,
    SetHsv,
    SetBright,
    SetPower,
    Toggle,
    SetDefault,
    StartCf,
    StopCf,
    SetScene,
    CronAdd,
    CronGet,
    CronDel,
    SetAdjust,
    SetMusic,
    SetName,
    BgSetRgb,
    BgSetHsv,
    BgSetCtAbx,
    BgStartCf,
    BgStopCf,
    BgSetScene,
    BgSetDefault,
    BgSetPower,
    BgSetBright,
    BgSetAdjust,
    BgToggle,
    DevToggle,
    AdjustBright,
    AdjustCt,
    AdjustColor,
    BgAdjustBright,
    BgAdjustCt,
    BgAdjustColor,
}

/// Wire name and capability bit of every method.
pub const METHOD_TABLE: &[(Method, &str, u64)] = &[
    (Method::GetProp, "get_prop", 1),
    (Method::SetCtAbx, "set_ct_abx", 1 << 2),
    (Method::SetRgb, "set_rgb", 1 << 3),
    (Method::SetHsv, "set_hsv", 1 << 4),
    (Method::SetBright, "set_bright", 1 << 5),
    (Method::SetPower, "set_power", 1 << 6),
    (Method::Toggle, "toggle", 1 << 7),
    (Method::SetDefault, "set_default", 1 << 8),
    (Method::StartCf, "start_cf", 1 << 9),
    (Method::StopCf, "stop_cf", 1 << 10),
    (Method::SetScene, "set_scene", 1 << 11),
    (Method::CronAdd, "cron_add", 1 << 12),
    (Method::CronGet, "cron_get", 1 << 13),
    (Method::CronDel, "cron_del", 1 << 14),
    (Method::SetAdjust, "set_adjust", 1 << 15),
    (Method::SetMusic, "set_music", 1 << 16),
    (Method::SetName, "set_name", 1 << 17),
    (Method::BgSetRgb, "bg_set_rgb", 1 << 18),
    (Method::BgSetHsv, "bg_set_hsv", 1 << 19),
    (Method::BgSetCtAbx, "bg_set_ct_abx", 1 << 20),
    (Method::BgStartCf, "bg_start_cf", 1 << 21),
    (Method::BgStopCf, "bg_stop_cf", 1 << 22),
    (Method::BgSetScene, "bg_set_scene", 1 << 23),
    (Method::BgSetDefault, "bg_set_default", 1 << 24),
    (Method::BgSetPower, "bg_set_power", 1 << 25),
    (Method::BgSetBright, "bg_set_bright", 1 << 26),
    (Method::BgSetAdjust, "bg_set_adjust", 1 << 27),
    (Method::BgToggle, "bg_toggle", 1 << 28),
    (Method::DevToggle, "dev_toggle", 1 << 29),
    (Method::AdjustBright, "adjust_bright", 1 << 30),
    (Method::AdjustCt, "adjust_ct", 1 << 31),
    (Method::AdjustColor, "adjust_color", 1 << 32),
    (Method::BgAdjustBright, "bg_adjust_bright", 1 << 33),
    (Method::BgAdjustCt, "bg_adjust_ct", 1 << 34),
    (Method::BgAdjustColor, "bg_adjust_color", 1 << 35),
];

lazy_static! {
    static ref METHODS_BY_NAME: HashMap<&'static str, (Method, u64)> = METHOD_TABLE
        .iter()
        .map(|&(method, name, flag)| (name, (method, flag)))
        .collect();
}

impl Method {
    fn entry(self) -> &'static (Method, &'static str, u64) {
        // every variant has exactly one row in the table
        METHOD_TABLE
            .iter()
            .find(|(method, _, _)| *method == self)
            .unwrap_or(&METHOD_TABLE[0])
    }

    /// The name sent in the `method` field.
    pub fn name(self) -> &'static str {
        self.entry().1
    }

    /// Capability bit used by [`MethodSet`].
    pub fn flag(self) -> u64 {
        self.entry().2
    }

    pub fn from_name(name: &str) -> Option<Method> {
        METHODS_BY_NAME.get(name).map(|(method, _)| *method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::from_name(s).ok_or_else(|| anyhow!("Unknown method: {}", s))
    }
}

/// Methods a device declares support for, as a bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MethodSet(pub u64);

impl MethodSet {
    /// Parses the space separated `support` list from a discovery message.
    /// Unknown method names are skipped.
    pub fn parse(support: &str) -> Self {
        let flags = support
            .split_whitespace()
            .filter_map(|name| METHODS_BY_NAME.get(name))
            .fold(0u64, |acc, (_, flag)| acc | flag);
        MethodSet(flags)
    }

    pub fn contains(&self, method: Method) -> bool {
        self.0 & method.flag() == method.flag()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        METHOD_TABLE
            .iter()
            .filter(move |(method, _, _)| self.contains(*method))
            .map(|(method, _, _)| *method)
    }
}

impl fmt::Display for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Method::name).collect();
        write!(f, "{}", names.join(" "))
    }
}

/// Optional mode parameter of `set_power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Normal,
    ColorTemperature,
    Rgb,
    Hsv,
    ColorFlow,
    NightLight,
}

impl PowerMode {
    pub fn wire_value(self) -> i64 {
        match self {
            PowerMode::Normal => 0,
            PowerMode::ColorTemperature => 1,
            PowerMode::Rgb => 2,
            PowerMode::Hsv => 3,
            PowerMode::ColorFlow => 4,
            PowerMode::NightLight => 5,
        }
    }
}

impl From<PowerMode> for Value {
    fn from(mode: PowerMode) -> Self {
        Value::from(mode.wire_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_are_unique() {
        assert_eq!(METHODS_BY_NAME.len(), METHOD_TABLE.len());
        assert_eq!(Method::SetPower.name(), "set_power");
        assert_eq!(Method::from_name("cron_get"), Some(Method::CronGet));
        assert_eq!(Method::from_name("warp_drive"), None);
    }

    #[test]
    fn test_method_set_parses_support_list() {
        let set = MethodSet::parse("get_prop set_default set_power toggle unknown_thing");
        assert!(set.contains(Method::GetProp));
        assert!(set.contains(Method::Toggle));
        assert!(!set.contains(Method::SetRgb));
        assert_eq!(set.to_string(), "get_prop set_power toggle set_default");
    }

    #[test]
    fn test_power_mode_wire_values() {
        assert_eq!(Value::from(PowerMode::Normal), Value::from(0));
        assert_eq!(Value::from(PowerMode::NightLight), Value::from(5));
    }
}
