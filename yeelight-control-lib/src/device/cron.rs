use serde_json::Value;

use crate::error::{Error, Result};

/// Delayed jobs a device can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronType {
    /// Turns the light off after `delay` minutes.
    PowerOff,
}

impl CronType {
    pub fn wire_value(self) -> i64 {
        match self {
            CronType::PowerOff => 0,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(CronType::PowerOff),
            _ => None,
        }
    }
}

impl From<CronType> for Value {
    fn from(kind: CronType) -> Self {
        Value::from(kind.wire_value())
    }
}

/// A scheduled job as reported by `cron_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cron {
    /// `None` when the device has no job scheduled.
    pub kind: Option<CronType>,
    pub delay: i32,
    pub mix: i32,
}

impl Cron {
    /// Reported when the device returns an empty result.
    pub const NONE: Cron = Cron {
        kind: None,
        delay: 0,
        mix: 0,
    };

    pub fn new(kind: CronType, delay: i32) -> Self {
        Cron {
            kind: Some(kind),
            delay,
            mix: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind.is_none()
    }

    /// Decodes one entry of a `cron_get` result, e.g. `{"type": 0, "delay": 15, "mix": 0}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::MalformedReply(format!("cron entry without `{}`: {}", name, value)))
        };
        let kind = field("type")?;
        let kind = CronType::from_wire(kind)
            .ok_or_else(|| Error::MalformedReply(format!("unknown cron type {}", kind)))?;
        Ok(Cron {
            kind: Some(kind),
            delay: field("delay")? as i32,
            // older firmware leaves `mix` out
            mix: value.get("mix").and_then(Value::as_i64).unwrap_or(0) as i32,
        })
    }
}
