use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use derivative::Derivative;
use log::error;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{
    Command, Connection, ConnectionListener, ConnectionProvider, FadeEffect, Reply,
};
use crate::error::{Error, Result};

use self::cron::CronType;
use self::method::{Method, MethodSet, PowerMode};
use self::props::{Prop, PropMap};

pub mod cron;
pub mod method;
pub mod props;

pub const TEMP_MIN: u32 = 1700;
pub const TEMP_MAX: u32 = 6500;

const RGB_MASK: u32 = 0x00FF_FFFF;

/// Parses a device id, either decimal or `0x` prefixed hex.
pub fn parse_device_id(id: &str) -> Result<u64> {
    let id = id.trim();
    let parsed = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => id.parse(),
    };
    parsed.map_err(|e| Error::InvalidDiscovery(format!("invalid device id {}: {}", id, e)))
}

/// Splits `yeelight://192.168.1.5:55443` into address and port.
pub fn parse_location(location: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidDiscovery(format!("invalid location: {}", location));
    let host = location
        .split_once("//")
        .map_or(location, |(_, host)| host)
        .trim_end_matches('/');
    let (address, port) = host.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((address.to_string(), port))
}

fn lookup<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Serializable state of a [`Device`], without its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: u64,
    pub model: String,
    pub address: String,
    pub port: u16,
    pub fw_ver: i32,
    /// Space separated method names.
    pub support: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/**
A light on the local network.

A device gets its connection either explicitly through
[`Device::set_connection`] or lazily from a [`ConnectionProvider`] the first
time one is needed. The connection keeps only a weak reference back, so a
device has to be held in an `Arc` to receive updates.

Command builders return the command unsent; pass it to [`Device::send`] or to
the connection.
 */
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Device {
    id: u64,
    model: String,
    address: String,
    port: u16,
    fw_ver: i32,
    support: MethodSet,
    props: RwLock<PropMap>,
    default_effect: RwLock<FadeEffect>,
    #[derivative(Debug = "ignore")]
    provider: RwLock<Option<Arc<dyn ConnectionProvider>>>,
    #[derivative(Debug = "ignore")]
    connection: RwLock<Option<Arc<dyn Connection>>>,
}

impl Device {
    /// Device with no known properties or capabilities.
    pub fn new(id: u64, model: &str, address: &str, port: u16) -> Self {
        Self::with_details(id, model, address, port, 0, MethodSet::default(), PropMap::new())
    }

    pub fn with_details(
        id: u64,
        model: &str,
        address: &str,
        port: u16,
        fw_ver: i32,
        support: MethodSet,
        props: PropMap,
    ) -> Self {
        Device {
            id,
            model: model.to_string(),
            address: address.to_string(),
            port,
            fw_ver,
            support,
            props: RwLock::new(props),
            default_effect: RwLock::new(FadeEffect::DEFAULT),
            provider: RwLock::new(None),
            connection: RwLock::new(None),
        }
    }

    /// Builds a device from the headers of a discovery response or announcement.
    pub fn from_discovery_map(map: &HashMap<String, String>) -> Result<Self> {
        let id = lookup(map, "id")
            .ok_or_else(|| Error::InvalidDiscovery("missing id".to_string()))
            .and_then(parse_device_id)?;
        let location = lookup(map, "Location")
            .ok_or_else(|| Error::InvalidDiscovery("missing Location".to_string()))?;
        let (address, port) = parse_location(location)?;
        let fw_ver = lookup(map, "fw_ver")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(props::UNDEFINED_VALUE);
        Ok(Self::with_details(
            id,
            lookup(map, "model").unwrap_or_default(),
            &address,
            port,
            fw_ver,
            MethodSet::parse(lookup(map, "support").unwrap_or_default()),
            PropMap::from_raw_map(map),
        ))
    }

    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        let mut props = PropMap::new();
        for (key, value) in &snapshot.props {
            props.insert_raw(key, value);
        }
        Self::with_details(
            snapshot.id,
            &snapshot.model,
            &snapshot.address,
            snapshot.port,
            snapshot.fw_ver,
            MethodSet::parse(&snapshot.support),
            props,
        )
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            model: self.model.clone(),
            address: self.address.clone(),
            port: self.port,
            fw_ver: self.fw_ver,
            support: self.support.to_string(),
            props: self.props.read().to_raw_map(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fw_ver(&self) -> i32 {
        self.fw_ver
    }

    pub fn supported_methods(&self) -> MethodSet {
        self.support
    }

    pub fn supports(&self, method: Method) -> bool {
        self.support.contains(method)
    }

    /// Copy of the last known properties.
    pub fn props(&self) -> PropMap {
        self.props.read().clone()
    }

    /// Merges properties, e.g. from a newer announcement. Returns false if nothing changed.
    pub fn update_props(&self, props: &PropMap) -> bool {
        let mut current = self.props.write();
        let changed = props.iter().any(|(prop, value)| current.get(*prop) != Some(value));
        if changed {
            current.extend(props);
        }
        changed
    }

    pub fn default_effect(&self) -> FadeEffect {
        *self.default_effect.read()
    }

    pub fn set_default_effect(&self, effect: FadeEffect) {
        *self.default_effect.write() = effect;
    }

    pub fn set_connection_provider(&self, provider: Option<Arc<dyn ConnectionProvider>>) {
        *self.provider.write() = provider;
    }

    pub fn connection_provider(&self) -> Option<Arc<dyn ConnectionProvider>> {
        self.provider.read().clone()
    }

    /// Uses `connection` from now on and binds this device to it.
    pub fn set_connection(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<()> {
        connection.set_device(Some(self))?;
        *self.connection.write() = Some(connection);
        Ok(())
    }

    pub fn existing_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.read().clone()
    }

    /// The current connection, or a new one from the provider when there is
    /// none or it was released.
    pub fn connection(self: &Arc<Self>) -> Result<Arc<dyn Connection>> {
        if let Some(connection) = self.existing_connection() {
            if !connection.is_released() {
                return Ok(connection);
            }
        }
        let provider = self
            .connection_provider()
            .ok_or(Error::NoConnection(self.id))?;
        let connection = provider.get_connection(self)?;
        *self.connection.write() = Some(connection.clone());
        Ok(connection)
    }

    pub fn can_connect(&self) -> bool {
        let usable = self
            .existing_connection()
            .map_or(false, |connection| !connection.is_released());
        usable || self.provider.read().is_some()
    }

    /// Starts connecting and returns the connection.
    pub fn connect(self: &Arc<Self>) -> Result<Arc<dyn Connection>> {
        let connection = self.connection()?;
        connection.connect()?;
        Ok(connection)
    }

    pub fn send(self: &Arc<Self>, command: Command) -> Result<()> {
        self.connection()?.send(command)
    }

    fn command(
        self: &Arc<Self>,
        method: Method,
        params: Vec<Value>,
        effect: Option<FadeEffect>,
    ) -> Result<Command> {
        let id = self.connection()?.next_message_id();
        Ok(Command::new(id, method, params, effect))
    }

    /// `effect` falls back to the device's default effect.
    fn command_fade(
        self: &Arc<Self>,
        method: Method,
        params: Vec<Value>,
        effect: Option<FadeEffect>,
    ) -> Result<Command> {
        let effect = effect.unwrap_or_else(|| self.default_effect());
        self.command(method, params, Some(effect))
    }

    /// Requests the given properties; the reply updates this device.
    pub fn get_props(self: &Arc<Self>, props: &[Prop]) -> Result<Command> {
        self.command(Method::GetProp, props.iter().map(|p| Value::from(*p)).collect(), None)
    }

    pub fn set_power(
        self: &Arc<Self>,
        on: bool,
        mode: Option<PowerMode>,
        effect: Option<FadeEffect>,
    ) -> Result<Command> {
        let mut params = vec![Value::from(if on { "on" } else { "off" })];
        if let Some(mode) = mode {
            params.push(mode.into());
        }
        self.command_fade(Method::SetPower, params, effect)
    }

    pub fn toggle(self: &Arc<Self>) -> Result<Command> {
        self.command(Method::Toggle, vec![], None)
    }

    /// Brightness in percent, clamped to 1..=100.
    pub fn set_bright(self: &Arc<Self>, brightness: u8, effect: Option<FadeEffect>) -> Result<Command> {
        let brightness = brightness.clamp(1, 100);
        self.command_fade(Method::SetBright, vec![Value::from(brightness)], effect)
    }

    /// Color as `0xRRGGBB`; higher bits are ignored.
    pub fn set_rgb(self: &Arc<Self>, rgb: u32, effect: Option<FadeEffect>) -> Result<Command> {
        self.command_fade(Method::SetRgb, vec![Value::from(rgb & RGB_MASK)], effect)
    }

    /// Color temperature in kelvin, clamped to [`TEMP_MIN`]..=[`TEMP_MAX`].
    pub fn set_ct(self: &Arc<Self>, temperature: u32, effect: Option<FadeEffect>) -> Result<Command> {
        let temperature = temperature.clamp(TEMP_MIN, TEMP_MAX);
        self.command_fade(Method::SetCtAbx, vec![Value::from(temperature)], effect)
    }

    pub fn set_name(self: &Arc<Self>, name: &str) -> Result<Command> {
        self.command(Method::SetName, vec![Value::from(name)], None)
    }

    /// Schedules `kind` to run in `minutes`.
    pub fn cron_add(self: &Arc<Self>, kind: CronType, minutes: u32) -> Result<Command> {
        self.command(Method::CronAdd, vec![kind.into(), Value::from(minutes)], None)
    }

    pub fn cron_get(self: &Arc<Self>, kind: CronType) -> Result<Command> {
        self.command(Method::CronGet, vec![kind.into()], None)
    }

    pub fn cron_del(self: &Arc<Self>, kind: CronType) -> Result<Command> {
        self.command(Method::CronDel, vec![kind.into()], None)
    }
}

impl ConnectionListener for Device {
    fn on_response(&self, device_id: u64, reply: &Reply) {
        if device_id != self.id {
            error!(
                "device@{}: reply for device {} ignored",
                self.id, device_id
            );
            return;
        }
        if let Some(props) = reply.props() {
            self.props.write().extend(props);
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device [{} {} @ {}:{}]", self.model, self.id, self.address, self.port)
    }
}
