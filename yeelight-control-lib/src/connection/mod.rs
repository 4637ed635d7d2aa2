/*!
Connections to devices.

A [`Connection`] owns one TCP socket to one device. Commands written to it
are matched with the replies read back, and every event goes through an
[`Interceptor`] pipeline before reaching the [`ConnectionListener`] set on the
connection. The first interceptor of every connection forwards events to the
[`Device`] bound to it.

Two flavours exist: [`BasicConnection`] is connected and disconnected by the
caller, [`AutoConnection`] connects when a command is sent and disconnects
after a period of inactivity. [`ConnectionPool`] hands out one connection per
device id.
 */

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::device::Device;
use crate::error::{Error, Result};

pub mod auto;
pub mod basic;
pub mod command;
pub mod listener;
pub mod pool;
pub mod reply;
pub mod reply_parser;
pub mod socket;

pub use auto::AutoConnection;
pub use basic::BasicConnection;
pub use command::{Command, FadeEffect, MethodName};
pub use listener::{ConnectionListener, Flow, Interceptor, ListenerInterceptor, Pipeline};
pub use pool::{ConnectionPool, ConnectionProvider};
pub use reply::{Reply, ReplyKind, NO_ID};
pub use reply_parser::ReplyParser;

/// Port devices listen on.
pub const DEFAULT_PORT: u16 = 55443;

/// Inactivity after which an [`AutoConnection`] disconnects.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Time allowed for establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tag of the interceptor forwarding events to the bound device.
pub const UPDATE_DEVICE_TAG: &str = "update_device";

/// Invoked with the device id once a released connection has closed.
pub type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Used by [`AutoConnection`] only.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

/// Non-owning reference to the device a connection updates.
#[derive(Default)]
pub struct DeviceSlot(RwLock<Weak<Device>>);

impl DeviceSlot {
    pub fn get(&self) -> Option<Arc<Device>> {
        self.0.read().upgrade()
    }

    pub fn set(&self, device: Option<&Arc<Device>>) {
        *self.0.write() = device.map(Arc::downgrade).unwrap_or_default();
    }

    /// True when no device is bound or the bound device was dropped.
    pub fn is_lost(&self) -> bool {
        self.0.read().strong_count() == 0
    }
}

/// Forwards every event to the bound device, if it still exists.
struct UpdateDevice {
    device_id: u64,
    slot: Arc<DeviceSlot>,
}

impl UpdateDevice {
    fn device(&self) -> Option<Arc<Device>> {
        let device = self.slot.get();
        if device.is_none() {
            error!("update_device@{}: device reference lost", self.device_id);
        }
        device
    }
}

impl Interceptor for UpdateDevice {
    fn tag(&self) -> Option<&str> {
        Some(UPDATE_DEVICE_TAG)
    }

    fn on_response(&self, device_id: u64, reply: &Reply) -> Flow {
        if let Some(device) = self.device() {
            device.on_response(device_id, reply);
        }
        Flow::Continue
    }

    fn on_connection_error(
        &self,
        device_id: u64,
        error: &Error,
        failed_command: Option<&Command>,
    ) -> Flow {
        if let Some(device) = self.device() {
            device.on_connection_error(device_id, error, failed_command);
        }
        Flow::Continue
    }

    fn on_connected(&self, device_id: u64) -> Flow {
        if let Some(device) = self.device() {
            device.on_connected(device_id);
        }
        Flow::Continue
    }

    fn on_disconnected(&self, device_id: u64, error: Option<&Error>) -> Flow {
        if let Some(device) = self.device() {
            device.on_disconnected(device_id, error);
        }
        Flow::Continue
    }
}

/// State shared by every connection flavour and its socket.
pub struct ConnectionCore {
    device_id: u64,
    address: String,
    port: u16,
    config: ConnectionConfig,
    message_id: AtomicI32,
    released: AtomicBool,
    device: Arc<DeviceSlot>,
    pipeline: Pipeline,
    release_hook: Mutex<Option<ReleaseHook>>,
}

impl ConnectionCore {
    pub fn new(device_id: u64, address: &str, port: u16, config: ConnectionConfig) -> Self {
        let device = Arc::new(DeviceSlot::default());
        let pipeline = Pipeline::new();
        pipeline.add_interceptor(Arc::new(UpdateDevice {
            device_id,
            slot: device.clone(),
        }));
        ConnectionCore {
            device_id,
            address: address.to_string(),
            port,
            config,
            message_id: AtomicI32::new(0),
            released: AtomicBool::new(false),
            device,
            pipeline,
            release_hook: Mutex::new(None),
        }
    }

    /// Core bound to `device`, using its id and address.
    pub fn for_device(device: &Arc<Device>, config: ConnectionConfig) -> Self {
        let core = Self::new(device.id(), device.address(), device.port(), config);
        core.device.set(Some(device));
        core
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn device_slot(&self) -> &Arc<DeviceSlot> {
        &self.device
    }

    pub fn next_message_id(&self) -> i32 {
        self.message_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn ensure_not_released(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::Released(self.device_id));
        }
        Ok(())
    }

    fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn set_release_hook(&self, hook: ReleaseHook) {
        *self.release_hook.lock() = Some(hook);
    }

    fn finish_release(&self) {
        let hook = self.release_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.device_id);
        }
    }

    /// Called by the socket once its read loop has ended.
    pub fn on_disconnected(&self) {
        if self.is_released() {
            self.finish_release();
        }
    }

    fn set_device(&self, device: Option<&Arc<Device>>) -> Result<()> {
        if let Some(device) = device {
            if device.id() != self.device_id {
                return Err(Error::DeviceMismatch {
                    expected: self.device_id,
                    given: device.id(),
                });
            }
        }
        self.device.set(device);
        Ok(())
    }
}

/**
A connection to a single device.

Implementors provide the socket handling; everything else is shared through
[`ConnectionCore`].
 */
#[async_trait]
pub trait Connection: Send + Sync {
    fn core(&self) -> &ConnectionCore;

    /// Starts connecting in the background.
    fn connect(&self) -> Result<()>;

    /// Connects and waits until the connection is established or has failed.
    async fn connect_sync(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn send_all(&self, commands: Vec<Command>) -> Result<()>;

    fn is_connecting(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn is_closing(&self) -> bool;

    /// Commands written and still waiting for a reply.
    fn outstanding_commands(&self) -> usize;

    fn send(&self, command: Command) -> Result<()> {
        self.send_all(vec![command])
    }

    /// [`Connection::disconnect`] with the error logged instead of returned.
    fn try_disconnect(&self) -> bool {
        match self.disconnect() {
            Ok(()) => true,
            Err(e) => {
                warn!("disconnect@{}: {}", self.device_id(), e);
                false
            }
        }
    }

    fn device_id(&self) -> u64 {
        self.core().device_id()
    }

    fn address(&self) -> &str {
        self.core().address()
    }

    fn port(&self) -> u16 {
        self.core().port()
    }

    /// Id for the next command sent through this connection.
    fn next_message_id(&self) -> i32 {
        self.core().next_message_id()
    }

    fn is_released(&self) -> bool {
        self.core().is_released()
    }

    /**
    Prevents any further connect or send.

    An open socket is not closed. The release hook runs right away when not
    connected, otherwise once the socket has closed.
     */
    fn release(&self) {
        self.core().mark_released();
        if !self.is_connected() {
            self.core().finish_release();
        }
    }

    /// Runs right away when the connection is already released and closed.
    fn set_release_hook(&self, hook: ReleaseHook) {
        self.core().set_release_hook(hook);
        let open = self.is_connected() || self.is_connecting() || self.is_closing();
        if self.is_released() && !open {
            self.core().finish_release();
        }
    }

    /// Replaces the device receiving updates. The device must have the id of this connection.
    fn set_device(&self, device: Option<&Arc<Device>>) -> Result<()> {
        self.core().set_device(device)
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.core().device_slot().get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn ConnectionListener>>) {
        self.core().pipeline().set_listener(listener);
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.core().pipeline().listener()
    }

    /// Returns false when the interceptor is already registered.
    fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> bool {
        self.core().pipeline().add_interceptor(interceptor)
    }

    fn has_interceptor(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
        self.core().pipeline().has_interceptor(interceptor)
    }

    fn has_interceptor_tag(&self, tag: &str) -> bool {
        self.core().pipeline().has_interceptor_tag(tag)
    }
}
