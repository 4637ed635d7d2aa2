use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::connection::{AutoConnection, BasicConnection, Connection, ConnectionConfig};
use crate::device::Device;
use crate::error::Result;

/// Hands out connections for devices.
pub trait ConnectionProvider: Send + Sync {
    /// Creates a connection for the device or returns the existing one.
    fn get_connection(&self, device: &Arc<Device>) -> Result<Arc<dyn Connection>>;

    /// Releases and disconnects every connection handed out.
    fn release(&self);
}

/// Builds the connection for a device the pool has not seen yet.
pub type ConnectionFactory = Box<dyn Fn(&Arc<Device>) -> Arc<dyn Connection> + Send + Sync>;

/// Observes or adjusts every connection right after the pool created it.
pub type Extension = Box<dyn Fn(&Arc<dyn Connection>) + Send + Sync>;

/// Keeps one connection per device id.
pub struct ConnectionPool {
    connections: Mutex<HashMap<u64, Arc<dyn Connection>>>,
    factory: ConnectionFactory,
    extension: RwLock<Option<Extension>>,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory) -> Self {
        ConnectionPool {
            connections: Mutex::new(HashMap::new()),
            factory,
            extension: RwLock::new(None),
        }
    }

    /// Pool of [`BasicConnection`]s, each connected as soon as it is created.
    pub fn basic(config: ConnectionConfig) -> Self {
        Self::new(Box::new(move |device: &Arc<Device>| -> Arc<dyn Connection> {
            let connection = BasicConnection::for_device(device, config.clone());
            if let Err(e) = connection.connect() {
                warn!("pool@{}: cannot connect: {}", device.id(), e);
            }
            Arc::new(connection)
        }))
    }

    /// Pool of [`AutoConnection`]s.
    pub fn auto(config: ConnectionConfig) -> Self {
        Self::new(Box::new(move |device: &Arc<Device>| -> Arc<dyn Connection> {
            Arc::new(AutoConnection::for_device(device, config.clone()))
        }))
    }

    pub fn set_extension(&self, extension: Option<Extension>) {
        *self.extension.write() = extension;
    }

    /// Copy of the current connections by device id.
    pub fn connections(&self) -> HashMap<u64, Arc<dyn Connection>> {
        self.connections.lock().clone()
    }
}

impl ConnectionProvider for ConnectionPool {
    /// An existing connection is rebound to `device`.
    fn get_connection(&self, device: &Arc<Device>) -> Result<Arc<dyn Connection>> {
        let mut connections = self.connections.lock();
        if let Some(connection) = connections.get(&device.id()) {
            connection.set_device(Some(device))?;
            return Ok(connection.clone());
        }
        let connection = (self.factory)(device);
        if let Some(extension) = self.extension.read().as_ref() {
            extension(&connection);
        }
        connections.insert(device.id(), connection.clone());
        Ok(connection)
    }

    fn release(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.release();
            connection.try_disconnect();
        }
    }
}
