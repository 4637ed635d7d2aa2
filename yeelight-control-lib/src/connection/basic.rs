use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::connection::command::Command;
use crate::connection::socket::{Socket, SocketState};
use crate::connection::{Connection, ConnectionConfig, ConnectionCore};
use crate::device::Device;
use crate::error::Result;

/// Connection opened and closed by the caller. Sending requires a prior connect.
pub struct BasicConnection {
    core: Arc<ConnectionCore>,
    socket: Socket,
}

impl BasicConnection {
    pub fn new(device_id: u64, address: &str, port: u16, config: ConnectionConfig) -> Self {
        Self::with_core(ConnectionCore::new(device_id, address, port, config))
    }

    /// Connection that updates `device`. Not connected yet.
    pub fn for_device(device: &Arc<Device>, config: ConnectionConfig) -> Self {
        Self::with_core(ConnectionCore::for_device(device, config))
    }

    fn with_core(core: ConnectionCore) -> Self {
        let core = Arc::new(core);
        let socket = Socket::new(core.clone());
        BasicConnection { core, socket }
    }

    /// How many times the socket was successfully opened.
    pub fn open_count(&self) -> usize {
        self.socket.open_count()
    }
}

#[async_trait]
impl Connection for BasicConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn connect(&self) -> Result<()> {
        self.core.ensure_not_released()?;
        if self.socket.is_connected() {
            info!("connect@{}: already connected", self.core.device_id());
            return Ok(());
        }
        self.socket.open()
    }

    async fn connect_sync(&self) -> Result<()> {
        self.core.ensure_not_released()?;
        if self.socket.is_connected() {
            info!("connect@{}: already connected", self.core.device_id());
            return Ok(());
        }
        self.socket.open_sync().await
    }

    fn disconnect(&self) -> Result<()> {
        if self.socket.state() != SocketState::Idle {
            self.socket.close()
        } else {
            info!("disconnect@{}: socket already disconnected", self.core.device_id());
            Ok(())
        }
    }

    fn send_all(&self, commands: Vec<Command>) -> Result<()> {
        self.core.ensure_not_released()?;
        self.socket.write(commands.into_iter().map(Arc::new).collect());
        Ok(())
    }

    fn is_connecting(&self) -> bool {
        self.socket.is_connecting()
    }

    fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    fn is_closing(&self) -> bool {
        self.socket.is_closing()
    }

    fn outstanding_commands(&self) -> usize {
        self.socket.outstanding_commands()
    }
}
