use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::connection::command::Command;
use crate::connection::listener::{Flow, Interceptor};
use crate::connection::reply::Reply;
use crate::connection::socket::{Socket, SocketState, WeakSocket};
use crate::connection::{Connection, ConnectionConfig, ConnectionCore, DeviceSlot};
use crate::device::Device;
use crate::error::{Error, Result};

/// Invoked with the device id after an idle connection was closed.
pub type TimeoutHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Tag of the interceptor closing the socket once the device is gone.
pub const DISCONNECT_ON_DEVICE_LOST_TAG: &str = "disconnect_on_device_lost";

struct DisconnectOnDeviceLost {
    slot: Arc<DeviceSlot>,
    // the pipeline lives inside the socket's core
    socket: WeakSocket,
}

impl DisconnectOnDeviceLost {
    fn check(&self, device_id: u64) -> Flow {
        if self.slot.is_lost() {
            debug!("auto@{}: device lost, disconnecting", device_id);
            if let Some(socket) = self.socket.upgrade() {
                if let Err(e) = socket.close() {
                    warn!("auto@{}: {}", device_id, e);
                }
            }
        }
        Flow::Continue
    }
}

impl Interceptor for DisconnectOnDeviceLost {
    fn tag(&self) -> Option<&str> {
        Some(DISCONNECT_ON_DEVICE_LOST_TAG)
    }

    fn on_response(&self, device_id: u64, _reply: &Reply) -> Flow {
        self.check(device_id)
    }

    fn on_connection_error(
        &self,
        device_id: u64,
        _error: &Error,
        _failed_command: Option<&Command>,
    ) -> Flow {
        self.check(device_id)
    }
}

/**
Connection that opens itself when a command is sent.

Each send restarts the idle timer; when it fires the socket is closed and the
timeout hook runs. The read loop also stops as soon as the bound device has
been dropped.
 */
pub struct AutoConnection {
    core: Arc<ConnectionCore>,
    socket: Socket,
    timer: Mutex<Option<JoinHandle<()>>>,
    timeout_hook: Arc<RwLock<Option<TimeoutHook>>>,
}

impl AutoConnection {
    pub fn for_device(device: &Arc<Device>, config: ConnectionConfig) -> Self {
        let core = Arc::new(ConnectionCore::for_device(device, config));
        let slot = core.device_slot().clone();
        let interrupt_slot = slot.clone();
        let socket =
            Socket::new(core.clone()).with_interrupt(Arc::new(move || interrupt_slot.is_lost()));
        core.pipeline().add_interceptor(Arc::new(DisconnectOnDeviceLost {
            slot,
            socket: socket.downgrade(),
        }));
        AutoConnection {
            core,
            socket,
            timer: Mutex::new(None),
            timeout_hook: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets the hook run after the connection timed out and closed.
    pub fn set_timeout_hook(&self, hook: Option<TimeoutHook>) {
        *self.timeout_hook.write() = hook;
    }

    fn restart_timer(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let idle_timeout = self.core.config().idle_timeout;
        let socket = self.socket.clone();
        let hook = self.timeout_hook.clone();
        let device_id = self.core.device_id();

        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            debug!("auto@{}: idle for {:?}, disconnecting", device_id, idle_timeout);
            if let Err(e) = socket.close() {
                warn!("auto@{}: {}", device_id, e);
            }
            let hook = hook.read().clone();
            if let Some(hook) = hook {
                hook(device_id);
            }
        }));
        Ok(())
    }
}

impl Drop for AutoConnection {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

#[async_trait]
impl Connection for AutoConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn connect(&self) -> Result<()> {
        error!("connect@{}: auto connections connect on send", self.core.device_id());
        Err(Error::ExplicitConnect(self.core.device_id()))
    }

    async fn connect_sync(&self) -> Result<()> {
        self.connect()
    }

    fn disconnect(&self) -> Result<()> {
        if self.socket.state() != SocketState::Idle {
            self.socket.close()
        } else {
            Ok(())
        }
    }

    fn send_all(&self, commands: Vec<Command>) -> Result<()> {
        self.core.ensure_not_released()?;
        if !self.socket.is_connected() {
            self.socket.open()?;
        }
        self.socket.write(commands.into_iter().map(Arc::new).collect());
        self.restart_timer()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::method::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(idle_ms: u64) -> ConnectionConfig {
        ConnectionConfig {
            idle_timeout: Duration::from_millis(idle_ms),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_connects_and_idle_timeout_disconnects() {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Arc::new(Device::new(4, "color", "127.0.0.1", port));
        let connection = AutoConnection::for_device(&device, config(100));

        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = timeouts.clone();
        let socket = connection.socket.clone();
        let disconnected_first = Arc::new(AtomicUsize::new(0));
        let disconnected = disconnected_first.clone();
        connection.set_timeout_hook(Some(Arc::new(move |_| {
            if !socket.is_connected() {
                disconnected.fetch_add(1, Ordering::SeqCst);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let command = Command::new(connection.next_message_id(), Method::Toggle, vec![], None);
        let expected = command.to_json().unwrap();
        connection.send(command).unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
        assert!(connection.is_connected());

        // the socket is closed from our side once the timer fires
        assert!(lines.next_line().await.unwrap().is_none());
        for _ in 0..100 {
            if timeouts.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected_first.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_connect_is_rejected() {
        let device = Arc::new(Device::new(4, "color", "127.0.0.1", 1));
        let connection = AutoConnection::for_device(&device, ConnectionConfig::default());
        assert!(matches!(connection.connect(), Err(Error::ExplicitConnect(4))));
        assert!(matches!(
            connection.connect_sync().await,
            Err(Error::ExplicitConnect(4))
        ));
        assert!(connection.has_interceptor_tag(DISCONNECT_ON_DEVICE_LOST_TAG));
    }

    #[tokio::test]
    async fn test_send_while_closing_reconnects() {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Arc::new(Device::new(4, "color", "127.0.0.1", port));
        let connection = AutoConnection::for_device(&device, config(10_000));

        connection
            .send(Command::new(connection.next_message_id(), Method::Toggle, vec![], None))
            .unwrap();
        let (_first, _) = listener.accept().await.unwrap();

        connection.disconnect().unwrap();
        let command = Command::new(connection.next_message_id(), Method::Toggle, vec![], None);
        let expected = command.to_json().unwrap();
        connection.send(command).unwrap();

        let (second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut lines = BufReader::new(second).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_lost_device_closes_socket() {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Arc::new(Device::new(5, "color", "127.0.0.1", port));
        let connection = AutoConnection::for_device(&device, config(10_000));

        connection
            .send(Command::new(connection.next_message_id(), Method::Toggle, vec![], None))
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        lines.next_line().await.unwrap().unwrap();

        drop(device);
        assert!(connection.device().is_none());
        writer
            .write_all(b"{\"method\":\"props\",\"params\":{\"power\":\"off\"}}\r\n")
            .await
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());
        for _ in 0..100 {
            if connection.socket.state() == SocketState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connection.socket.state(), SocketState::Idle);
    }
}
