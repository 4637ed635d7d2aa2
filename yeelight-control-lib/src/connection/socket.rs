use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::connection::command::Command;
use crate::connection::reply_parser::ReplyParser;
use crate::connection::ConnectionCore;
use crate::error::{Error, Result};

/// Lifecycle of a [`Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Opening,
    Connected,
    Closing,
}

enum Request {
    Write(Vec<Arc<Command>>),
    Close,
}

/// Checked by the read loop; returning true ends it.
pub type Interrupt = Arc<dyn Fn() -> bool + Send + Sync>;

/// Channel ends of the task started once the closing one has finished.
struct Reopen {
    requests: mpsc::UnboundedReceiver<Request>,
    opened: oneshot::Sender<Result<()>>,
}

struct Inner {
    state: SocketState,
    /// Present while a read task runs. Writes issued before the stream is
    /// connected wait in this channel. While closing with a reopen pending it
    /// feeds the next task.
    requests: Option<mpsc::UnboundedSender<Request>>,
    reopen: Option<Reopen>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Commands written and not answered yet, oldest first.
    outstanding: Mutex<VecDeque<Arc<Command>>>,
    opened: AtomicUsize,
}

/**
The TCP transport of one connection.

Opening spawns a task that connects, writes queued commands and then reads
replies line by line until the socket is closed. Cloning yields another
handle to the same socket.
 */
#[derive(Clone)]
pub struct Socket {
    core: Arc<ConnectionCore>,
    shared: Arc<Shared>,
    parser: ReplyParser,
    interrupt: Option<Interrupt>,
}

/// Handle to a [`Socket`] that does not keep it alive.
#[derive(Clone)]
pub struct WeakSocket {
    core: Weak<ConnectionCore>,
    shared: Weak<Shared>,
    parser: ReplyParser,
    interrupt: Option<Interrupt>,
}

impl WeakSocket {
    pub fn upgrade(&self) -> Option<Socket> {
        Some(Socket {
            core: self.core.upgrade()?,
            shared: self.shared.upgrade()?,
            parser: self.parser.clone(),
            interrupt: self.interrupt.clone(),
        })
    }
}

impl Socket {
    pub fn new(core: Arc<ConnectionCore>) -> Self {
        let parser = ReplyParser::new(core.device_id());
        Socket {
            core,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SocketState::Idle,
                    requests: None,
                    reopen: None,
                }),
                outstanding: Mutex::new(VecDeque::new()),
                opened: AtomicUsize::new(0),
            }),
            parser,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            core: Arc::downgrade(&self.core),
            shared: Arc::downgrade(&self.shared),
            parser: self.parser.clone(),
            interrupt: self.interrupt.clone(),
        }
    }

    pub fn state(&self) -> SocketState {
        self.shared.inner.lock().state
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == SocketState::Opening
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    pub fn is_closing(&self) -> bool {
        self.state() == SocketState::Closing
    }

    pub fn outstanding_commands(&self) -> usize {
        self.shared.outstanding.lock().len()
    }

    /// How many times a stream was successfully opened.
    pub fn open_count(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Starts opening in the background. Does nothing unless idle.
    pub fn open(&self) -> Result<()> {
        self.start().map(|_| ())
    }

    /**
    Opens and waits for the outcome.

    Returns at once when already opening or open, or when a reopen is already
    pending. While closing, the socket opens again as soon as the previous
    stream is shut down.
     */
    pub async fn open_sync(&self) -> Result<()> {
        match self.start()? {
            None => Ok(()),
            Some(opened) => opened
                .await
                .unwrap_or_else(|_| Err(Error::NotOpen(self.core.device_id()))),
        }
    }

    fn start(&self) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let id = self.core.device_id();
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let mut inner = self.shared.inner.lock();
        let closing = match inner.state {
            SocketState::Idle => false,
            SocketState::Closing if inner.reopen.is_none() => true,
            state => {
                info!("open@{}: socket is {:?}, ignoring", id, state);
                return Ok(None);
            }
        };
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        inner.requests = Some(requests_tx);
        if closing {
            debug!("open@{}: still closing, reopening afterwards", id);
            inner.reopen = Some(Reopen {
                requests: requests_rx,
                opened: opened_tx,
            });
            return Ok(Some(opened_rx));
        }
        inner.state = SocketState::Opening;
        drop(inner);

        debug!("open@{}: opening {}:{}", id, self.core.address(), self.core.port());
        runtime.spawn(self.clone().run(requests_rx, opened_tx));
        Ok(Some(opened_rx))
    }

    /**
    Writes commands in order.

    Commands sent while the socket is opening, or closing with a reopen
    pending, are written once it is connected. Otherwise they are dropped.
     */
    pub fn write(&self, commands: Vec<Arc<Command>>) {
        let id = self.core.device_id();
        let inner = self.shared.inner.lock();
        let accepting = match inner.state {
            SocketState::Opening | SocketState::Connected => true,
            SocketState::Closing => inner.reopen.is_some(),
            SocketState::Idle => false,
        };
        match &inner.requests {
            Some(requests) if accepting => {
                if inner.state != SocketState::Connected {
                    debug!("write@{}: not connected yet, queueing {} commands", id, commands.len());
                }
                let count = commands.len();
                if requests.send(Request::Write(commands)).is_err() {
                    error!("write@{}: socket task is gone, {} commands dropped", id, count);
                }
            }
            _ => error!("write@{}: cannot write because device is not connected", id),
        }
    }

    /// Closes the socket, or abandons an open or reopen in progress.
    pub fn close(&self) -> Result<()> {
        let id = self.core.device_id();
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SocketState::Idle => Ok(()),
            SocketState::Closing => {
                if let Some(mut reopen) = inner.reopen.take() {
                    debug!("close@{}: cancelling reopen", id);
                    inner.requests = None;
                    drop(inner);
                    let lost = Self::drain(&mut reopen.requests);
                    if lost > 0 {
                        error!("close@{}: {} commands lost", id, lost);
                    }
                    let _ = reopen.opened.send(Err(Error::NotOpen(id)));
                }
                Ok(())
            }
            SocketState::Opening => {
                debug!("close@{}: cancelling open", id);
                inner.state = SocketState::Closing;
                Ok(())
            }
            SocketState::Connected => {
                debug!("close@{}", id);
                inner.state = SocketState::Closing;
                match &inner.requests {
                    Some(requests) => requests
                        .send(Request::Close)
                        .map_err(|_| Error::NotOpen(id)),
                    None => Err(Error::NotOpen(id)),
                }
            }
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().map_or(false, |interrupted| interrupted())
    }

    async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        opened: oneshot::Sender<Result<()>>,
    ) {
        let id = self.core.device_id();
        if self.core.is_released() {
            error!("open@{}: released before the socket opened", id);
            self.abandon(&mut requests);
            let _ = opened.send(Err(Error::Released(id)));
            return;
        }

        let address = (self.core.address(), self.core.port());
        let connected = match timeout(self.core.config().connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                error!("open@{}: {}", id, e);
                let error = Error::Io(e);
                self.core.pipeline().dispatch_connection_error(id, &error, None);
                self.abandon(&mut requests);
                let _ = opened.send(Err(error));
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(self.core.config().nodelay) {
            debug!("open@{}: cannot set nodelay: {}", id, e);
        }

        {
            let mut inner = self.shared.inner.lock();
            if inner.state != SocketState::Opening || self.core.is_released() {
                drop(inner);
                error!("open@{}: closed before the socket opened", id);
                self.abandon(&mut requests);
                let _ = opened.send(Err(Error::NotOpen(id)));
                return;
            }
            inner.state = SocketState::Connected;
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!("open@{}: connected", id);
        self.core.pipeline().dispatch_connected(id);
        let _ = opened.send(Ok(()));

        let (reader, writer) = stream.into_split();
        let error = self.read_loop(reader, writer, &mut requests).await;
        self.finish(&mut requests, error);
    }

    async fn read_loop<R, W>(
        &self,
        reader: R,
        mut writer: W,
        requests: &mut mpsc::UnboundedReceiver<Request>,
    ) -> Option<Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let id = self.core.device_id();
        let mut lines = BufReader::new(reader).lines();
        loop {
            if self.is_interrupted() {
                info!("loop_read@{}: interrupted", id);
                return None;
            }
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {
                        return Some(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "device closed the connection",
                        )))
                    }
                    Err(e) => {
                        debug!("loop_read@{}: exception while reading: {}", id, e);
                        return Some(Error::Io(e));
                    }
                },
                request = requests.recv() => match request {
                    Some(Request::Write(commands)) => {
                        if let Err(e) = self.write_batch(&mut writer, commands).await {
                            return Some(e);
                        }
                    }
                    Some(Request::Close) | None => return None,
                },
            }
        }
    }

    // A failing command aborts the rest of its batch; earlier ones are already out.
    async fn write_batch<W>(&self, writer: &mut W, commands: Vec<Arc<Command>>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.core.device_id();
        for command in commands {
            let frame = match command.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("write@{}: cannot encode {}: {}", id, command, e);
                    self.core.pipeline().dispatch_connection_error(id, &e, Some(&command));
                    return Ok(());
                }
            };
            debug!("write@{}: {}", id, String::from_utf8_lossy(&frame).trim_end());
            self.shared.outstanding.lock().push_back(command.clone());
            let written = match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!("write@{}: {}", id, e);
                let error = Error::io_copy(&e);
                self.core.pipeline().dispatch_connection_error(id, &error, Some(&command));
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let id = self.core.device_id();
        debug!("receive@{}: {}", id, line);
        let parsed = {
            let mut sent = self.shared.outstanding.lock();
            self.parser.parse(line, &mut sent)
        };
        match parsed {
            Err(e) => error!("loop_read@{}: failed to parse the reply {}: {}", id, line, e),
            Ok(reply) => {
                self.core.pipeline().dispatch_response(id, &reply);
                if let Some(callback) = reply.command().and_then(|command| command.take_callback()) {
                    callback(&reply);
                }
            }
        }
    }

    /// Drops the commands that were waiting for the socket to open.
    fn abandon(&self, requests: &mut mpsc::UnboundedReceiver<Request>) {
        let reopen = self.settle();
        let lost = Self::drain(requests);
        if lost > 0 {
            error!("open@{}: {} commands lost", self.core.device_id(), lost);
        }
        self.core.on_disconnected();
        self.relaunch(reopen);
    }

    /// Leaves the closing state: idle, or opening again if a reopen is pending.
    fn settle(&self) -> Option<Reopen> {
        let mut inner = self.shared.inner.lock();
        match inner.reopen.take() {
            Some(reopen) => {
                inner.state = SocketState::Opening;
                Some(reopen)
            }
            None => {
                inner.state = SocketState::Idle;
                inner.requests = None;
                None
            }
        }
    }

    fn relaunch(&self, reopen: Option<Reopen>) {
        if let Some(reopen) = reopen {
            debug!("open@{}: reopening", self.core.device_id());
            tokio::spawn(self.clone().run(reopen.requests, reopen.opened));
        }
    }

    fn finish(&self, requests: &mut mpsc::UnboundedReceiver<Request>, error: Option<Error>) {
        let id = self.core.device_id();
        let self_closed = self.state() == SocketState::Closing;
        let reopen = self.settle();
        let unanswered = {
            let mut sent = self.shared.outstanding.lock();
            let count = sent.len();
            sent.clear();
            count
        };
        if unanswered > 0 {
            error!("loop_read@{}: commands lost due to socket closing: {}", id, unanswered);
        }
        let unsent = Self::drain(requests);
        if unsent > 0 {
            error!("loop_read@{}: {} commands were never written", id, unsent);
        }

        let error = if self_closed { None } else { error };
        self.core.pipeline().dispatch_disconnected(id, error.as_ref());
        info!("loop_read@{} finished", id);
        self.core.on_disconnected();
        self.relaunch(reopen);
    }

    fn drain(requests: &mut mpsc::UnboundedReceiver<Request>) -> usize {
        requests.close();
        let mut lost = 0;
        while let Ok(request) = requests.try_recv() {
            if let Request::Write(commands) = request {
                lost += commands.len();
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::listener::ConnectionListener;
    use crate::connection::reply::Reply;
    use crate::connection::ConnectionConfig;
    use crate::device::method::Method;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        replies: Mutex<Vec<i32>>,
    }

    impl ConnectionListener for Recorder {
        fn on_response(&self, _device_id: u64, reply: &Reply) {
            self.replies.lock().push(reply.id());
        }

        fn on_connection_error(&self, _device_id: u64, _error: &Error, failed_command: Option<&Command>) {
            self.events
                .lock()
                .push(format!("error {:?}", failed_command.map(Command::id)));
        }

        fn on_connected(&self, _device_id: u64) {
            self.events.lock().push("connected".to_string());
        }

        fn on_disconnected(&self, _device_id: u64, error: Option<&Error>) {
            self.events
                .lock()
                .push(format!("disconnected {}", error.is_some()));
        }
    }

    fn record(socket: &Socket) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        socket.core.pipeline().set_listener(Some(recorder.clone()));
        recorder
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn socket_to_stub() -> (Socket, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let core = Arc::new(ConnectionCore::new(1, "127.0.0.1", port, ConnectionConfig::default()));
        (Socket::new(core), listener)
    }

    #[tokio::test]
    async fn test_commands_queued_while_opening_are_flushed_in_order() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        socket.open().unwrap();
        let first = Arc::new(Command::new(0, Method::Toggle, vec![], None));
        let second = Arc::new(Command::new(1, Method::Toggle, vec![], None));
        socket.write(vec![first.clone(), second.clone()]);

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), first.to_json().unwrap());
        assert_eq!(lines.next_line().await.unwrap().unwrap(), second.to_json().unwrap());
        assert!(socket.is_connected());
        assert_eq!(socket.outstanding_commands(), 2);
    }

    #[tokio::test]
    async fn test_write_without_open_is_dropped() {
        init_logger();
        let (socket, _listener) = socket_to_stub().await;
        socket.write(vec![Arc::new(Command::new(0, Method::Toggle, vec![], None))]);
        assert_eq!(socket.state(), SocketState::Idle);
        assert_eq!(socket.outstanding_commands(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_clears_outstanding() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        socket.open_sync().await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        socket.write(vec![Arc::new(Command::new(0, Method::Toggle, vec![], None))]);

        let mut lines = BufReader::new(stream).lines();
        lines.next_line().await.unwrap();
        drop(lines);

        for _ in 0..100 {
            if socket.state() == SocketState::Idle {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(socket.state(), SocketState::Idle);
        assert_eq!(socket.outstanding_commands(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_idle() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        drop(listener);
        assert!(socket.open_sync().await.is_err());
        assert_eq!(socket.state(), SocketState::Idle);
        assert_eq!(socket.open_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_reports_error_without_command() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        let recorder = record(&socket);
        drop(listener);

        assert!(socket.open_sync().await.is_err());
        assert_eq!(*recorder.events.lock(), vec!["error None"]);
    }

    #[tokio::test]
    async fn test_write_failure_reports_command_then_disconnect() {
        init_logger();
        let (socket, _listener) = socket_to_stub().await;
        let recorder = record(&socket);

        // replies come from a pipe that stays open, writes go to one nobody reads
        let (reader, _device_out) = tokio::io::duplex(1024);
        let (writer, device_in) = tokio::io::duplex(1024);
        drop(device_in);
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        {
            let mut inner = socket.shared.inner.lock();
            inner.state = SocketState::Connected;
            inner.requests = Some(requests_tx);
        }
        let running = socket.clone();
        let task = tokio::spawn(async move {
            let error = running.read_loop(reader, writer, &mut requests_rx).await;
            running.finish(&mut requests_rx, error);
        });

        socket.write(vec![Arc::new(Command::new(7, Method::Toggle, vec![], None))]);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*recorder.events.lock(), vec!["error Some(7)", "disconnected true"]);
        assert_eq!(socket.state(), SocketState::Idle);
        assert_eq!(socket.outstanding_commands(), 0);
    }

    #[tokio::test]
    async fn test_unparsable_line_keeps_reading() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        let recorder = record(&socket);
        socket.open_sync().await.unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"garbage\r\n{\"id\":3,\"result\":[\"ok\"]}\r\n")
            .await
            .unwrap();

        wait_for(|| !recorder.replies.lock().is_empty()).await;
        assert_eq!(*recorder.replies.lock(), vec![3]);
        assert!(socket.is_connected());
        assert_eq!(*recorder.events.lock(), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_open_while_closing_reopens_afterwards() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        socket.open_sync().await.unwrap();
        let (_first, _) = listener.accept().await.unwrap();

        socket.close().unwrap();
        socket.open_sync().await.unwrap();
        assert!(socket.is_connected());
        assert_eq!(socket.open_count(), 2);

        let command = Arc::new(Command::new(0, Method::Toggle, vec![], None));
        socket.write(vec![command.clone()]);
        let (second, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(second).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), command.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reopen() {
        init_logger();
        let (socket, listener) = socket_to_stub().await;
        socket.open_sync().await.unwrap();
        let (_first, _) = listener.accept().await.unwrap();

        socket.close().unwrap();
        let opened = socket.start().unwrap().unwrap();
        socket.close().unwrap();

        assert!(opened.await.unwrap().is_err());
        wait_for(|| socket.state() == SocketState::Idle).await;
        assert_eq!(socket.state(), SocketState::Idle);
        assert_eq!(socket.open_count(), 1);
    }
}
