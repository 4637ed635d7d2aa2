use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::command::Command;
use crate::connection::reply::Reply;
use crate::error::Error;

/**
Receives events of one connection.

All methods run on the connection's task, never on the caller of `send`.
 */
pub trait ConnectionListener: Send + Sync {
    /// The device replied to a command or pushed a property update.
    fn on_response(&self, _device_id: u64, _reply: &Reply) {}

    /// Opening the socket or writing to it failed.
    ///
    /// `failed_command` is the last command written before the failure, `None`
    /// when the connection could not be established.
    fn on_connection_error(&self, _device_id: u64, _error: &Error, _failed_command: Option<&Command>) {}

    fn on_connected(&self, _device_id: u64) {}

    /// `error` is set when the connection ended unexpectedly.
    fn on_disconnected(&self, _device_id: u64, _error: Option<&Error>) {}
}

/// Whether an event continues down the interceptor pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Later interceptors and the connection listener don't see this event.
    Stop,
}

/// Sees connection events before the connection listener and may stop them.
pub trait Interceptor: Send + Sync {
    /// Identifies the interceptor in the pipeline. Untagged interceptors are
    /// compared by identity.
    fn tag(&self) -> Option<&str> {
        None
    }

    fn on_response(&self, _device_id: u64, _reply: &Reply) -> Flow {
        Flow::Continue
    }

    fn on_connection_error(
        &self,
        _device_id: u64,
        _error: &Error,
        _failed_command: Option<&Command>,
    ) -> Flow {
        Flow::Continue
    }

    fn on_connected(&self, _device_id: u64) -> Flow {
        Flow::Continue
    }

    fn on_disconnected(&self, _device_id: u64, _error: Option<&Error>) -> Flow {
        Flow::Continue
    }
}

/// Interceptor forwarding every event to a listener.
pub struct ListenerInterceptor {
    tag: Option<String>,
    listener: Arc<dyn ConnectionListener>,
}

impl ListenerInterceptor {
    pub fn new(listener: Arc<dyn ConnectionListener>) -> Self {
        ListenerInterceptor {
            tag: None,
            listener,
        }
    }

    pub fn tagged(tag: &str, listener: Arc<dyn ConnectionListener>) -> Self {
        ListenerInterceptor {
            tag: Some(tag.to_string()),
            listener,
        }
    }
}

impl Interceptor for ListenerInterceptor {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn on_response(&self, device_id: u64, reply: &Reply) -> Flow {
        self.listener.on_response(device_id, reply);
        Flow::Continue
    }

    fn on_connection_error(
        &self,
        device_id: u64,
        error: &Error,
        failed_command: Option<&Command>,
    ) -> Flow {
        self.listener.on_connection_error(device_id, error, failed_command);
        Flow::Continue
    }

    fn on_connected(&self, device_id: u64) -> Flow {
        self.listener.on_connected(device_id);
        Flow::Continue
    }

    fn on_disconnected(&self, device_id: u64, error: Option<&Error>) -> Flow {
        self.listener.on_disconnected(device_id, error);
        Flow::Continue
    }
}

fn same_interceptor(a: &Arc<dyn Interceptor>, b: &Arc<dyn Interceptor>) -> bool {
    match (a.tag(), b.tag()) {
        (Some(tag_a), Some(tag_b)) => tag_a == tag_b,
        _ => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
    }
}

/// Dispatches events through the interceptors, in registration order, then to the listener.
#[derive(Default)]
pub struct Pipeline {
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the interceptor, or one with the same tag, is already registered.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> bool {
        let mut interceptors = self.interceptors.write();
        if interceptors.iter().any(|i| same_interceptor(i, &interceptor)) {
            return false;
        }
        interceptors.push(interceptor);
        true
    }

    pub fn has_interceptor(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
        self.interceptors
            .read()
            .iter()
            .any(|i| same_interceptor(i, interceptor))
    }

    pub fn has_interceptor_tag(&self, tag: &str) -> bool {
        self.interceptors.read().iter().any(|i| i.tag() == Some(tag))
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn ConnectionListener>>) {
        *self.listener.write() = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.read().clone()
    }

    // Callbacks run on a snapshot so they may register interceptors or
    // replace the listener without deadlocking.
    fn run(
        &self,
        intercept: impl Fn(&dyn Interceptor) -> Flow,
        deliver: impl FnOnce(&dyn ConnectionListener),
    ) {
        let interceptors = self.interceptors.read().clone();
        for interceptor in &interceptors {
            if intercept(interceptor.as_ref()) == Flow::Stop {
                return;
            }
        }
        if let Some(listener) = self.listener() {
            deliver(listener.as_ref());
        }
    }

    pub fn dispatch_response(&self, device_id: u64, reply: &Reply) {
        self.run(
            |i| i.on_response(device_id, reply),
            |l| l.on_response(device_id, reply),
        );
    }

    pub fn dispatch_connection_error(
        &self,
        device_id: u64,
        error: &Error,
        failed_command: Option<&Command>,
    ) {
        self.run(
            |i| i.on_connection_error(device_id, error, failed_command),
            |l| l.on_connection_error(device_id, error, failed_command),
        );
    }

    pub fn dispatch_connected(&self, device_id: u64) {
        self.run(|i| i.on_connected(device_id), |l| l.on_connected(device_id));
    }

    pub fn dispatch_disconnected(&self, device_id: u64, error: Option<&Error>) {
        self.run(
            |i| i.on_disconnected(device_id, error),
            |l| l.on_disconnected(device_id, error),
        );
    }
}
