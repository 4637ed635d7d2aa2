use std::io;

use thiserror::Error;

/// Errors raised by the connection layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection was released and can no longer connect or send.
    #[error("connection to device {0} was released")]
    Released(u64),

    /// A device with a different id was bound to a connection.
    #[error("cannot assign device {given} to the connection of device {expected}")]
    DeviceMismatch { expected: u64, given: u64 },

    /// A reply was matched with a command twice.
    #[error("reply {0} already has a matched command")]
    CommandAlreadySet(i32),

    /// Auto connections only connect as a side effect of sending.
    #[error("connection to device {0} connects automatically on send")]
    ExplicitConnect(u64),

    /// The transport of the device is not open.
    #[error("socket of device {0} is not open")]
    NotOpen(u64),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// A notification without an id that is not a property push.
    #[error("unsupported notification method: {0}")]
    UnsupportedNotification(String),

    #[error("invalid discovery data: {0}")]
    InvalidDiscovery(String),

    #[error("discovery socket is already open")]
    AlreadyListening,

    /// Sockets are driven by tokio and need a running runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Neither a connection nor a provider is set on the device.
    #[error("no connection available for device {0}")]
    NoConnection(u64),
}

impl Error {
    /// Copies an I/O error so it can be both reported and returned.
    pub(crate) fn io_copy(error: &io::Error) -> Self {
        Error::Io(io::Error::new(error.kind(), error.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
