use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use derivative::Derivative;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::connection::reply::Reply;
use crate::device::method::Method;
use crate::error::Result;

/// Callback invoked once with the reply matched to its command.
pub type ReplyCallback = Box<dyn FnOnce(&Reply) + Send>;

/// Line terminator of every frame sent to a device.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Fade effect appended to commands that change the light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeEffect {
    pub smooth: bool,
    /// Duration of the fade in milliseconds.
    pub duration: u32,
}

impl FadeEffect {
    /// Instant change.
    pub const SUDDEN: FadeEffect = FadeEffect {
        smooth: false,
        duration: 0,
    };

    /// 500 ms smooth fade.
    pub const DEFAULT: FadeEffect = FadeEffect {
        smooth: true,
        duration: 500,
    };

    /// A smooth fade of `duration` ms, or [`FadeEffect::SUDDEN`] for 0.
    pub fn of(duration: u32) -> Self {
        if duration == 0 {
            FadeEffect::SUDDEN
        } else {
            FadeEffect {
                smooth: true,
                duration,
            }
        }
    }

    fn push_params(&self, params: &mut Vec<Value>) {
        params.push(Value::from(if self.smooth { "smooth" } else { "sudden" }));
        params.push(Value::from(self.duration));
    }
}

/// Method of a command: one from the catalog or a raw name the catalog does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodName {
    Known(Method),
    Custom(String),
}

impl MethodName {
    pub fn as_str(&self) -> &str {
        match self {
            MethodName::Known(method) => method.name(),
            MethodName::Custom(name) => name,
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct WireCommand<'a> {
    id: i32,
    method: &'a str,
    params: Vec<Value>,
}

/**
A request sent to a device.

The `id` has to come from the connection that sends it
(see [`Connection::next_message_id`](crate::connection::Connection::next_message_id)),
otherwise the reply can't be matched back to the command.
 */
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Command {
    id: i32,
    method: MethodName,
    params: Vec<Value>,
    effect: Option<FadeEffect>,
    #[derivative(Debug = "ignore")]
    callback: Mutex<Option<ReplyCallback>>,
}

impl Command {
    pub fn new(id: i32, method: Method, params: Vec<Value>, effect: Option<FadeEffect>) -> Self {
        Self::with_method(id, MethodName::Known(method), params, effect)
    }

    /// Command with a method name missing from [`Method`].
    pub fn custom(id: i32, method: &str, params: Vec<Value>, effect: Option<FadeEffect>) -> Self {
        let method = match Method::from_name(method) {
            Some(known) => MethodName::Known(known),
            None => MethodName::Custom(method.to_string()),
        };
        Self::with_method(id, method, params, effect)
    }

    fn with_method(
        id: i32,
        method: MethodName,
        params: Vec<Value>,
        effect: Option<FadeEffect>,
    ) -> Self {
        Command {
            id,
            method,
            params,
            effect,
            callback: Mutex::new(None),
        }
    }

    /// Sets the callback that receives the reply to this command.
    ///
    /// It runs on the connection's read task and is not called when the
    /// connection fails before the reply arrives.
    pub fn on_reply<F>(self, callback: F) -> Self
    where
        F: FnOnce(&Reply) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
        self
    }

    pub(crate) fn take_callback(&self) -> Option<ReplyCallback> {
        self.callback.lock().take()
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// The catalog method, `None` for custom commands.
    pub fn method(&self) -> Option<Method> {
        match self.method {
            MethodName::Known(method) => Some(method),
            MethodName::Custom(_) => None,
        }
    }

    pub fn method_name(&self) -> &str {
        self.method.as_str()
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn effect(&self) -> Option<FadeEffect> {
        self.effect
    }

    /// Canonical JSON encoding, fade effect included.
    pub fn to_json(&self) -> Result<String> {
        let mut params = self.params.clone();
        if let Some(effect) = &self.effect {
            effect.push_params(&mut params);
        }
        let wire = WireCommand {
            id: self.id,
            method: self.method.as_str(),
            params,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// The bytes written to the socket.
    pub fn to_frame(&self) -> Result<Bytes> {
        let json = self.to_json()?;
        let mut frame = BytesMut::with_capacity(json.len() + FRAME_TERMINATOR.len());
        frame.put_slice(json.as_bytes());
        frame.put_slice(FRAME_TERMINATOR);
        Ok(frame.freeze())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command[{}, {}, params[{}]]", self.id, self.method, self.params.len())
    }
}
