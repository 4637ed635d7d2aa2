use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::connection::command::Command;
use crate::device::cron::Cron;
use crate::device::method::Method;
use crate::device::props::{Prop, PropMap};
use crate::error::{Error, Result};

/// Id of property pushes, which answer no command.
pub const NO_ID: i32 = -1;

/// First result value of a successful command.
pub const OK: &str = "ok";

/// What a reply carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyKind {
    /// Plain result, usually `["ok"]`.
    Result(Vec<Value>),
    /// Answer to `get_prop`, or a property push.
    Props(PropMap),
    /// Answer to `cron_get`.
    Cron(Cron),
    Error { code: i32, message: String },
}

/// A message received from a device.
#[derive(Debug, Clone)]
pub struct Reply {
    device_id: u64,
    id: i32,
    kind: ReplyKind,
    command: Option<Arc<Command>>,
    command_set: bool,
}

impl Reply {
    pub fn new(device_id: u64, id: i32, kind: ReplyKind) -> Self {
        Reply {
            device_id,
            id,
            kind,
            command: None,
            command_set: false,
        }
    }

    /// Unsolicited property update.
    pub fn push(device_id: u64, props: PropMap) -> Self {
        Reply::new(device_id, NO_ID, ReplyKind::Props(props))
    }

    /// Attaches the command that produced this reply. Allowed once, even with `None`.
    pub fn with_request(mut self, command: Option<Arc<Command>>) -> Result<Self> {
        if self.command_set {
            return Err(Error::CommandAlreadySet(self.id));
        }
        self.command = command;
        self.command_set = true;
        Ok(self)
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn kind(&self) -> &ReplyKind {
        &self.kind
    }

    pub fn command(&self) -> Option<&Arc<Command>> {
        self.command.as_ref()
    }

    /// Method of the matched command.
    pub fn method(&self) -> Option<Method> {
        self.command.as_ref().and_then(|command| command.method())
    }

    /// True unless this is an error or a result whose first value isn't `"ok"`.
    pub fn is_ok(&self) -> bool {
        match &self.kind {
            ReplyKind::Result(values) => values.first().and_then(Value::as_str) == Some(OK),
            ReplyKind::Props(_) | ReplyKind::Cron(_) => true,
            ReplyKind::Error { .. } => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ReplyKind::Error { .. })
    }

    /// A lone `"ok"`.
    pub fn is_single_result(&self) -> bool {
        matches!(&self.kind, ReplyKind::Result(values) if values.len() == 1) && self.is_ok()
    }

    pub fn has_props(&self) -> bool {
        matches!(self.kind, ReplyKind::Props(_))
    }

    /// Carries exactly one property, and it's `prop`.
    pub fn is_prop(&self, prop: Prop) -> bool {
        match &self.kind {
            ReplyKind::Props(props) => props.len() == 1 && props.get(prop).is_some(),
            _ => false,
        }
    }

    pub fn results(&self) -> Option<&[Value]> {
        match &self.kind {
            ReplyKind::Result(values) => Some(values),
            _ => None,
        }
    }

    pub fn props(&self) -> Option<&PropMap> {
        match &self.kind {
            ReplyKind::Props(props) => Some(props),
            _ => None,
        }
    }

    pub fn cron(&self) -> Option<&Cron> {
        match &self.kind {
            ReplyKind::Cron(cron) => Some(cron),
            _ => None,
        }
    }

    /// Code and message of an error reply.
    pub fn error(&self) -> Option<(i32, &str)> {
        match &self.kind {
            ReplyKind::Error { code, message } => Some((*code, message.as_str())),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command.as_ref() {
            Some(command) => write!(f, "Reply[{}, {}, {}]", self.device_id, self.id, command.method_name()),
            None => write!(f, "Reply[{}, {}]", self.device_id, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_flags() {
        let ok = Reply::new(1, 0, ReplyKind::Result(vec![json!("ok")]));
        assert!(ok.is_ok());
        assert!(ok.is_single_result());

        let values = Reply::new(1, 0, ReplyKind::Result(vec![json!("on"), json!("10")]));
        assert!(!values.is_ok());

        let error = Reply::new(
            1,
            0,
            ReplyKind::Error {
                code: -1,
                message: "unsupported method".to_string(),
            },
        );
        assert!(error.is_error());
        assert!(!error.is_ok());
        assert_eq!(error.error(), Some((-1, "unsupported method")));
    }

    #[test]
    fn test_request_can_be_attached_once() {
        let reply = Reply::push(1, PropMap::new()).with_request(None).unwrap();
        assert_eq!(reply.id(), NO_ID);
        assert!(matches!(
            reply.with_request(None),
            Err(Error::CommandAlreadySet(NO_ID))
        ));
    }

    #[test]
    fn test_is_prop_requires_single_entry() {
        let mut props = PropMap::new();
        props.insert(Prop::Bright, "20");
        let reply = Reply::push(1, props.clone());
        assert!(reply.is_prop(Prop::Bright));

        props.insert(Prop::Power, "on");
        let reply = Reply::push(1, props);
        assert!(!reply.is_prop(Prop::Bright));
        assert!(reply.has_props());
    }
}
