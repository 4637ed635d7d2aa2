use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::connection::command::Command;
use crate::connection::reply::{Reply, ReplyKind, NO_ID};
use crate::device::cron::Cron;
use crate::device::method::Method;
use crate::device::props::{value_as_raw, Prop, PropMap};
use crate::error::{Error, Result};

/// Method name of unsolicited property updates.
const PROPS_NOTIFICATION: &str = "props";

/// Turns lines received from one device into [`Reply`] values.
#[derive(Debug, Clone)]
pub struct ReplyParser {
    device_id: u64,
}

impl ReplyParser {
    pub fn new(device_id: u64) -> Self {
        ReplyParser { device_id }
    }

    /**
    Parses one line and matches it with the command it answers.

    `sent` holds the commands written so far, oldest first. Matching pops
    commands off the front until the reply's id is found, so commands the
    device never answered are dropped once a later reply arrives.
     */
    pub fn parse(&self, line: &str, sent: &mut VecDeque<Arc<Command>>) -> Result<Reply> {
        let json: Value = serde_json::from_str(line)?;
        let object = json
            .as_object()
            .ok_or_else(|| Error::MalformedReply(format!("not a JSON object: {}", line)))?;

        let id = match object.get("id") {
            None => return self.parse_notification(object)?.with_request(None),
            Some(id) => id
                .as_i64()
                .and_then(|id| i32::try_from(id).ok())
                .ok_or_else(|| Error::MalformedReply(format!("invalid id: {}", id)))?,
        };

        if let Some(result) = object.get("result") {
            let result = result
                .as_array()
                .ok_or_else(|| Error::MalformedReply(format!("result is not an array: {}", line)))?;
            let command = Self::find_in_queue(sent, id);
            let kind = match command.as_ref().and_then(|command| command.method()) {
                Some(Method::GetProp) => {
                    Self::parse_get_prop(result, command.as_ref().map(|c| c.params()))
                }
                Some(Method::CronGet) => Self::parse_cron_get(result)?,
                _ => ReplyKind::Result(result.clone()),
            };
            return Reply::new(self.device_id, id, kind).with_request(command);
        }

        if let Some(error) = object.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::MalformedReply(format!("error without code: {}", line)))?;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedReply(format!("error without message: {}", line)))?;
            let kind = ReplyKind::Error {
                code: code as i32,
                message: message.to_string(),
            };
            let command = Self::find_in_queue(sent, id);
            return Reply::new(self.device_id, id, kind).with_request(command);
        }

        Err(Error::MalformedReply(format!(
            "neither result nor error in reply: {}",
            line
        )))
    }

    /// Pops commands until one with `id` is found. [`NO_ID`] never matches.
    pub fn find_in_queue(sent: &mut VecDeque<Arc<Command>>, id: i32) -> Option<Arc<Command>> {
        if id == NO_ID {
            return None;
        }
        while let Some(command) = sent.pop_front() {
            if command.id() == id {
                return Some(command);
            }
            debug!("parse: command {} got no reply, dropping it", command);
        }
        None
    }

    /**
    Result values of `get_prop` are zipped with the property names of the request.

    Properties the result has no value for are left out and read as undefined.
     */
    fn parse_get_prop(result: &[Value], requested: Option<&[Value]>) -> ReplyKind {
        let mut props = PropMap::new();
        for (position, name) in requested.unwrap_or_default().iter().enumerate() {
            // requested names that are not properties are skipped, but keep their position
            let Some(prop) = name.as_str().and_then(Prop::from_name) else {
                continue;
            };
            match result.get(position) {
                Some(value) => {
                    props.insert(prop, &value_as_raw(value));
                }
                None => warn!("parse: no value for requested property {}", prop),
            }
        }
        ReplyKind::Props(props)
    }

    fn parse_cron_get(result: &[Value]) -> Result<ReplyKind> {
        match result.first() {
            None => Ok(ReplyKind::Cron(Cron::NONE)),
            Some(entry) => Ok(ReplyKind::Cron(Cron::from_json(entry)?)),
        }
    }

    fn parse_notification(&self, object: &Map<String, Value>) -> Result<Reply> {
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedReply("notification without method".to_string()))?;
        if method != PROPS_NOTIFICATION {
            return Err(Error::UnsupportedNotification(method.to_string()));
        }
        let params = object
            .get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MalformedReply("props notification without params".to_string()))?;
        Ok(Reply::push(self.device_id, PropMap::from_json_object(params)))
    }
}
