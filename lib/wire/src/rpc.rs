//! msgpack-rpc message framing.
//!
//! Every message is an array whose first element selects the kind:
//!
//! ```text
//! [0, msgid, method, params]    request
//! [1, msgid, error, result]     response
//! [2, method, params]           notification
//! ```
//!
//! Parsing is lenient about absent or nil `params` (treated as an empty
//! list), since the engine omits them for argument-less notifications.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::encode::encode;
use crate::value::Value;
use crate::EncodeError;

/// Message kind selector (first array element).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageKind {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notification),
            _ => None,
        }
    }
}

/// A decoded msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call that expects a response carrying the same id
    Request {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    /// Reply to an earlier request; `error` is nil on success
    Response { id: u32, error: Value, result: Value },
    /// One-way event
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    pub fn request(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn response(id: u32, error: Value, result: Value) -> Self {
        Message::Response { id, error, result }
    }

    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
            Message::Notification { .. } => MessageKind::Notification,
        }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    /// Interprets a decoded value as a message.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let items = match value {
            Value::Array(items) => items,
            other => return Err(MessageError::NotAnArray(other.kind_name())),
        };
        let mut fields = items.into_iter();
        let raw_kind = fields
            .next()
            .ok_or(MessageError::Truncated(0))?
            .as_i64()
            .ok_or(MessageError::InvalidField("kind"))?;
        let kind = MessageKind::from_i64(raw_kind).ok_or(MessageError::UnknownKind(raw_kind))?;

        match kind {
            MessageKind::Request => {
                let id = take_id(fields.next())?;
                let method = take_method(fields.next(), 2)?;
                let params = take_params(fields.next())?;
                Ok(Message::Request { id, method, params })
            }
            MessageKind::Response => {
                let id = take_id(fields.next())?;
                let error = fields.next().ok_or(MessageError::Truncated(2))?;
                let result = fields.next().ok_or(MessageError::Truncated(3))?;
                Ok(Message::Response { id, error, result })
            }
            MessageKind::Notification => {
                let method = take_method(fields.next(), 1)?;
                let params = take_params(fields.next())?;
                Ok(Message::Notification { method, params })
            }
        }
    }

    /// Converts the message back into its array form.
    pub fn to_value(&self) -> Value {
        let kind = Value::Integer(self.kind() as i64);
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                kind,
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Message::Response { id, error, result } => {
                Value::Array(vec![kind, Value::from(*id), error.clone(), result.clone()])
            }
            Message::Notification { method, params } => {
                Value::Array(vec![kind, Value::from(method.as_str()), Value::Array(params.clone())])
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(&self.to_value())
    }
}

fn take_id(v: Option<Value>) -> Result<u32, MessageError> {
    v.ok_or(MessageError::Truncated(1))?
        .as_u32()
        .ok_or(MessageError::InvalidField("msgid"))
}

fn take_method(v: Option<Value>, index: usize) -> Result<String, MessageError> {
    match v {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(MessageError::InvalidField("method")),
        None => Err(MessageError::Truncated(index)),
    }
}

fn take_params(v: Option<Value>) -> Result<Vec<Value>, MessageError> {
    match v {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Nil) | None => Ok(Vec::new()),
        Some(_) => Err(MessageError::InvalidField("params")),
    }
}

/// Reasons a decoded value is not a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Top-level value was not an array
    NotAnArray(&'static str),
    /// Kind selector outside 0..=2
    UnknownKind(i64),
    /// Array ended before the field at this index
    Truncated(usize),
    /// Field present but of the wrong type
    InvalidField(&'static str),
}

impl core::fmt::Display for MessageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MessageError::NotAnArray(kind) => write!(f, "Expected message array, got {}", kind),
            MessageError::UnknownKind(k) => write!(f, "Unknown message kind: {}", k),
            MessageError::Truncated(i) => write!(f, "Message truncated at field {}", i),
            MessageError::InvalidField(name) => write!(f, "Invalid message field: {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[test]
    fn test_notification_end_to_end() {
        let bytes = Message::notification("ping", Vec::new()).encode().unwrap();
        assert_eq!(bytes, vec![0x93, 0x02, 0xa4, b'p', b'i', b'n', b'g', 0x90]);

        let (value, _) = decode(&bytes).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::Integer(2), Value::from("ping"), Value::Array(Vec::new())])
        );
        let msg = Message::from_value(value).unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg, Message::notification("ping", Vec::new()));
    }

    #[test]
    fn test_request_and_response() {
        let req = Message::request(7, "nvim_input", vec![Value::from("<Esc>")]);
        let (value, _) = decode(&req.encode().unwrap()).unwrap();
        assert_eq!(Message::from_value(value).unwrap(), req);

        let resp = Message::response(7, Value::Nil, Value::from(5));
        let (value, _) = decode(&resp.encode().unwrap()).unwrap();
        let parsed = Message::from_value(value).unwrap();
        assert_eq!(parsed, resp);
        assert_eq!(parsed.method(), None);
    }

    #[test]
    fn test_missing_or_nil_params() {
        let two = Value::Array(vec![Value::Integer(2), Value::from("flush")]);
        assert_eq!(Message::from_value(two).unwrap(), Message::notification("flush", Vec::new()));

        let nil = Value::Array(vec![Value::Integer(0), Value::Integer(1), Value::from("m"), Value::Nil]);
        assert_eq!(Message::from_value(nil).unwrap(), Message::request(1, "m", Vec::new()));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Message::from_value(Value::Integer(1)), Err(MessageError::NotAnArray("integer")));
        assert_eq!(Message::from_value(Value::Array(Vec::new())), Err(MessageError::Truncated(0)));
        assert_eq!(
            Message::from_value(Value::Array(vec![Value::Integer(9)])),
            Err(MessageError::UnknownKind(9))
        );
        assert_eq!(
            Message::from_value(Value::Array(vec![Value::Integer(1), Value::Integer(-1), Value::Nil, Value::Nil])),
            Err(MessageError::InvalidField("msgid"))
        );
        assert_eq!(
            Message::from_value(Value::Array(vec![Value::Integer(1), Value::Integer(3), Value::Nil])),
            Err(MessageError::Truncated(3))
        );
    }
}
