use std::collections::BTreeMap;

use crate::value::Value;

pub const KEY_ACTION: &str = "a";
pub const KEY_DATA: &str = "d";
pub const KEY_ID: &str = "i";
pub const KEY_REPEAT: &str = "r";
pub const KEY_SEQ: &str = "n";
pub const KEY_ERROR: &str = "e";
pub const KEY_QUIET: &str = "q";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MsgError {
    #[error("message is not a map")]
    NotAMap,
    #[error("field {0} has wrong type")]
    BadField(&'static str),
    #[error("unknown field {0}")]
    UnknownField(String),
}

/// Error carried in a reply, `{k: kind, t: text, x?: detail}` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub kind: String,
    pub text: String,
    pub detail: Option<Value>,
}

impl ErrorReply {
    pub fn new(kind: &str, text: &str) -> Self {
        Self {
            kind: kind.to_string(),
            text: text.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Str(self.kind.clone()));
        map.insert("t".to_string(), Value::Str(self.text.clone()));
        if let Some(detail) = &self.detail {
            map.insert("x".to_string(), detail.clone());
        }
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MsgError> {
        let kind = value.get("k").and_then(Value::as_str).ok_or(MsgError::BadField(KEY_ERROR))?;
        let text = value.get("t").and_then(Value::as_str).unwrap_or_default();
        Ok(Self {
            kind: kind.to_string(),
            text: text.to_string(),
            detail: value.get("x").cloned(),
        })
    }
}

/// RPC envelope.
///
/// A message with `action` is a request, one without is a reply. A message
/// carrying only `id` ends a stream, or cancels a call when sent by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub action: Option<Vec<String>>,
    pub id: Option<u32>,
    pub data: Option<Value>,
    pub repeat: Option<u32>,
    pub seq: Option<u32>,
    pub error: Option<ErrorReply>,
    pub quiet: bool,
}

impl Message {
    pub fn request<S: AsRef<str>>(action: &[S], data: Value) -> Self {
        Self {
            action: Some(action.iter().map(|s| s.as_ref().to_string()).collect()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn reply(id: u32, data: Value) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn error_reply(id: u32, error: ErrorReply) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn stream_item(id: u32, seq: u32, data: Value) -> Self {
        Self {
            id: Some(id),
            seq: Some(seq),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Bare `{i}`.
    pub fn end(id: u32) -> Self {
        Self { id: Some(id), ..Default::default() }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_repeat(mut self, cadence_ms: u32) -> Self {
        self.repeat = Some(cadence_ms);
        self
    }

    pub fn with_quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn is_request(&self) -> bool {
        self.action.is_some()
    }

    pub fn is_end(&self) -> bool {
        self.id.is_some() && self.action.is_none() && self.data.is_none() && self.error.is_none() && self.repeat.is_none() && self.seq.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        if let Some(action) = &self.action {
            map.insert(KEY_ACTION.to_string(), Value::List(action.iter().map(|s| Value::Str(s.clone())).collect()));
        }
        if let Some(id) = self.id {
            map.insert(KEY_ID.to_string(), Value::from(id));
        }
        if let Some(data) = &self.data {
            map.insert(KEY_DATA.to_string(), data.clone());
        }
        if let Some(repeat) = self.repeat {
            map.insert(KEY_REPEAT.to_string(), Value::from(repeat));
        }
        if let Some(seq) = self.seq {
            map.insert(KEY_SEQ.to_string(), Value::from(seq));
        }
        if let Some(error) = &self.error {
            map.insert(KEY_ERROR.to_string(), error.to_value());
        }
        if self.quiet {
            map.insert(KEY_QUIET.to_string(), Value::Bool(true));
        }
        Value::Map(map)
    }

    pub fn from_value(value: Value) -> Result<Self, MsgError> {
        let map = value.into_map().ok_or(MsgError::NotAMap)?;
        let mut msg = Message::default();
        for (key, v) in map {
            match key.as_str() {
                KEY_ACTION => {
                    let list = v.as_list().ok_or(MsgError::BadField(KEY_ACTION))?;
                    let segments = list.iter().map(|s| s.as_str().map(str::to_string)).collect::<Option<Vec<_>>>();
                    msg.action = Some(segments.ok_or(MsgError::BadField(KEY_ACTION))?);
                }
                KEY_ID => msg.id = Some(as_u32(&v).ok_or(MsgError::BadField(KEY_ID))?),
                KEY_DATA => msg.data = Some(v),
                KEY_REPEAT => msg.repeat = Some(as_u32(&v).ok_or(MsgError::BadField(KEY_REPEAT))?),
                KEY_SEQ => msg.seq = Some(as_u32(&v).ok_or(MsgError::BadField(KEY_SEQ))?),
                KEY_ERROR => msg.error = Some(ErrorReply::from_value(&v)?),
                KEY_QUIET => msg.quiet = v.as_bool().ok_or(MsgError::BadField(KEY_QUIET))?,
                _ => return Err(MsgError::UnknownField(key)),
            }
        }
        Ok(msg)
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    v.as_int().and_then(|i| u32::try_from(i).ok())
}
