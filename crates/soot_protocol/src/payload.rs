//! Typed views over frame payload dicts.

use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::tlv::Value;

fn require_str(dict: &Value, kind: &'static str, field: &str) -> Result<String, ProtocolError> {
    dict.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MalformedPayload {
            kind,
            reason: format!("missing or non-string {field}"),
        })
}

/// REQUEST payload: `{"app_path", "action", "args", "kwargs"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub app_path: String,
    pub action: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Request {
    pub fn new(app_path: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            app_path: app_path.into(),
            action: action.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: BTreeMap<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("app_path".to_string(), Value::Str(self.app_path.clone()));
        map.insert("action".to_string(), Value::Str(self.action.clone()));
        map.insert("args".to_string(), Value::List(self.args.clone()));
        map.insert("kwargs".to_string(), Value::Dict(self.kwargs.clone()));
        Value::Dict(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let app_path = require_str(value, "request", "app_path")?;
        let action = require_str(value, "request", "action")?;
        let args = match value.get("args") {
            Some(Value::List(items)) => items.clone(),
            None => Vec::new(),
            Some(other) => {
                return Err(ProtocolError::MalformedPayload {
                    kind: "request",
                    reason: format!("args must be a list, got {}", other.type_name()),
                })
            }
        };
        let kwargs = match value.get("kwargs") {
            Some(Value::Dict(map)) => map.clone(),
            None => BTreeMap::new(),
            Some(other) => {
                return Err(ProtocolError::MalformedPayload {
                    kind: "request",
                    reason: format!("kwargs must be a dict, got {}", other.type_name()),
                })
            }
        };
        Ok(Self {
            app_path,
            action,
            args,
            kwargs,
        })
    }
}

/// Stash operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum StashOp {
    Put = 1,
    Get = 2,
    Delete = 3,
    Keys = 4,
    Clear = 5,
    Info = 6,
    Ensure = 7,
    DeleteTable = 8,
    Tables = 9,
    Exists = 10,
}

impl StashOp {
    pub fn from_i64(value: i64) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(StashOp::Put),
            2 => Ok(StashOp::Get),
            3 => Ok(StashOp::Delete),
            4 => Ok(StashOp::Keys),
            5 => Ok(StashOp::Clear),
            6 => Ok(StashOp::Info),
            7 => Ok(StashOp::Ensure),
            8 => Ok(StashOp::DeleteTable),
            9 => Ok(StashOp::Tables),
            10 => Ok(StashOp::Exists),
            other => Err(ProtocolError::MalformedPayload {
                kind: "stash",
                reason: format!("unknown stash op: {other}"),
            }),
        }
    }
}

/// STASH payload: `{"op", "table", "key"?, "value"?, "pattern"?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct StashRequest {
    pub op: StashOp,
    pub table: String,
    pub key: Option<String>,
    pub value: Option<Value>,
    pub pattern: Option<String>,
}

impl StashRequest {
    pub fn new(op: StashOp, table: impl Into<String>) -> Self {
        Self {
            op,
            table: table.into(),
            key: None,
            value: None,
            pattern: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("op".to_string(), Value::Int(self.op as i64));
        map.insert("table".to_string(), Value::Str(self.table.clone()));
        if let Some(key) = &self.key {
            map.insert("key".to_string(), Value::Str(key.clone()));
        }
        if let Some(value) = &self.value {
            map.insert("value".to_string(), value.clone());
        }
        if let Some(pattern) = &self.pattern {
            map.insert("pattern".to_string(), Value::Str(pattern.clone()));
        }
        Value::Dict(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let op_raw = value
            .get("op")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MalformedPayload {
                kind: "stash",
                reason: "missing or non-integer op".to_string(),
            })?;
        let op = StashOp::from_i64(op_raw)?;
        let table = require_str(value, "stash", "table")?;
        let key = value.get("key").and_then(Value::as_str).map(str::to_string);
        let stored = value.get("value").cloned();
        let pattern = value
            .get("pattern")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            op,
            table,
            key,
            value: stored,
            pattern,
        })
    }
}

/// Management operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ManageOp {
    Add = 1,
    Remove = 2,
    Kill = 3,
    Reload = 4,
    Shutdown = 5,
}

impl ManageOp {
    pub fn from_i64(value: i64) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(ManageOp::Add),
            2 => Ok(ManageOp::Remove),
            3 => Ok(ManageOp::Kill),
            4 => Ok(ManageOp::Reload),
            5 => Ok(ManageOp::Shutdown),
            other => Err(ProtocolError::MalformedPayload {
                kind: "manage",
                reason: format!("unknown manage op: {other}"),
            }),
        }
    }
}

/// MANAGE payload: `{"op", "count"}` plus `{"pid"}` for kill and
/// `{"graceful"}` for shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Manage {
    pub op: ManageOp,
    pub count: i64,
    pub pid: Option<u32>,
    pub graceful: bool,
}

impl Manage {
    pub fn add(count: i64) -> Self {
        Self {
            op: ManageOp::Add,
            count,
            pid: None,
            graceful: true,
        }
    }

    pub fn remove(count: i64) -> Self {
        Self {
            op: ManageOp::Remove,
            count,
            pid: None,
            graceful: true,
        }
    }

    pub fn kill(pid: u32) -> Self {
        Self {
            op: ManageOp::Kill,
            count: 1,
            pid: Some(pid),
            graceful: true,
        }
    }

    pub fn reload() -> Self {
        Self {
            op: ManageOp::Reload,
            count: 0,
            pid: None,
            graceful: true,
        }
    }

    pub fn shutdown(graceful: bool) -> Self {
        Self {
            op: ManageOp::Shutdown,
            count: 0,
            pid: None,
            graceful,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("op".to_string(), Value::Int(self.op as i64));
        map.insert("count".to_string(), Value::Int(self.count));
        if let Some(pid) = self.pid {
            map.insert("pid".to_string(), Value::Int(pid as i64));
        }
        if self.op == ManageOp::Shutdown {
            map.insert("graceful".to_string(), Value::Bool(self.graceful));
        }
        Value::Dict(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let op_raw = value
            .get("op")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MalformedPayload {
                kind: "manage",
                reason: "missing or non-integer op".to_string(),
            })?;
        let op = ManageOp::from_i64(op_raw)?;
        let count = value.get("count").and_then(Value::as_i64).unwrap_or(1);
        let pid = value
            .get("pid")
            .and_then(Value::as_i64)
            .and_then(|n| u32::try_from(n).ok());
        let graceful = value
            .get("graceful")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Ok(Self {
            op,
            count,
            pid,
            graceful,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Frame, MsgType};

    #[test]
    fn request_roundtrip() {
        let request = Request::new("counter:CounterApp", "increment")
            .with_args(vec![Value::Int(5)])
            .with_kwargs(BTreeMap::from([(
                "step".to_string(),
                Value::Int(1),
            )]));
        let rebuilt = Request::from_value(&request.to_value()).unwrap();
        assert_eq!(rebuilt, request);
    }

    #[test]
    fn request_frame_roundtrip() {
        let request = Request::new("lite:Lite", "ping");
        let frame = Frame::request(42, &request);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Request);
        assert_eq!(decoded.request_id, 42);
        assert_eq!(Request::from_value(&decoded.payload).unwrap(), request);
    }

    #[test]
    fn request_defaults_absent_fields() {
        let mut map = BTreeMap::new();
        map.insert("app_path".to_string(), Value::Str("a:B".to_string()));
        map.insert("action".to_string(), Value::Str("run".to_string()));
        let request = Request::from_value(&Value::Dict(map)).unwrap();
        assert!(request.args.is_empty());
        assert!(request.kwargs.is_empty());
    }

    #[test]
    fn request_rejects_bad_shapes() {
        assert!(Request::from_value(&Value::Int(3)).is_err());

        let mut map = BTreeMap::new();
        map.insert("app_path".to_string(), Value::Str("a:B".to_string()));
        map.insert("action".to_string(), Value::Str("run".to_string()));
        map.insert("args".to_string(), Value::Str("not a list".to_string()));
        assert!(Request::from_value(&Value::Dict(map)).is_err());
    }

    #[test]
    fn stash_roundtrip() {
        let request = StashRequest::new(StashOp::Put, "sessions")
            .with_key("user:1")
            .with_value(Value::Str("alice".to_string()));
        let rebuilt = StashRequest::from_value(&request.to_value()).unwrap();
        assert_eq!(rebuilt, request);
    }

    #[test]
    fn stash_pattern_roundtrip() {
        let request = StashRequest::new(StashOp::Keys, "sessions").with_pattern("user:*");
        let rebuilt = StashRequest::from_value(&request.to_value()).unwrap();
        assert_eq!(rebuilt.pattern.as_deref(), Some("user:*"));
    }

    #[test]
    fn stash_unknown_op_rejected() {
        let mut map = BTreeMap::new();
        map.insert("op".to_string(), Value::Int(99));
        map.insert("table".to_string(), Value::Str("t".to_string()));
        assert!(StashRequest::from_value(&Value::Dict(map)).is_err());
    }

    #[test]
    fn manage_roundtrip() {
        for manage in [
            Manage::add(2),
            Manage::remove(1),
            Manage::kill(4242),
            Manage::reload(),
            Manage::shutdown(false),
        ] {
            let rebuilt = Manage::from_value(&manage.to_value()).unwrap();
            assert_eq!(rebuilt, manage);
        }
    }
}
