//! Protocol-level failures and the wire error taxonomy.
//!
//! `ProtocolError` covers malformed frames and codec failures on this side
//! of a connection. `DirtyError` is the error that travels inside ERROR
//! frames: every kind serializes to a `{error_type, message, details}` dict
//! and the receiving side rebuilds an equal value, so errors survive the
//! worker -> arbiter -> client relay intact.

use std::collections::BTreeMap;
use std::fmt;

use crate::tlv::Value;
use crate::{MsgType, HEADER_SIZE, MAX_PAYLOAD_SIZE, VERSION};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("header too short: {got} bytes, expected {HEADER_SIZE}")]
    HeaderTooShort { got: usize },

    #[error("invalid magic bytes: {found:02x?}")]
    BadMagic { found: [u8; 2] },

    #[error("unsupported protocol version: {found}, expected {VERSION}")]
    BadVersion { found: u8 },

    #[error("unknown message type: 0x{found:02x}")]
    UnknownMsgType { found: u8 },

    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: u64 },

    #[error("truncated TLV data: {context}")]
    Truncated { context: &'static str },

    #[error("trailing data after TLV value: {remaining} bytes")]
    TrailingData { remaining: usize },

    #[error("invalid UTF-8 in string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("unknown TLV type tag: 0x{found:02x}")]
    UnknownTypeTag { found: u8 },

    #[error("dict key must be a string, got {found}")]
    NonStringKey { found: &'static str },

    #[error("{what} too large: {size} (max {max})")]
    ValueTooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    #[error("unexpected message type: {found:?}")]
    UnexpectedMessage { found: MsgType },

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for the clean end-of-stream case, as opposed to a mid-frame cut.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

/// The error kinds that may appear as `error_type` in an ERROR payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Timeout,
    Connection,
    Worker,
    App,
    AppNotFound,
    NoWorkersAvailable,
    Protocol,
    StashTableNotFound,
    StashKeyNotFound,
}

impl ErrorKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Worker => "WorkerError",
            ErrorKind::App => "AppError",
            ErrorKind::AppNotFound => "AppNotFoundError",
            ErrorKind::NoWorkersAvailable => "NoWorkersAvailableError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::StashTableNotFound => "StashTableNotFoundError",
            ErrorKind::StashKeyNotFound => "StashKeyNotFoundError",
        }
    }

    pub fn from_wire_name(name: &str) -> ErrorKind {
        match name {
            "TimeoutError" => ErrorKind::Timeout,
            "ConnectionError" => ErrorKind::Connection,
            "WorkerError" => ErrorKind::Worker,
            "AppError" => ErrorKind::App,
            "AppNotFoundError" => ErrorKind::AppNotFound,
            "NoWorkersAvailableError" => ErrorKind::NoWorkersAvailable,
            "ProtocolError" => ErrorKind::Protocol,
            "StashTableNotFoundError" => ErrorKind::StashTableNotFound,
            "StashKeyNotFoundError" => ErrorKind::StashKeyNotFound,
            _ => ErrorKind::Error,
        }
    }
}

/// A typed pool error, symmetric under wire serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: BTreeMap<String, Value>,
}

impl fmt::Display for DirtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.wire_name(), self.message)
    }
}

impl std::error::Error for DirtyError {}

impl DirtyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    pub fn timeout(message: impl Into<String>, timeout_secs: f64) -> Self {
        Self::new(ErrorKind::Timeout, message).with_detail("timeout", timeout_secs)
    }

    pub fn connection(message: impl Into<String>, socket_path: Option<&str>) -> Self {
        let err = Self::new(ErrorKind::Connection, message);
        match socket_path {
            Some(path) => err.with_detail("socket_path", path),
            None => err,
        }
    }

    pub fn worker(message: impl Into<String>, worker_id: Option<u32>) -> Self {
        let err = Self::new(ErrorKind::Worker, message);
        match worker_id {
            Some(pid) => err.with_detail("worker_id", pid),
            None => err,
        }
    }

    pub fn app(
        message: impl Into<String>,
        app_path: &str,
        action: &str,
        traceback: Option<String>,
    ) -> Self {
        let err = Self::new(ErrorKind::App, message)
            .with_detail("app_path", app_path)
            .with_detail("action", action);
        match traceback {
            Some(tb) => err.with_detail("traceback", tb),
            None => err,
        }
    }

    pub fn app_not_found(app_path: &str) -> Self {
        Self::new(ErrorKind::AppNotFound, format!("app not loaded: {app_path}"))
            .with_detail("app_path", app_path)
    }

    pub fn no_workers_available(app_path: &str) -> Self {
        Self::new(
            ErrorKind::NoWorkersAvailable,
            format!("no workers available for app: {app_path}"),
        )
        .with_detail("app_path", app_path)
    }

    pub fn stash_table_not_found(table: &str) -> Self {
        Self::new(
            ErrorKind::StashTableNotFound,
            format!("stash table not found: {table}"),
        )
        .with_detail("table", table)
    }

    pub fn stash_key_not_found(table: &str, key: &str) -> Self {
        Self::new(
            ErrorKind::StashKeyNotFound,
            format!("key not found in {table}: {key}"),
        )
        .with_detail("table", table)
        .with_detail("key", key)
    }

    /// Seconds from the `timeout` detail of a `TimeoutError`.
    pub fn timeout_secs(&self) -> Option<f64> {
        self.details.get("timeout").and_then(Value::as_f64)
    }

    pub fn app_path(&self) -> Option<&str> {
        self.details.get("app_path").and_then(Value::as_str)
    }

    pub fn worker_id(&self) -> Option<u32> {
        self.details
            .get("worker_id")
            .and_then(Value::as_i64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn traceback(&self) -> Option<&str> {
        self.details.get("traceback").and_then(Value::as_str)
    }

    /// The `{"error_type", "message", "details"}` dict carried in ERROR
    /// payloads.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "error_type".to_string(),
            Value::Str(self.kind.wire_name().to_string()),
        );
        map.insert("message".to_string(), Value::Str(self.message.clone()));
        map.insert("details".to_string(), Value::Dict(self.details.clone()));
        Value::Dict(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let dict = value.as_dict().ok_or(ProtocolError::MalformedPayload {
            kind: "error",
            reason: format!("expected dict, got {}", value.type_name()),
        })?;
        let kind = dict
            .get("error_type")
            .and_then(Value::as_str)
            .map(ErrorKind::from_wire_name)
            .unwrap_or(ErrorKind::Error);
        let message = dict
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let details = match dict.get("details") {
            Some(Value::Dict(map)) => map.clone(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            kind,
            message,
            details,
        })
    }
}

impl From<ProtocolError> for DirtyError {
    fn from(err: ProtocolError) -> Self {
        DirtyError::new(ErrorKind::Protocol, err.to_string())
    }
}
