//! Client for the arbiter-resident stash tables.
//!
//! Named key-value tables held in the arbiter process, shared by every
//! worker and request handler through the same RPC socket. Tables are
//! created lazily on first `put`/`ensure` and are ephemeral: an arbiter
//! restart empties the stash.

use std::path::PathBuf;
use std::time::Duration;

use soot_protocol::{DirtyError, ErrorKind, Frame, StashOp, StashRequest, Value};

use crate::blocking::DirtyClient;
use crate::next_request_id;

/// Blocking stash client.
pub struct StashClient {
    client: DirtyClient,
}

impl StashClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: DirtyClient::new(socket_path),
        }
    }

    pub fn from_env() -> Result<Self, DirtyError> {
        Ok(Self {
            client: DirtyClient::from_env()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client = self.client.with_timeout(timeout);
        self
    }

    /// Store a value; the table is created if missing.
    pub fn put(&self, table: &str, key: &str, value: Value) -> Result<(), DirtyError> {
        self.call(
            StashRequest::new(StashOp::Put, table)
                .with_key(key)
                .with_value(value),
        )?;
        Ok(())
    }

    /// Fetch a value; `None` when the key is absent.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Value>, DirtyError> {
        match self.call(StashRequest::new(StashOp::Get, table).with_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind == ErrorKind::StashKeyNotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Delete a key; returns whether it existed.
    pub fn delete(&self, table: &str, key: &str) -> Result<bool, DirtyError> {
        let result = self.call(StashRequest::new(StashOp::Delete, table).with_key(key))?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Whether a table (or a key within it) exists.
    pub fn exists(&self, table: &str, key: Option<&str>) -> Result<bool, DirtyError> {
        let mut request = StashRequest::new(StashOp::Exists, table);
        if let Some(key) = key {
            request = request.with_key(key);
        }
        let result = self.call(request)?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Keys of a table, optionally filtered by a glob pattern (`*`, `?`).
    pub fn keys(&self, table: &str, pattern: Option<&str>) -> Result<Vec<String>, DirtyError> {
        let mut request = StashRequest::new(StashOp::Keys, table);
        if let Some(pattern) = pattern {
            request = request.with_pattern(pattern);
        }
        let result = self.call(request)?;
        Ok(string_list(&result))
    }

    /// Remove every entry of a table.
    pub fn clear(&self, table: &str) -> Result<(), DirtyError> {
        self.call(StashRequest::new(StashOp::Clear, table))?;
        Ok(())
    }

    /// Create a table if it does not exist. Idempotent.
    pub fn ensure(&self, table: &str) -> Result<(), DirtyError> {
        self.call(StashRequest::new(StashOp::Ensure, table))?;
        Ok(())
    }

    /// Drop a whole table.
    pub fn delete_table(&self, table: &str) -> Result<(), DirtyError> {
        self.call(StashRequest::new(StashOp::DeleteTable, table))?;
        Ok(())
    }

    /// Table metadata (`{"name", "size"}`).
    pub fn info(&self, table: &str) -> Result<Value, DirtyError> {
        self.call(StashRequest::new(StashOp::Info, table))
    }

    /// Names of all tables.
    pub fn tables(&self) -> Result<Vec<String>, DirtyError> {
        let result = self.call(StashRequest::new(StashOp::Tables, ""))?;
        Ok(string_list(&result))
    }

    /// A handle bound to one table.
    pub fn table<'a>(&'a self, name: &str) -> StashTable<'a> {
        StashTable {
            client: self,
            name: name.to_string(),
        }
    }

    pub fn close(&self) {
        self.client.close();
    }

    fn call(&self, request: StashRequest) -> Result<Value, DirtyError> {
        let reply = self
            .client
            .roundtrip(&Frame::stash(next_request_id(), &request))?;
        match reply.msg_type {
            soot_protocol::MsgType::Response => Ok(reply.result()?.clone()),
            soot_protocol::MsgType::Error => Err(reply.dirty_error()?),
            other => Err(DirtyError::from(
                soot_protocol::ProtocolError::UnexpectedMessage { found: other },
            )),
        }
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_list()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Convenience handle over one stash table.
pub struct StashTable<'a> {
    client: &'a StashClient,
    name: String,
}

impl StashTable<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, key: &str, value: Value) -> Result<(), DirtyError> {
        self.client.put(&self.name, key, value)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, DirtyError> {
        self.client.get(&self.name, key)
    }

    pub fn delete(&self, key: &str) -> Result<bool, DirtyError> {
        self.client.delete(&self.name, key)
    }

    pub fn contains(&self, key: &str) -> Result<bool, DirtyError> {
        self.client.exists(&self.name, Some(key))
    }

    pub fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, DirtyError> {
        self.client.keys(&self.name, pattern)
    }

    pub fn clear(&self) -> Result<(), DirtyError> {
        self.client.clear(&self.name)
    }

    pub fn len(&self) -> Result<usize, DirtyError> {
        let info = self.client.info(&self.name)?;
        Ok(info
            .get("size")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, DirtyError> {
        Ok(self.len()? == 0)
    }
}
