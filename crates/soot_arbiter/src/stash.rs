//! Arbiter-resident shared stash: named tables of key-value pairs.
//!
//! All operations run under the arbiter's stash lock, so observed order is
//! message arrival order. State is ephemeral; an arbiter restart loses it.

use std::collections::{BTreeMap, HashMap};

use soot_protocol::{DirtyError, StashOp, StashRequest, Value};

#[derive(Default)]
pub struct Stash {
    tables: HashMap<String, BTreeMap<String, Value>>,
}

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one stash operation and produce its RESPONSE result.
    pub fn handle(&mut self, request: &StashRequest) -> Result<Value, DirtyError> {
        match request.op {
            StashOp::Put => {
                let key = required_key(request)?;
                let value = request
                    .value
                    .clone()
                    .ok_or_else(|| DirtyError::generic("put requires a value"))?;
                self.tables
                    .entry(request.table.clone())
                    .or_default()
                    .insert(key.to_string(), value);
                Ok(Value::Null)
            }
            StashOp::Get => {
                let key = required_key(request)?;
                let table = self.existing_table(&request.table)?;
                table
                    .get(key)
                    .cloned()
                    .ok_or_else(|| DirtyError::stash_key_not_found(&request.table, key))
            }
            StashOp::Delete => {
                let key = required_key(request)?;
                let removed = self
                    .tables
                    .get_mut(&request.table)
                    .map(|table| table.remove(key).is_some())
                    .unwrap_or(false);
                Ok(Value::Bool(removed))
            }
            StashOp::Keys => {
                let table = self.existing_table(&request.table)?;
                let keys: Vec<&String> = match &request.pattern {
                    Some(pattern) => {
                        let matcher = pattern_to_regex(pattern)?;
                        table.keys().filter(|k| matcher.is_match(k)).collect()
                    }
                    None => table.keys().collect(),
                };
                Ok(Value::List(
                    keys.into_iter().map(|k| Value::Str(k.clone())).collect(),
                ))
            }
            StashOp::Clear => {
                let table = self.existing_table_mut(&request.table)?;
                table.clear();
                Ok(Value::Null)
            }
            StashOp::Info => {
                let table = self.existing_table(&request.table)?;
                let mut info = BTreeMap::new();
                info.insert("name".to_string(), Value::Str(request.table.clone()));
                info.insert("size".to_string(), Value::Int(table.len() as i64));
                Ok(Value::Dict(info))
            }
            StashOp::Ensure => {
                self.tables.entry(request.table.clone()).or_default();
                Ok(Value::Null)
            }
            StashOp::DeleteTable => {
                if self.tables.remove(&request.table).is_none() {
                    return Err(DirtyError::stash_table_not_found(&request.table));
                }
                Ok(Value::Null)
            }
            StashOp::Tables => {
                let mut names: Vec<&String> = self.tables.keys().collect();
                names.sort();
                Ok(Value::List(
                    names.into_iter().map(|n| Value::Str(n.clone())).collect(),
                ))
            }
            StashOp::Exists => match &request.key {
                Some(key) => Ok(Value::Bool(
                    self.tables
                        .get(&request.table)
                        .map(|table| table.contains_key(key))
                        .unwrap_or(false),
                )),
                None => Ok(Value::Bool(self.tables.contains_key(&request.table))),
            },
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn existing_table(&self, name: &str) -> Result<&BTreeMap<String, Value>, DirtyError> {
        self.tables
            .get(name)
            .ok_or_else(|| DirtyError::stash_table_not_found(name))
    }

    fn existing_table_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut BTreeMap<String, Value>, DirtyError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DirtyError::stash_table_not_found(name))
    }
}

fn required_key(request: &StashRequest) -> Result<&str, DirtyError> {
    request
        .key
        .as_deref()
        .ok_or_else(|| DirtyError::generic("operation requires a key"))
}

/// Translate a glob pattern (`*` any run, `?` any char) to an anchored
/// regex.
fn pattern_to_regex(pattern: &str) -> Result<regex::Regex, DirtyError> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map_err(|err| DirtyError::generic(format!("invalid key pattern '{pattern}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use soot_protocol::ErrorKind;

    fn put(stash: &mut Stash, table: &str, key: &str, value: Value) {
        stash
            .handle(
                &StashRequest::new(StashOp::Put, table)
                    .with_key(key)
                    .with_value(value),
            )
            .unwrap();
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let mut stash = Stash::new();
        put(&mut stash, "sessions", "user:1", Value::Str("alice".into()));

        let got = stash
            .handle(&StashRequest::new(StashOp::Get, "sessions").with_key("user:1"))
            .unwrap();
        assert_eq!(got, Value::Str("alice".into()));

        let removed = stash
            .handle(&StashRequest::new(StashOp::Delete, "sessions").with_key("user:1"))
            .unwrap();
        assert_eq!(removed, Value::Bool(true));

        let exists = stash
            .handle(&StashRequest::new(StashOp::Exists, "sessions").with_key("user:1"))
            .unwrap();
        assert_eq!(exists, Value::Bool(false));
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut stash = Stash::new();
        stash
            .handle(&StashRequest::new(StashOp::Ensure, "cache"))
            .unwrap();
        stash
            .handle(&StashRequest::new(StashOp::Ensure, "cache"))
            .unwrap();
        assert_eq!(stash.table_count(), 1);
    }

    #[test]
    fn get_missing_key_is_typed() {
        let mut stash = Stash::new();
        stash
            .handle(&StashRequest::new(StashOp::Ensure, "t"))
            .unwrap();
        let err = stash
            .handle(&StashRequest::new(StashOp::Get, "t").with_key("absent"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StashKeyNotFound);
    }

    #[test]
    fn missing_table_is_typed() {
        let mut stash = Stash::new();
        let err = stash
            .handle(&StashRequest::new(StashOp::Get, "nope").with_key("k"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StashTableNotFound);

        let err = stash
            .handle(&StashRequest::new(StashOp::Keys, "nope"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StashTableNotFound);
    }

    #[test]
    fn delete_on_missing_table_is_false() {
        let mut stash = Stash::new();
        let removed = stash
            .handle(&StashRequest::new(StashOp::Delete, "nope").with_key("k"))
            .unwrap();
        assert_eq!(removed, Value::Bool(false));
    }

    #[test]
    fn keys_with_glob_pattern() {
        let mut stash = Stash::new();
        put(&mut stash, "s", "user:1", Value::Int(1));
        put(&mut stash, "s", "user:2", Value::Int(2));
        put(&mut stash, "s", "job:1", Value::Int(3));

        let keys = stash
            .handle(&StashRequest::new(StashOp::Keys, "s").with_pattern("user:*"))
            .unwrap();
        assert_eq!(
            keys,
            Value::List(vec![Value::Str("user:1".into()), Value::Str("user:2".into())])
        );

        let keys = stash
            .handle(&StashRequest::new(StashOp::Keys, "s").with_pattern("???:1"))
            .unwrap();
        assert_eq!(keys, Value::List(vec![Value::Str("job:1".into())]));
    }

    #[test]
    fn pattern_metacharacters_are_literal() {
        let mut stash = Stash::new();
        put(&mut stash, "s", "a.b", Value::Int(1));
        put(&mut stash, "s", "aXb", Value::Int(2));

        let keys = stash
            .handle(&StashRequest::new(StashOp::Keys, "s").with_pattern("a.b"))
            .unwrap();
        assert_eq!(keys, Value::List(vec![Value::Str("a.b".into())]));
    }

    #[test]
    fn clear_info_and_tables() {
        let mut stash = Stash::new();
        put(&mut stash, "a", "k", Value::Int(1));
        put(&mut stash, "b", "k", Value::Int(2));

        let info = stash
            .handle(&StashRequest::new(StashOp::Info, "a"))
            .unwrap();
        assert_eq!(info.get("size"), Some(&Value::Int(1)));

        stash
            .handle(&StashRequest::new(StashOp::Clear, "a"))
            .unwrap();
        let info = stash
            .handle(&StashRequest::new(StashOp::Info, "a"))
            .unwrap();
        assert_eq!(info.get("size"), Some(&Value::Int(0)));

        let tables = stash.handle(&StashRequest::new(StashOp::Tables, "")).unwrap();
        assert_eq!(
            tables,
            Value::List(vec![Value::Str("a".into()), Value::Str("b".into())])
        );

        stash
            .handle(&StashRequest::new(StashOp::DeleteTable, "a"))
            .unwrap();
        let tables = stash.handle(&StashRequest::new(StashOp::Tables, "")).unwrap();
        assert_eq!(tables, Value::List(vec![Value::Str("b".into())]));
    }
}
