use std::collections::HashMap;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::models::FlagValue;

/// In-memory store of resolved flag values, exclusively owned by one client.
///
/// An entry holding [`FlagValue::Null`] is a cached absence: the flag was
/// resolved and the server had nothing for it, so it is not re-fetched. A
/// missing entry means the flag was never resolved and a fetch is permitted.
#[derive(Debug, Default)]
pub(crate) struct FlagCache {
    entries: HashMap<String, FlagValue>,
}

impl FlagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, flag: &str) -> Option<&FlagValue> {
        self.entries.get(flag)
    }

    pub fn insert(&mut self, flag: String, value: FlagValue) {
        self.entries.insert(flag, value);
    }

    /// Deep copy of the full mapping, suitable as a test fixture.
    pub fn snapshot(&self) -> HashMap<String, FlagValue> {
        self.entries.clone()
    }

    /// Discard all prior entries in favor of `state`.
    pub fn replace(&mut self, state: HashMap<String, FlagValue>) {
        self.entries = state;
    }

    /// Overlay `state` on top of the current entries, keeping anything it
    /// does not mention.
    pub fn merge(&mut self, state: HashMap<String, FlagValue>) {
        self.entries.extend(state);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Flattens a bulk `all_flags_values` response into flag names.
///
/// Nested objects become dot-joined names (`parent.child`); scalar and null
/// leaves become flag values. Arrays have no flag representation and make the
/// whole response malformed.
pub(crate) fn flatten_flag_tree(root: Value) -> Result<HashMap<String, FlagValue>> {
    let Value::Object(map) = root else {
        bail!("bulk flag response must be a JSON object");
    };
    let mut flags = HashMap::new();
    for (key, value) in map {
        flatten_into(key, value, &mut flags)?;
    }
    Ok(flags)
}

fn flatten_into(name: String, value: Value, flags: &mut HashMap<String, FlagValue>) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(format!("{name}.{key}"), child, flags)?;
            }
        }
        leaf => {
            flags.insert(name, FlagValue::try_from(leaf)?);
        }
    }
    Ok(())
}
