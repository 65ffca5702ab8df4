//! Built-in tool implementations.
//!
//! Each sub-module implements one (or a small family of) tool(s) the
//! interactive agent can invoke.  Handlers take the raw JSON arguments and
//! return a JSON value that the dispatcher hands back to the model.

pub mod ask_user;
pub mod capability;
pub mod memory;

use serde_json::Value;

/// Fetch a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, tool: &str, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("{tool}: missing `{key}` argument"))
}

/// Collect a string array argument, ignoring non-string items.
pub(crate) fn string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
