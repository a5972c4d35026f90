//! Flutter service extension calls.
//!
//! Service extensions are ordinary JSON-RPC methods registered by the app,
//! named `ext.flutter.<name>` (or `ext.<package>.<name>` for custom ones).
//! They all follow the same rules:
//!
//! - `isolateId` is required and names the isolate that registered them.
//! - Every other parameter value must be a string.
//!
//! In profile/release builds, or before the framework has registered them,
//! the VM answers with `-32601 Method not found`. Use
//! [`is_extension_not_available`] to tell that apart from a real failure.

use std::collections::HashMap;

use serde_json::{Map, Value};

use vmbridge_core::prelude::*;

use super::client::VmServiceClient;

/// JSON-RPC "Method not found".
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;

/// Some VM versions use this for unregistered extensions.
pub const EXTENSION_NOT_AVAILABLE_CODE: i32 = 113;

impl VmServiceClient {
    /// Call an extension on `isolate_id` with string arguments.
    pub async fn call_extension(
        &self,
        method: &str,
        isolate_id: &str,
        args: Option<HashMap<String, String>>,
    ) -> Result<Value> {
        let params = build_extension_params(isolate_id, args);
        self.call(method, Some(params)).await
    }

    /// Call an extension with free-form params.
    ///
    /// If `params` has no `isolateId`, the main isolate is filled in.
    /// Non-string values other than `isolateId` are stringified.
    pub async fn call_extension_method(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut map = match params {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(Error::protocol(format!(
                    "extension params must be an object, got {other}"
                )))
            }
        };

        if !map.contains_key("isolateId") {
            let isolate_id = self.main_isolate_id().await?;
            map.insert("isolateId".to_string(), Value::String(isolate_id));
        }

        let params = map
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(_) => value,
                    other => Value::String(other.to_string()),
                };
                (key, value)
            })
            .collect();

        self.call(method, Some(Value::Object(params))).await
    }
}

/// `{"isolateId": ..., <args>...}` for an extension call.
///
/// An `isolateId` entry in `args` does not override the explicit one.
pub fn build_extension_params(isolate_id: &str, args: Option<HashMap<String, String>>) -> Value {
    let mut params = Map::new();
    for (key, value) in args.unwrap_or_default() {
        params.insert(key, Value::String(value));
    }
    params.insert("isolateId".to_string(), Value::String(isolate_id.to_string()));
    Value::Object(params)
}

/// `true` if `error` means the extension is not registered.
pub fn is_extension_not_available(error: &Error) -> bool {
    match error {
        Error::RemoteError { code, message, .. } => {
            if *code == METHOD_NOT_FOUND_CODE || *code == EXTENSION_NOT_AVAILABLE_CODE {
                return true;
            }
            let msg = message.to_lowercase();
            msg.contains("method not found") || msg.contains("extension not available")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_build_extension_params_isolate_only() {
        let params = build_extension_params("isolates/1", None);
        assert_eq!(params, json!({ "isolateId": "isolates/1" }));
    }

    #[test]
    fn test_build_extension_params_with_args() {
        let mut args = HashMap::new();
        args.insert("enabled".to_string(), "true".to_string());
        let params = build_extension_params("isolates/1", Some(args));
        assert_eq!(params["enabled"], "true");
        assert_eq!(params["isolateId"], "isolates/1");
    }

    #[test]
    fn test_build_extension_params_isolate_id_wins() {
        let mut args = HashMap::new();
        args.insert("isolateId".to_string(), "isolates/other".to_string());
        let params = build_extension_params("isolates/1", Some(args));
        assert_eq!(params["isolateId"], "isolates/1");
    }

    #[test]
    fn test_is_extension_not_available() {
        assert!(is_extension_not_available(&Error::remote(
            -32601,
            "Method not found",
            None
        )));
        assert!(is_extension_not_available(&Error::remote(
            113,
            "Extension not available",
            None
        )));
        assert!(is_extension_not_available(&Error::remote(
            -32000,
            "Server error: method not found",
            None
        )));
        assert!(!is_extension_not_available(&Error::remote(
            -32000,
            "Unexpected DWDS error",
            None
        )));
        assert!(!is_extension_not_available(&Error::NotConnected));
    }
}
