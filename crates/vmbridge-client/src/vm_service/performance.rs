//! Heap statistics via `getMemoryUsage`.

use serde_json::{json, Value};

use vmbridge_core::prelude::*;
use vmbridge_core::MemoryUsage;

use super::client::VmServiceClient;

impl VmServiceClient {
    /// Fetch current heap usage for an isolate.
    ///
    /// # Errors
    ///
    /// The usual call errors, or [`Error::Protocol`] if the response lacks
    /// one of the byte counters.
    pub async fn get_memory_usage(&self, isolate_id: &str) -> Result<MemoryUsage> {
        let result = self
            .call("getMemoryUsage", Some(json!({ "isolateId": isolate_id })))
            .await?;
        parse_memory_usage(&result)
    }
}

/// Parse a `getMemoryUsage` response into [`MemoryUsage`].
///
/// Expects `heapUsage`, `heapCapacity` and `externalUsage` as unsigned
/// integers (bytes).
///
/// # Errors
///
/// Returns [`Error::Protocol`] if any of them is missing or not a number.
pub fn parse_memory_usage(result: &Value) -> Result<MemoryUsage> {
    let field = |name: &str| {
        result
            .get(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::protocol(format!("missing {name} in getMemoryUsage response")))
    };

    Ok(MemoryUsage {
        heap_usage: field("heapUsage")?,
        heap_capacity: field("heapCapacity")?,
        external_usage: field("externalUsage")?,
        timestamp: chrono::Local::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_usage() {
        let usage = parse_memory_usage(&json!({
            "type": "MemoryUsage",
            "heapUsage": 52428800u64,
            "heapCapacity": 104857600u64,
            "externalUsage": 10485760u64
        }))
        .unwrap();

        assert_eq!(usage.heap_usage, 52_428_800);
        assert_eq!(usage.heap_capacity, 104_857_600);
        assert_eq!(usage.external_usage, 10_485_760);
    }

    #[test]
    fn test_parse_memory_usage_missing_field() {
        let err = parse_memory_usage(&json!({ "heapUsage": 1, "heapCapacity": 2 })).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(err.to_string().contains("externalUsage"));
    }

    #[test]
    fn test_parse_memory_usage_rejects_negative() {
        let result = parse_memory_usage(&json!({
            "heapUsage": -1,
            "heapCapacity": 2,
            "externalUsage": 0
        }));
        assert!(result.is_err());
    }
}
