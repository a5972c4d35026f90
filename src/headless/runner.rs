//! Headless runners for the `vmbridge` subcommands
//!
//! `watch` supervises one app and streams [`HeadlessEvent`]s until Ctrl+C or
//! until recovery is exhausted. `call` and `ext` open a single connection,
//! issue one request and disconnect.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use vmbridge_app::{RecoveryGovernor, Settings, Supervisor, SupervisorEvent};
use vmbridge_client::vm_service::is_extension_not_available;
use vmbridge_client::{ClientOptions, VmServiceClient};
use vmbridge_core::prelude::*;
use vmbridge_core::Endpoint;

use super::HeadlessEvent;

/// Supervise `endpoint` and print events until interrupted.
///
/// Returns an error if the app has no isolate or recovery gives up.
pub async fn run_watch(endpoint: Endpoint, settings: &Settings) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("Watching {}", endpoint);
    info!("═══════════════════════════════════════════════════════");

    let governor = Arc::new(RecoveryGovernor::new(settings.recovery.policy()));
    let (supervisor, mut events) =
        Supervisor::new(endpoint, governor, settings.supervisor_options());

    // Print events while start() is still connecting.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let exhausted = matches!(event, SupervisorEvent::Exhausted { .. });
            HeadlessEvent::from(event).emit();
            if exhausted {
                return true;
            }
        }
        false
    });

    if let Err(e) = supervisor
        .start()
        .await
        .with_context(|| format!("Supervising {}", supervisor.target()))
    {
        HeadlessEvent::error(e.to_string(), e.is_fatal()).emit();
        supervisor.stop().await;
        printer.abort();
        return Err(e);
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            Ok(())
        }
        exhausted = printer => match exhausted {
            Ok(true) => Err(Error::recovery_exhausted(supervisor.target())),
            Ok(false) => Ok(()),
            Err(e) => Err(Error::vm_service(format!("event printer failed: {e}"))),
        },
    };

    supervisor.stop().await;
    result
}

/// Issue one raw RPC and return its result.
pub async fn run_call(
    endpoint: Endpoint,
    options: ClientOptions,
    method: &str,
    params: Option<Value>,
) -> Result<Value> {
    with_client(endpoint, options, |client| async move {
        client.call(method, params).await
    })
    .await
}

/// Call a service extension on the main isolate.
///
/// `args` are `key=value` pairs and are sent as strings.
pub async fn run_extension(
    endpoint: Endpoint,
    options: ClientOptions,
    method: &str,
    args: &[String],
) -> Result<Value> {
    let params = parse_extension_args(args)?;
    let result = with_client(endpoint, options, |client| async move {
        client.call_extension_method(method, Some(params)).await
    })
    .await;
    if let Err(e) = &result {
        if is_extension_not_available(e) {
            warn!(
                "{} is not registered; service extensions need a debug build with the framework loaded",
                method
            );
        }
    }
    result
}

async fn with_client<F, Fut>(endpoint: Endpoint, options: ClientOptions, f: F) -> Result<Value>
where
    F: FnOnce(VmServiceClient) -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let target = endpoint.to_string();
    let client = VmServiceClient::with_options(endpoint, options);
    client
        .connect()
        .await
        .with_context(|| format!("Connecting to {target}"))?;
    let result = f(client.clone()).await;
    client.disconnect().await;
    result
}

/// `["key=value", ...]` to a params object.
pub fn parse_extension_args(args: &[String]) -> Result<Value> {
    let mut params = Map::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(Error::protocol(format!(
                "extension argument must be key=value, got {arg:?}"
            )));
        };
        if key.is_empty() {
            return Err(Error::protocol(format!("empty key in {arg:?}")));
        }
        if params
            .insert(key.to_string(), Value::String(value.to_string()))
            .is_some()
        {
            warn!("Duplicate extension argument {}, last value wins", key);
        }
    }
    Ok(Value::Object(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_extension_args() {
        let args = vec!["enabled=true".to_string(), "value=a=b".to_string()];
        let params = parse_extension_args(&args).unwrap();
        assert_eq!(params, json!({ "enabled": "true", "value": "a=b" }));
    }

    #[test]
    fn test_parse_extension_args_rejects_malformed() {
        assert!(parse_extension_args(&["enabled".to_string()]).is_err());
        assert!(parse_extension_args(&["=true".to_string()]).is_err());
    }

    #[test]
    fn test_parse_extension_args_empty() {
        assert_eq!(parse_extension_args(&[]).unwrap(), json!({}));
    }
}
