//! One-shot `call` / `ext` runners against the stub VM Service.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use flutter_vm_bridge::{run_call, run_extension};
use vmbridge_client::test_utils::{dead_endpoint, default_reply, StubReply, StubVmService};
use vmbridge_client::vm_service::is_extension_not_available;
use vmbridge_client::ClientOptions;
use vmbridge_core::Error;

#[tokio::test]
async fn test_call_returns_result() {
    let stub = StubVmService::start().await;

    let result = assert_ok!(run_call(stub.endpoint(), ClientOptions::default(), "getVM", None).await);

    assert_eq!(result["type"], "VM");
    assert_eq!(result["isolates"][0]["id"], "isolates/1");
}

#[tokio::test]
async fn test_call_passes_params() {
    let stub = StubVmService::start().await;

    assert_ok!(
        run_call(
            stub.endpoint(),
            ClientOptions::default(),
            "getIsolate",
            Some(json!({ "isolateId": "isolates/1" })),
        )
        .await
    );

    let requests = stub.requests_for("getIsolate");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].params["isolateId"], "isolates/1");
}

#[tokio::test]
async fn test_call_surfaces_remote_error() {
    let stub = StubVmService::start().await;

    let err = assert_err!(run_call(stub.endpoint(), ClientOptions::default(), "bogus", None).await);

    assert!(matches!(err, Error::RemoteError { code: -32601, .. }));
}

#[tokio::test]
async fn test_call_unreachable_target() {
    let endpoint = dead_endpoint().await;

    let err = assert_err!(run_call(endpoint, ClientOptions::default(), "getVM", None).await);

    assert!(matches!(err, Error::ConnectFailed { .. }));
}

#[tokio::test]
async fn test_extension_fills_isolate_and_string_args() {
    let stub = StubVmService::start_with(Arc::new(|method: &str, params: &Value| {
        if method == "ext.flutter.debugPaint" {
            StubReply::Result(json!({ "type": "_extensionType", "enabled": params["enabled"] }))
        } else {
            default_reply(method, params)
        }
    }))
    .await;

    let result = assert_ok!(
        run_extension(
            stub.endpoint(),
            ClientOptions::default(),
            "ext.flutter.debugPaint",
            &["enabled=true".to_string()],
        )
        .await
    );

    assert_eq!(result["enabled"], "true");
    let requests = stub.requests_for("ext.flutter.debugPaint");
    assert_eq!(requests[0].params["isolateId"], "isolates/1");
    assert_eq!(requests[0].params["enabled"], "true");
}

#[tokio::test]
async fn test_extension_rejects_malformed_args_before_connecting() {
    let stub = StubVmService::start().await;

    assert_err!(
        run_extension(
            stub.endpoint(),
            ClientOptions::default(),
            "ext.flutter.debugPaint",
            &["enabled".to_string()],
        )
        .await
    );

    assert_eq!(stub.connection_count(), 0);
}

#[tokio::test]
async fn test_extension_not_registered_is_recognised() {
    let stub = StubVmService::start().await;

    let err = assert_err!(
        run_extension(
            stub.endpoint(),
            ClientOptions::default(),
            "ext.flutter.debugPaint",
            &[],
        )
        .await
    );

    assert!(is_extension_not_available(&err));
    assert_eq!(stub.connection_count(), 1);
}
