use std::sync::Arc;

use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use tokio::net::UnixListener;

use libnetattach::executor::SubprocessExecutor;
use libnetattach::pipeline::DelegatePipeline;
use netattachd::server;

// These hit the dispatch server over a real UNIX socket but never reach a
// delegate invocation, so (unlike libnetattach's pipeline tests) they don't
// need root or a real network namespace: an unsupported CNI_COMMAND is a
// no-op before the pipeline is ever touched, and a malformed envelope is
// rejected before the verb is even read.

async fn spawn_server() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("netattach.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let cni_dir = dir.path().join("cni");
    let pipeline = DelegatePipeline::new(Arc::new(SubprocessExecutor::default()), None, None, cni_dir);
    let ctx = Arc::new(server::Context {
        pipeline: Arc::new(pipeline),
        podstore: None,
    });

    tokio::spawn(async move {
        server::serve(listener, ctx).await;
    });

    // keep the tempdir alive for the socket's lifetime by leaking it; the
    // OS cleans up /tmp eventually and the test process is short-lived.
    std::mem::forget(dir);
    socket_path
}

async fn post(socket_path: &std::path::Path, body: &str) -> (hyper::StatusCode, Vec<u8>) {
    let client = Client::unix();
    let uri: hyper::Uri = Uri::new(socket_path, "/").into();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();

    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn unsupported_verb_is_a_no_op_over_the_wire() {
    let socket_path = spawn_server().await;

    let body = serde_json::json!({
        "env": {"CNI_COMMAND": "VERSION"},
        "config": "{\"cniVersion\":\"0.4.0\"}",
    })
    .to_string();

    let (status, bytes) = post(&socket_path, &body).await;
    assert_eq!(status, hyper::StatusCode::OK);
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value, serde_json::json!({}));
}

#[tokio::test]
async fn malformed_envelope_is_rejected() {
    let socket_path = spawn_server().await;

    let (status, bytes) = post(&socket_path, "not json").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);
    assert!(!bytes.is_empty(), "400 responses carry a plain-text error body");
}

#[tokio::test]
async fn malformed_netconf_inside_a_well_formed_envelope_is_rejected() {
    let socket_path = spawn_server().await;

    let body = serde_json::json!({
        "env": {"CNI_COMMAND": "ADD"},
        "config": "not json",
    })
    .to_string();

    let (status, bytes) = post(&socket_path, &body).await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST, "every dispatch failure is a plain 400, not a 5xx");
    assert!(!bytes.is_empty());
}
