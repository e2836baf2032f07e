use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::{Response, StatusCode};
use hyper::{Body, Request};
use log::{error, warn};
use tokio::net::UnixListener;

use libnetattach::pipeline::DelegatePipeline;
use libnetattach::podstore::{lookup_pod_with_retry, PodStore};
use libnetattach::types::{NetConf, PodIdentity};

use crate::envelope::{extract_k8s_identity, RequestEnvelope, ResponseEnvelope};

const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Shared server state handed to every connection (spec.md §4.7).
pub struct Context {
    pub pipeline: Arc<DelegatePipeline>,
    pub podstore: Option<Arc<dyn PodStore>>,
}

/// Runs the accept loop on an already-bound, already-permission-hardened
/// UNIX socket listener. Each connection is served on its own task; server
/// shutdown (the listener being dropped) lets in-flight requests finish.
pub async fn serve(listener: UnixListener, ctx: Arc<Context>) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(handle(ctx, req).await) }
            });

            if let Err(e) = hyper::server::conn::Http::new().serve_connection(stream, service).await {
                warn!("connection error: {e}");
            }
        });
    }
}

async fn handle(ctx: Arc<Context>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")),
    };

    let envelope: RequestEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("malformed request envelope: {e}")),
    };

    match tokio::time::timeout(REQUEST_DEADLINE, dispatch(ctx, envelope)).await {
        Ok(Ok(resp)) => json_response(StatusCode::OK, &resp),
        Ok(Err(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(_) => error_response(StatusCode::BAD_REQUEST, "request exceeded the one-minute deadline".into()),
    }
}

/// One full per-request lifecycle: decode, dispatch on verb, respond
/// (spec.md §4.7 steps 2-5).
async fn dispatch(ctx: Arc<Context>, envelope: RequestEnvelope) -> anyhow::Result<ResponseEnvelope> {
    let command = envelope.env.get("CNI_COMMAND").cloned().unwrap_or_default();
    let cni_args = envelope.env.get("CNI_ARGS").cloned().unwrap_or_default();
    let mut identity = extract_k8s_identity(&cni_args);

    let netconf: NetConf = serde_json::from_str(&envelope.config)?;

    let is_del = command.eq_ignore_ascii_case("DEL");

    let pod_record = if let Some(store) = &ctx.podstore {
        lookup_pod_with_retry(store.as_ref(), &identity.namespace, &identity.name, identity.uid.as_deref(), is_del).await?
    } else {
        None
    };

    if identity.uid.is_none() {
        if let Some(record) = &pod_record {
            identity.uid = Some(record.uid.clone());
        }
    }

    let pod = PodIdentity {
        container_id: envelope.env.get("CNI_CONTAINERID").cloned().unwrap_or_default(),
        sandbox_id: identity
            .infra_container_id
            .clone()
            .unwrap_or_else(|| envelope.env.get("CNI_CONTAINERID").cloned().unwrap_or_default()),
        namespace: identity.namespace.clone(),
        name: identity.name.clone(),
        uid: identity.uid.clone(),
        netns_path: envelope.env.get("CNI_NETNS").cloned().unwrap_or_default(),
        if_name: envelope.env.get("CNI_IFNAME").cloned().unwrap_or_default(),
        // No kubelet podresources client is wired into netattachd; device-plugin
        // resource hints arrive empty until that source is integrated.
        device_resources: std::collections::HashMap::new(),
    };

    match command.as_str() {
        "ADD" => {
            let result = ctx.pipeline.add(&netconf, &pod, pod_record.as_ref()).await?;
            let body = result
                .representative
                .as_ref()
                .map(|r| r.get_json().dump())
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            Ok(ResponseEnvelope { result: body, error: None })
        }
        "CHECK" => {
            ctx.pipeline.check(&netconf, &pod, pod_record.as_ref()).await?;
            Ok(ResponseEnvelope::default())
        }
        "DEL" => {
            ctx.pipeline.delete(&netconf, &pod, pod_record.as_ref()).await?;
            Ok(ResponseEnvelope::default())
        }
        other => {
            // Any other verb is silently ignored (spec.md §4.7 step 4).
            warn!("ignoring unsupported CNI_COMMAND \"{other}\"");
            Ok(ResponseEnvelope::default())
        }
    }
}

fn json_response(status: StatusCode, body: &ResponseEnvelope) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Every failure path responds 400 with a plain-text body (spec.md §6);
/// only success responses carry the JSON envelope.
fn error_response(status: StatusCode, message: String) -> Response<Body> {
    error!("request failed: {message}");
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(message))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
