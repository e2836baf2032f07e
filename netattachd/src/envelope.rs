use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-request wire envelope accepted by the dispatch server (spec.md §4.7,
/// "Request envelope"). `env` carries `CNI_COMMAND`/`CNI_CONTAINERID`/
/// `CNI_NETNS`/`CNI_IFNAME`/`CNI_ARGS` plus whatever the front-end forwards
/// from the runtime's process environment; `config` is the raw stdin JSON
/// text of the meta-plugin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub env: HashMap<String, String>,
    pub config: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Kubernetes identity parsed out of the `CNI_ARGS` semicolon-delimited
/// `key=value` list (spec.md §4.7 step 2).
#[derive(Debug, Clone, Default)]
pub struct K8sIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub infra_container_id: Option<String>,
}

pub fn parse_cni_args(cni_args: &str) -> HashMap<String, String> {
    cni_args
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn extract_k8s_identity(cni_args: &str) -> K8sIdentity {
    let parsed = parse_cni_args(cni_args);
    K8sIdentity {
        namespace: parsed.get("K8S_POD_NAMESPACE").cloned().unwrap_or_default(),
        name: parsed.get("K8S_POD_NAME").cloned().unwrap_or_default(),
        uid: parsed.get("K8S_POD_UID").cloned(),
        infra_container_id: parsed.get("K8S_POD_INFRA_CONTAINER_ID").cloned(),
    }
}
