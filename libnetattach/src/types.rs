use std::collections::HashMap;
use std::net::IpAddr;

use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};

/// Root configuration for one attachment attempt — the decoded stdin of the
/// front-end binary, forwarded verbatim into the dispatch-server envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "binDir", default)]
    pub bin_dir: String,
    #[serde(rename = "cniDir", default)]
    pub cni_dir: String,
    #[serde(rename = "kubeconfig", default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(rename = "clusterNetwork", default, skip_serializing_if = "Option::is_none")]
    pub cluster_network: Option<String>,
    #[serde(rename = "defaultNetworks", default)]
    pub default_networks: Vec<String>,
    /// Raw inline plugin configs; resolved into [`Delegate`]s by the resolver.
    #[serde(default)]
    pub delegates: Vec<serde_json::Value>,
    #[serde(rename = "runtimeConfig", default)]
    pub runtime_config: HashMap<String, serde_json::Value>,
    #[serde(rename = "systemNamespaces", default)]
    pub system_namespaces: Vec<String>,
    #[serde(rename = "readinessIndicatorFile", default)]
    pub readiness_indicator_file: String,
    #[serde(rename = "retryDeleteOnError", default)]
    pub retry_delete_on_error: bool,
}

/// The ephemeral identity of one pod attachment attempt (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct PodIdentity {
    pub container_id: String,
    pub sandbox_id: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub netns_path: String,
    pub if_name: String,
    /// Resource name -> device ID, as handed down by the (out-of-scope)
    /// device-plugin resource-hint source for this pod (spec.md §4.1 step 4).
    pub device_resources: HashMap<String, String>,
}

impl PodIdentity {
    pub fn cache_key(&self) -> String {
        self.container_id.clone()
    }
}

/// Either a single plugin config (`Conf`) or an ordered chain sharing a
/// network name (`ConfList`). Modeled as a tagged sum rather than an
/// inheritance hierarchy per spec.md §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DelegateConf {
    Conf {
        #[serde(rename = "type")]
        plugin_type: String,
    },
    ConfList {
        plugins: Vec<serde_json::Value>,
    },
}

impl DelegateConf {
    pub fn is_conf_list(&self) -> bool {
        matches!(self, DelegateConf::ConfList { .. })
    }
}

/// One plugin invocation unit within a delegate pipeline, with all
/// decoration attributes a resolver may have populated.
#[derive(Debug, Clone, Getters, Setters, Serialize, Deserialize)]
#[getset(get = "pub", set = "pub")]
pub struct Delegate {
    pub conf: DelegateConf,
    /// `Conf.Type` or `ConfList.Name` — used to enrich error messages.
    pub name: String,
    pub master_plugin: bool,
    pub ifname_request: Option<String>,
    pub mac_request: Option<String>,
    pub ip_request: Vec<String>,
    pub gateway_request: Vec<IpAddr>,
    pub is_filter_v4_gateway: bool,
    pub is_filter_v6_gateway: bool,
    pub resource_name: Option<String>,
    pub device_id: Option<String>,
    /// Loaded from the device-plugin's info file once `device_id` is known
    /// (spec.md §4.1 step 4, §6).
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
    /// The exact bytes given to the child plugin on stdin (single-conf or
    /// full conf-list JSON, with `name`/`cniVersion`/`prevResult` spliced in
    /// per delegate invocation).
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl Delegate {
    pub fn new(conf: DelegateConf, name: impl Into<String>) -> Self {
        Delegate {
            conf,
            name: name.into(),
            master_plugin: false,
            ifname_request: None,
            mac_request: None,
            ip_request: Vec::new(),
            gateway_request: Vec::new(),
            is_filter_v4_gateway: false,
            is_filter_v6_gateway: false,
            resource_name: None,
            device_id: None,
            device_info: None,
            bytes: Vec::new(),
        }
    }
}

/// Ordered per-delegate outputs plus the promoted representative result
/// (spec.md §3 "PipelineResult").
#[derive(Default)]
pub struct PipelineResult {
    pub per_delegate: Vec<Box<dyn libcni::rust_cni::result::APIResult>>,
    pub representative: Option<Box<dyn libcni::rust_cni::result::APIResult>>,
    pub device_info: HashMap<String, serde_json::Value>,
}
