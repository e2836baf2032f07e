use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{NetAttachError, Result};
use crate::podstore::{NetworkDefinitionStore, PodRecord};
use crate::types::{Delegate, DelegateConf, NetConf};

const NETWORK_SELECTION_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

const READINESS_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const READINESS_MAX_INTERVAL: Duration = Duration::from_secs(5);
const READINESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Identifiers the runtime hands the resolver alongside the decoded
/// `NetConf` (spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct RuntimeArgs {
    pub container_id: String,
    pub sandbox_id: String,
    pub netns_path: String,
    pub arg_if_name: String,
}

/// One element of a parsed network-selection annotation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct NetworkSelection {
    #[serde(default)]
    namespace: Option<String>,
    name: String,
    #[serde(default, rename = "interface")]
    interface_request: Option<String>,
    #[serde(default, rename = "mac")]
    mac_request: Option<String>,
    #[serde(default, rename = "ips")]
    ip_request: Vec<String>,
    #[serde(default, rename = "default-route")]
    gateway_request: Vec<IpAddr>,
}

/// Combines stdin net-conf, pod annotations, cluster-default conf, and
/// device-plugin resource hints into the ordered delegate list a pipeline
/// run consumes (spec.md §4.1).
pub struct AttachmentResolver<'a> {
    pub netconf: &'a NetConf,
    pub pod: Option<&'a PodRecord>,
    pub runtime_args: &'a RuntimeArgs,
    pub netdef_store: Option<&'a dyn NetworkDefinitionStore>,
    /// Resource name -> device ID, supplied by the device-plugin integration.
    pub device_resources: HashMap<String, String>,
}

impl<'a> AttachmentResolver<'a> {
    pub async fn resolve(&self) -> Result<Vec<Delegate>> {
        if !self.netconf.readiness_indicator_file.is_empty() {
            wait_for_readiness(&self.netconf.readiness_indicator_file).await?;
        }

        let mut delegates = Vec::new();

        if let Some(cluster_network) = self.netconf.cluster_network.as_deref().filter(|s| !s.is_empty()) {
            let store = self
                .netdef_store
                .ok_or_else(|| NetAttachError::Input("clusterNetwork set but no NetworkDefinitionStore available".into()))?;
            let raw_list = store.get_network(cluster_network).await?;
            let mut cluster_delegates = expand_raw_list(&raw_list, cluster_network)?;
            if let Some(first) = cluster_delegates.first_mut() {
                first.master_plugin = true;
            }
            delegates.append(&mut cluster_delegates);

            for default_net in &self.netconf.default_networks {
                let raw = store.get_network(default_net).await?;
                delegates.extend(expand_raw_list(&raw, default_net)?);
            }
        }

        for raw in &self.netconf.delegates {
            delegates.push(delegate_from_raw(raw, None)?);
        }

        if let Some(pod) = self.pod {
            if let Some(annotation) = pod.annotations.get(NETWORK_SELECTION_ANNOTATION) {
                let selections = parse_network_selection(annotation)?;
                for sel in selections {
                    let mut delegate = self.resolve_selection(&sel).await?;
                    apply_overrides(&mut delegate, &sel);
                    delegates.push(delegate);
                }
            }
        }

        for delegate in &mut delegates {
            if let Some(resource) = delegate.resource_name.clone() {
                if let Some(device_id) = self.device_resources.get(&resource) {
                    delegate.device_id = Some(device_id.clone());
                    match crate::device_info::load_dp_device_info(&resource, device_id) {
                        Ok(info) => delegate.device_info = info,
                        Err(e) => warn!("failed to read device-plugin info file for resource \"{resource}\": {e}"),
                    }
                }
            }
        }

        if delegates.is_empty() {
            return Err(NetAttachError::NoDelegates);
        }

        if !delegates.iter().any(|d| d.master_plugin) {
            if let Some(first) = delegates.first_mut() {
                first.master_plugin = true;
            }
        }

        Ok(delegates)
    }

    async fn resolve_selection(&self, sel: &NetworkSelection) -> Result<Delegate> {
        let store = self
            .netdef_store
            .ok_or_else(|| NetAttachError::Input("pod network-selection annotation set but no NetworkDefinitionStore available".into()))?;
        let qualified = match &sel.namespace {
            Some(ns) => format!("{ns}/{}", sel.name),
            None => sel.name.clone(),
        };
        let raw = store.get_network(&qualified).await?;
        let mut delegates = expand_raw_list(&raw, &sel.name)?;
        delegates
            .pop()
            .ok_or_else(|| NetAttachError::Input(format!("network-attachment-definition \"{qualified}\" resolved to no plugin")))
    }
}

fn apply_overrides(delegate: &mut Delegate, sel: &NetworkSelection) {
    if let Some(ifname) = &sel.interface_request {
        delegate.ifname_request = Some(ifname.clone());
    }
    if let Some(mac) = &sel.mac_request {
        delegate.mac_request = Some(mac.clone());
    }
    if !sel.ip_request.is_empty() {
        delegate.ip_request = sel.ip_request.clone();
    }
    if !sel.gateway_request.is_empty() {
        delegate.gateway_request = sel.gateway_request.clone();
    }
}

/// Parses the network-selection annotation: either a comma-separated list
/// of `ns/name@ifname` (or shorter forms) or a JSON array of selection
/// objects (spec.md §4.1 step 3).
fn parse_network_selection(annotation: &str) -> Result<Vec<NetworkSelection>> {
    let trimmed = annotation.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| NetAttachError::Input(format!("invalid network-selection JSON: {e}")));
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_short_form)
        .collect()
}

fn parse_short_form(entry: &str) -> Result<NetworkSelection> {
    let (name_part, interface_request) = match entry.split_once('@') {
        Some((n, iface)) => (n, Some(iface.to_string())),
        None => (entry, None),
    };
    let (namespace, name) = match name_part.split_once('/') {
        Some((ns, n)) => (Some(ns.to_string()), n.to_string()),
        None => (None, name_part.to_string()),
    };
    if name.is_empty() {
        return Err(NetAttachError::Input(format!("invalid network selection entry \"{entry}\"")));
    }
    Ok(NetworkSelection {
        namespace,
        name,
        interface_request,
        mac_request: None,
        ip_request: Vec::new(),
        gateway_request: Vec::new(),
    })
}

fn expand_raw_list(raw_list: &[Value], name_hint: &str) -> Result<Vec<Delegate>> {
    raw_list.iter().map(|v| delegate_from_raw(v, Some(name_hint.to_string()))).collect()
}

fn delegate_from_raw(value: &Value, name_hint: Option<String>) -> Result<Delegate> {
    let bytes = serde_json::to_vec(value)?;

    let conf = if value.get("plugins").is_some() {
        let plugins = value
            .get("plugins")
            .and_then(|p| p.as_array())
            .cloned()
            .ok_or_else(|| NetAttachError::Input("conf-list \"plugins\" is not an array".into()))?;
        DelegateConf::ConfList { plugins }
    } else {
        let plugin_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| NetAttachError::Input("delegate config has neither \"type\" nor \"plugins\"".into()))?
            .to_string();
        DelegateConf::Conf { plugin_type }
    };

    let name = value
        .get("name")
        .and_then(|n| n.as_str())
        .map(String::from)
        .or(name_hint)
        .unwrap_or_default();

    let mut delegate = Delegate::new(conf, name);
    delegate.bytes = bytes;
    Ok(delegate)
}


async fn wait_for_readiness(path: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    let mut interval = READINESS_INITIAL_INTERVAL;

    loop {
        if std::path::Path::new(path).exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("readiness indicator file {path} never appeared within {READINESS_TIMEOUT:?}");
            return Err(NetAttachError::Input(format!("readiness indicator file \"{path}\" did not appear")));
        }
        debug!("readiness indicator file {path} missing, retrying in {interval:?}");
        tokio::time::sleep(interval).await;
        interval = std::cmp::min(interval * 2, READINESS_MAX_INTERVAL);
    }
}
