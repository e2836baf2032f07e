use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::podstore::PodStore;
use crate::types::PipelineResult;

/// One network-attachment status entry, the shape published as the pod
/// annotation (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Default)]
pub struct AttachmentStatus {
    pub name: String,
    pub default: bool,
    pub interface: Option<String>,
    pub mac: Option<String>,
    pub mtu: Option<u32>,
    pub ips: Vec<String>,
    pub gateway: Vec<String>,
    pub dns: DnsStatus,
    #[serde(rename = "deviceInfo", skip_serializing_if = "Option::is_none")]
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DnsStatus {
    pub nameservers: Vec<String>,
    pub domain: Option<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

pub const ANNOTATION_KEY: &str = "k8s.v1.cni.cncf.io/network-status";
const PATCH_RETRY_BUDGET: Duration = Duration::from_millis(1000);
const PATCH_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Builds the per-pod network-attachment status array from an aggregated
/// pipeline result (spec.md §4.8). Each delegate's result is read through
/// [`libcni::rust_cni::result::APIResult::get_json`] rather than a
/// downcast, since [`PipelineResult`] only holds `Box<dyn APIResult>`.
pub fn build_statuses(
    pipeline: &PipelineResult,
    network_names: &[String],
    master_index: Option<usize>,
) -> Vec<AttachmentStatus> {
    pipeline
        .per_delegate
        .iter()
        .enumerate()
        .flat_map(|(i, result)| {
            let name = network_names.get(i).cloned().unwrap_or_default();
            let is_master = master_index == Some(i);
            let device_info = pipeline.device_info.get(&name).cloned();
            build_for_delegate(result.as_ref(), &name, is_master, device_info)
        })
        .collect()
}

fn build_for_delegate(
    result: &dyn libcni::rust_cni::result::APIResult,
    network_name: &str,
    is_master: bool,
    device_info: Option<Value>,
) -> Vec<AttachmentStatus> {
    let root: Value = result
        .get_json()
        .dump()
        .parse::<Value>()
        .unwrap_or(Value::Null);

    let interfaces = root.get("interfaces").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let ips = root.get("ips").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let dns = parse_dns(root.get("dns"));

    // Container-side interfaces are those with a non-empty `sandbox`.
    let container_side: Vec<usize> = interfaces
        .iter()
        .enumerate()
        .filter(|(_, iface)| {
            iface
                .get("sandbox")
                .and_then(|s| s.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false)
        })
        .map(|(idx, _)| idx)
        .collect();

    if container_side.is_empty() {
        return vec![AttachmentStatus {
            name: network_name.to_string(),
            default: is_master,
            dns,
            device_info,
            ..Default::default()
        }];
    }

    let single_interface = container_side.len() == 1;

    let mut ips_by_slot: Vec<Vec<String>> = vec![Vec::new(); container_side.len()];
    let mut gateways_by_slot: Vec<Vec<String>> = vec![Vec::new(); container_side.len()];
    // IPs without an interface index attach to the last (default) slot.
    let fallback_slot = container_side.len() - 1;
    let mut first_gateway_slot: Option<usize> = None;

    for ip in &ips {
        let address = ip.get("address").and_then(|a| a.as_str()).map(|s| s.to_string());
        let gateway = ip.get("gateway").and_then(|g| g.as_str());
        let iface_index = ip.get("interface").and_then(|v| v.as_u64()).map(|v| v as usize);

        let slot = if single_interface {
            0
        } else {
            match iface_index {
                Some(idx) => container_side.iter().position(|&i| i == idx).unwrap_or(fallback_slot),
                None => fallback_slot,
            }
        };

        if let Some(addr) = address {
            ips_by_slot[slot].push(addr);
        }
        if let Some(gw) = gateway {
            gateways_by_slot[slot].push(gw.to_string());
            if first_gateway_slot.is_none() {
                first_gateway_slot = Some(slot);
            }
        }
    }

    let default_slot = first_gateway_slot.unwrap_or(0);

    container_side
        .iter()
        .enumerate()
        .map(|(slot, &iface_idx)| {
            let iface = &interfaces[iface_idx];
            AttachmentStatus {
                name: network_name.to_string(),
                default: is_master && slot == default_slot,
                interface: iface.get("name").and_then(|v| v.as_str()).map(String::from),
                mac: iface.get("mac").and_then(|v| v.as_str()).map(String::from),
                mtu: iface.get("mtu").and_then(|v| v.as_u64()).map(|v| v as u32),
                ips: ips_by_slot[slot].clone(),
                gateway: gateways_by_slot[slot].clone(),
                dns: dns.clone(),
                device_info: device_info.clone(),
            }
        })
        .collect()
}

fn parse_dns(value: Option<&Value>) -> DnsStatus {
    let Some(value) = value else {
        return DnsStatus::default();
    };
    DnsStatus {
        nameservers: value
            .get("nameservers")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        domain: value.get("domain").and_then(|v| v.as_str()).map(String::from),
        search: value
            .get("search")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        options: value
            .get("options")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default(),
    }
}

/// Best-effort publication of the status array as a single pod annotation,
/// with a bounded-backoff retry on write conflict (spec.md §4.8).
pub async fn publish(
    store: &dyn PodStore,
    namespace: &str,
    name: &str,
    statuses: &[AttachmentStatus],
) -> Result<()> {
    let body = serde_json::to_string(statuses)?;
    let deadline = tokio::time::Instant::now() + PATCH_RETRY_BUDGET;

    loop {
        match store.patch_annotation(namespace, name, ANNOTATION_KEY, &body).await {
            Ok(()) => {
                debug!("published network-status annotation for {namespace}/{name}");
                return Ok(());
            }
            Err(e) if tokio::time::Instant::now() < deadline => {
                warn!("status patch for {namespace}/{name} failed, retrying: {e}");
                tokio::time::sleep(PATCH_RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("status patch for {namespace}/{name} abandoned after retry budget: {e}");
                return Err(e);
            }
        }
    }
}
