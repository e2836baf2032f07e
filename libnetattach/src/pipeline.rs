use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{debug, warn};
use netlink_packet_route::AddressFamily;

use crate::error::{NetAttachError, Result};
use crate::executor::{ExecEnv, PluginExecutor, Verb};
use crate::gateway_cache::GatewayCacheEditor;
use crate::podstore::{NetworkDefinitionStore, PodRecord, PodStore};
use crate::resolver::{AttachmentResolver, RuntimeArgs};
use crate::scratch::ScratchStore;
use crate::status;
use crate::types::{Delegate, DelegateConf, NetConf, PipelineResult, PodIdentity};

const CHECK_VERSION_FLOOR: (u32, u32, u32) = (0, 4, 0);

/// Executes the ordered delegate list for one pod-lifecycle verb, applies
/// gateway post-processing, aggregates results, and rolls back on failure
/// (spec.md §4.2).
pub struct DelegatePipeline {
    executor: Arc<dyn PluginExecutor>,
    podstore: Option<Arc<dyn PodStore>>,
    netdef_store: Option<Arc<dyn NetworkDefinitionStore>>,
    scratch: ScratchStore,
    cni_dir: PathBuf,
}

impl DelegatePipeline {
    pub fn new(
        executor: Arc<dyn PluginExecutor>,
        podstore: Option<Arc<dyn PodStore>>,
        netdef_store: Option<Arc<dyn NetworkDefinitionStore>>,
        cni_dir: impl Into<PathBuf>,
    ) -> Self {
        let cni_dir = cni_dir.into();
        DelegatePipeline {
            executor,
            podstore,
            netdef_store,
            scratch: ScratchStore::new(cni_dir.clone()),
            cni_dir,
        }
    }

    fn result_cache_path(&self, net_name: &str, container_id: &str, ifname: &str) -> PathBuf {
        self.cni_dir.join("results").join(format!("{net_name}-{container_id}-{ifname}"))
    }

    fn is_system_namespace(&self, netconf: &NetConf, namespace: &str) -> bool {
        netconf.system_namespaces.iter().any(|ns| ns == namespace)
    }

    /// §4.2.1 Add
    pub async fn add(
        &self,
        netconf: &NetConf,
        pod: &PodIdentity,
        pod_record: Option<&PodRecord>,
    ) -> Result<PipelineResult> {
        let delegates = self.resolve_delegates(netconf, pod, pod_record).await?;

        let bytes = serde_json::to_vec(&delegates)?;
        self.scratch.save(&pod.container_id, &bytes)?;

        let mut result = PipelineResult::default();
        let mut master_index: Option<usize> = None;
        let mut network_names = Vec::with_capacity(delegates.len());

        for (i, delegate) in delegates.iter().enumerate() {
            let ifname = determine_ifname(delegate, i, &pod.if_name);
            network_names.push(delegate.name.clone());

            if let Err(e) = check_ifname_available(&pod.netns_path, &ifname).await {
                self.rollback(&delegates, i as i64 - 1, pod).await.ok();
                return Err(wrap_add_error(pod, &delegate.name, e));
            }

            let env = self.build_env(pod, delegate, &ifname)?;
            let stdin = delegate_stdin(delegate, netconf)?;

            let output = match self.executor.exec(Verb::Add, plugin_type_for(delegate), &stdin, env).await {
                Ok(out) => out,
                Err(e) => {
                    self.rollback(&delegates, i as i64 - 1, pod).await.ok();
                    return Err(wrap_add_error(pod, &delegate.name, e));
                }
            };

            let parsed: libcni::rust_cni::result::result100::Result = serde_json::from_slice(&output)
                .map_err(|e| NetAttachError::Input(format!("malformed result from delegate \"{}\": {e}", delegate.name)))?;

            let has_content = parsed.interfaces.as_ref().map(|v| !v.is_empty()).unwrap_or(false)
                || parsed.ips.as_ref().map(|v| !v.is_empty()).unwrap_or(false);

            if has_content {
                if let Err(e) = self.apply_gateway_policy(&delegate.name, pod, delegate, &ifname).await {
                    self.rollback(&delegates, i as i64 - 1, pod).await.ok();
                    return Err(wrap_add_error(pod, &delegate.name, e));
                }
            }

            if let Some(info) = &delegate.device_info {
                if let Err(e) = crate::device_info::write_cni_device_info(&delegate.name, info) {
                    warn!("failed to persist device info for \"{}\": {e}", delegate.name);
                }
                result.device_info.insert(delegate.name.clone(), info.clone());
            }

            let boxed: Box<dyn libcni::rust_cni::result::APIResult> = Box::new(parsed);
            if delegate.master_plugin || result.representative.is_none() {
                master_index = Some(i);
                result.representative = Some(boxed.clone());
            }
            result.per_delegate.push(boxed);

            if let Some(store) = &self.podstore {
                let message = format!("Added interface {ifname} to network {}", delegate.name);
                if let Err(e) = store.emit_event(&pod.namespace, &pod.name, &message).await {
                    debug!("failed to emit event for {}/{}: {e}", pod.namespace, pod.name);
                }
            }
        }

        if let Some(store) = &self.podstore {
            if !self.is_system_namespace(netconf, &pod.namespace) {
                let statuses = status::build_statuses(&result, &network_names, master_index);
                if let Err(e) = status::publish(store.as_ref(), &pod.namespace, &pod.name, &statuses).await {
                    warn!("status publication failed for {}/{}: {e}", pod.namespace, pod.name);
                }
            }
        }

        Ok(result)
    }

    /// §4.2.2 Check
    pub async fn check(
        &self,
        netconf: &NetConf,
        pod: &PodIdentity,
        pod_record: Option<&PodRecord>,
    ) -> Result<()> {
        if !version_ge(&netconf.cni_version, CHECK_VERSION_FLOOR) {
            return Err(NetAttachError::Input(format!(
                "CHECK is not supported on result format \"{}\" (< 0.4.0)",
                netconf.cni_version
            )));
        }

        let delegates = self.resolve_delegates(netconf, pod, pod_record).await?;

        for (i, delegate) in delegates.iter().enumerate() {
            let ifname = determine_ifname(delegate, i, &pod.if_name);
            let env = self.build_env(pod, delegate, &ifname)?;
            let stdin = delegate_stdin(delegate, netconf)?;
            self.executor
                .exec(Verb::Check, plugin_type_for(delegate), &stdin, env)
                .await
                .map_err(|e| wrap_add_error(pod, &delegate.name, e))?;
        }

        Ok(())
    }

    /// §4.2.3 Delete
    pub async fn delete(
        &self,
        netconf: &NetConf,
        pod: &PodIdentity,
        pod_record: Option<&PodRecord>,
    ) -> Result<()> {
        if !netconf.readiness_indicator_file.is_empty() && !std::path::Path::new(&netconf.readiness_indicator_file).exists() {
            warn!("readiness indicator file {} missing on DEL, continuing", netconf.readiness_indicator_file);
        }

        let netns_found = !pod.netns_path.is_empty() && std::path::Path::new(&pod.netns_path).exists();

        let delegates = match self.scratch.load(&pod.container_id)? {
            Some((_, bytes)) => {
                let mut delegates: Vec<Delegate> = serde_json::from_slice(&bytes)?;
                if let Some(first) = delegates.first_mut() {
                    first.master_plugin = true;
                }
                delegates
            }
            None => {
                if let Some(record) = pod_record {
                    self.resolve_delegates(netconf, pod, Some(record)).await?
                } else {
                    debug!("no ScratchStore entry and no pod record for {}, treating DEL as already complete", pod.container_id);
                    return Ok(());
                }
            }
        };

        if let Some(store) = &self.podstore {
            if netns_found && !self.is_system_namespace(netconf, &pod.namespace) {
                if let Err(e) = store.clear_annotation(&pod.namespace, &pod.name, status::ANNOTATION_KEY).await {
                    debug!("best-effort status clear failed for {}/{}: {e}", pod.namespace, pod.name);
                }
            }
        }

        let rollback_result = self.rollback(&delegates, delegates.len() as i64 - 1, pod).await;
        self.scratch.delete_after_rollback(&pod.container_id, netconf.retry_delete_on_error, &rollback_result)?;
        rollback_result
    }

    /// §4.2.4 Rollback(i): DEL delegates j = i down to 0, accumulating errors.
    async fn rollback(&self, delegates: &[Delegate], i: i64, pod: &PodIdentity) -> Result<()> {
        let mut errors = Vec::new();

        let mut j = i;
        while j >= 0 {
            let idx = j as usize;
            let delegate = &delegates[idx];
            let ifname = determine_ifname(delegate, idx, &pod.if_name);

            let outcome: Result<()> = async {
                let env = self.build_env(pod, delegate, &ifname)?;
                let stdin = delegate_stdin_for_delete(delegate)?;
                self.executor.exec(Verb::Del, plugin_type_for(delegate), &stdin, env).await?;
                Ok(())
            }
            .await;

            if let Err(e) = outcome {
                warn!("rollback DEL failed for delegate \"{}\": {e}", delegate.name);
                errors.push(format!("{}: {e}", delegate.name));
            }
            crate::device_info::delete_cni_device_info(&delegate.name);

            j -= 1;
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetAttachError::Rollback(errors.join("; ")))
        }
    }

    async fn resolve_delegates(
        &self,
        netconf: &NetConf,
        pod: &PodIdentity,
        pod_record: Option<&PodRecord>,
    ) -> Result<Vec<Delegate>> {
        let runtime_args = RuntimeArgs {
            container_id: pod.container_id.clone(),
            sandbox_id: pod.sandbox_id.clone(),
            netns_path: pod.netns_path.clone(),
            arg_if_name: pod.if_name.clone(),
        };
        let resolver = AttachmentResolver {
            netconf,
            pod: pod_record,
            runtime_args: &runtime_args,
            netdef_store: self.netdef_store.as_deref(),
            device_resources: pod.device_resources.clone(),
        };
        resolver.resolve().await
    }

    fn build_env(&self, pod: &PodIdentity, delegate: &Delegate, ifname: &str) -> Result<ExecEnv> {
        let mut args = Vec::new();
        if delegate.mac_request.is_some() || !delegate.ip_request.is_empty() {
            args.push(["IgnoreUnknown".to_string(), "true".to_string()]);
        }
        if let Some(mac) = &delegate.mac_request {
            validate_mac(mac)?;
            args.push(["MAC".to_string(), mac.clone()]);
        }
        if !delegate.ip_request.is_empty() {
            for ip in &delegate.ip_request {
                validate_ip_or_cidr(ip)?;
            }
            args.push(["IP".to_string(), delegate.ip_request.join(",")]);
        }

        Ok(ExecEnv {
            container_id: pod.container_id.clone(),
            netns: pod.netns_path.clone(),
            ifname: ifname.to_string(),
            path: Vec::new(),
            args,
        })
    }

    async fn apply_gateway_policy(
        &self,
        net_name: &str,
        pod: &PodIdentity,
        delegate: &Delegate,
        ifname: &str,
    ) -> Result<()> {
        let delete_v4 = delegate.is_filter_v4_gateway || !delegate.gateway_request.is_empty();
        let delete_v6 = delegate.is_filter_v6_gateway || !delegate.gateway_request.is_empty();
        let add_default = !delegate.gateway_request.is_empty();

        if !delete_v4 && !delete_v6 && !add_default {
            return Ok(());
        }

        mutate_kernel_routes(&pod.netns_path, ifname, delete_v4, delete_v6, &delegate.gateway_request)
            .await
            .map_err(|e| NetAttachError::Kernel(e.to_string()))?;

        let cache_path = self.result_cache_path(net_name, &pod.container_id, ifname);
        if cache_path.exists() {
            let mut editor = GatewayCacheEditor::open(&cache_path)?;
            editor.delete(delete_v4, delete_v6)?;
            if add_default {
                editor.add(&delegate.gateway_request)?;
            }
            editor.save()?;
        }

        Ok(())
    }
}

fn wrap_add_error(pod: &PodIdentity, network: &str, source: NetAttachError) -> NetAttachError {
    match &pod.uid {
        Some(uid) => NetAttachError::AddFailedForPod {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            uid: uid.clone(),
            network: network.to_string(),
            source: Box::new(source),
        },
        None => NetAttachError::AddFailed {
            network: network.to_string(),
            source: Box::new(source),
        },
    }
}

/// Interface naming rule (spec.md §4.3).
fn determine_ifname(delegate: &Delegate, index: usize, master_caller_ifname: &str) -> String {
    if let Some(req) = &delegate.ifname_request {
        if !req.is_empty() {
            return req.clone();
        }
    }
    if delegate.master_plugin {
        return master_caller_ifname.to_string();
    }
    format!("net{index}")
}

async fn check_ifname_available(netns_path: &str, ifname: &str) -> Result<()> {
    let exists = run_in_netns(netns_path, {
        let ifname = ifname.to_string();
        async move {
            match libcni::ip::link::link_by_name(&ifname).await {
                Ok(_) => Ok(true),
                Err(e) if e.to_string().to_ascii_lowercase().contains("not found") => Ok(false),
                Err(e) => Err(e),
            }
        }
    })
    .await
    .map_err(|e| NetAttachError::Netns(e.to_string()))?;

    if exists {
        Err(NetAttachError::Input(format!("interface \"{ifname}\" already exists in target netns")))
    } else {
        Ok(())
    }
}

async fn mutate_kernel_routes(
    netns_path: &str,
    ifname: &str,
    delete_v4: bool,
    delete_v6: bool,
    gateways: &[IpAddr],
) -> anyhow::Result<()> {
    let ifname = ifname.to_string();
    let gateways = gateways.to_vec();

    run_in_netns(netns_path, async move {
        let iface = libcni::ip::route::interface_by_name(ifname.clone()).await?;

        if delete_v4 {
            delete_default_routes(iface.index, AddressFamily::Inet, "0.0.0.0/0").await?;
        }
        if delete_v6 {
            delete_default_routes(iface.index, AddressFamily::Inet6, "::/0").await?;
        }

        for gw in &gateways {
            let (dst, metric) = match gw {
                IpAddr::V4(_) => (IpNetwork::from_str("0.0.0.0/0")?, None),
                IpAddr::V6(_) => (IpNetwork::from_str("::/0")?, None),
            };
            libcni::ip::route::route_add(libcni::ip::route::Route {
                dst: Some(dst),
                oif_index: Some(iface.index),
                gateway: Some(*gw),
                src: None,
                route_type: None,
                metric,
            })
            .await?;
        }

        Ok(())
    })
    .await
}

async fn delete_default_routes(oif_index: u32, family: AddressFamily, default_dst: &str) -> anyhow::Result<()> {
    let default_net = IpNetwork::from_str(default_dst)?;
    let filter = libcni::ip::route::Route {
        dst: None,
        oif_index: Some(oif_index),
        gateway: None,
        src: None,
        route_type: None,
        metric: None,
    };
    let mask = libcni::ip::route::RouteFilterMask {
        oif_index: true,
        ..Default::default()
    };
    let routes = libcni::ip::route::route_list_filtered_vec(family, Some(&filter), mask).await?;
    for route in routes.into_iter().filter(|r| r.dst == Some(default_net)) {
        libcni::ip::route::route_del(route).await?;
    }
    Ok(())
}

async fn run_in_netns<F, T>(netns_path: &str, f: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    let current = libcni::ns::ns::Netns::get()?;
    let target = libcni::ns::ns::Netns::get_from_path(std::path::Path::new(netns_path))?
        .ok_or_else(|| anyhow::anyhow!("netns path \"{netns_path}\" not found"))?;
    libcni::ns::ns::exec_netns(&current, &target, f).await
}

fn plugin_type_for(delegate: &Delegate) -> &str {
    match &delegate.conf {
        DelegateConf::Conf { plugin_type } => plugin_type,
        DelegateConf::ConfList { plugins } => plugins
            .first()
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
            .unwrap_or(delegate.name.as_str()),
    }
}

fn delegate_stdin(delegate: &Delegate, netconf: &NetConf) -> Result<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(&delegate.bytes)?;
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("cniVersion") || obj["cniVersion"].as_str().map(str::is_empty).unwrap_or(true) {
            obj.insert("cniVersion".to_string(), serde_json::Value::String(netconf.cni_version.clone()));
        }
        if !obj.contains_key("name") || obj["name"].as_str().map(str::is_empty).unwrap_or(true) {
            obj.insert("name".to_string(), serde_json::Value::String(delegate.name.clone()));
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

fn delegate_stdin_for_delete(delegate: &Delegate) -> Result<Vec<u8>> {
    if delegate.bytes.is_empty() {
        return Ok(b"{}".to_vec());
    }
    Ok(delegate.bytes.clone())
}

fn validate_mac(mac: &str) -> Result<()> {
    mac.parse::<macaddr::MacAddr>()
        .map(|_| ())
        .map_err(|_| NetAttachError::Input(format!("invalid MAC request \"{mac}\"")))
}

fn validate_ip_or_cidr(ip: &str) -> Result<()> {
    if ip.parse::<IpAddr>().is_ok() || ip.parse::<IpNetwork>().is_ok() {
        Ok(())
    } else {
        Err(NetAttachError::Input(format!("invalid IP/CIDR request \"{ip}\"")))
    }
}

fn version_ge(version: &str, floor: (u32, u32, u32)) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major, minor, patch) >= floor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    fn init_logger() {
        static LOGGER: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();
        LOGGER.get_or_init(|| {
            env_logger::builder().is_test(true).try_init().ok();
        });
    }

    fn make_pod(container_id: &str, netns_path: &str) -> PodIdentity {
        PodIdentity {
            container_id: container_id.to_string(),
            sandbox_id: container_id.to_string(),
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: None,
            netns_path: netns_path.to_string(),
            if_name: "eth0".to_string(),
            device_resources: std::collections::HashMap::new(),
        }
    }

    fn add_result_json() -> Vec<u8> {
        br#"{"cniVersion":"0.4.0","interfaces":[{"name":"eth0"}],"ips":[{"interface":0,"address":"10.0.0.5/24"}]}"#.to_vec()
    }

    /// Records every `(Verb, ifname)` invocation in order; can be configured
    /// to fail on one specific pair (spec.md §9's conformance requirement
    /// for a test double around `PluginExecutor`).
    struct MockExecutor {
        calls: StdMutex<Vec<(Verb, String)>>,
        fail_on: Option<(Verb, String)>,
        add_result: Vec<u8>,
        /// When set, ADD creates a real dummy link with this address in this
        /// netns, standing in for what a real delegate plugin would have
        /// wired up, so gateway post-processing has an interface to act on.
        link_setup: Option<(String, String)>,
    }

    impl MockExecutor {
        fn new(add_result: Vec<u8>) -> Self {
            MockExecutor {
                calls: StdMutex::new(Vec::new()),
                fail_on: None,
                add_result,
                link_setup: None,
            }
        }

        fn failing_on(mut self, verb: Verb, ifname: &str) -> Self {
            self.fail_on = Some((verb, ifname.to_string()));
            self
        }

        fn creating_links_in(mut self, ns_name: &str, addr_cidr: &str) -> Self {
            self.link_setup = Some((ns_name.to_string(), addr_cidr.to_string()));
            self
        }

        fn calls(&self) -> Vec<(Verb, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PluginExecutor for MockExecutor {
        async fn exec(&self, verb: Verb, _plugin_type: &str, _stdin: &[u8], env: ExecEnv) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push((verb, env.ifname.clone()));
            if self.fail_on.as_ref() == Some(&(verb, env.ifname.clone())) {
                return Err(NetAttachError::Plugin(format!("mock failure on {verb:?} {}", env.ifname)));
            }
            match verb {
                Verb::Add => {
                    if let Some((ns_name, addr_cidr)) = &self.link_setup {
                        create_dummy_link_with_addr(ns_name, &env.ifname, addr_cidr);
                    }
                    Ok(self.add_result.clone())
                }
                Verb::Check | Verb::Del => Ok(b"{}".to_vec()),
            }
        }
    }

    /// Brings up a dummy link with an address inside `ns_name`, mimicking
    /// the interface a real delegate plugin would have created on ADD.
    fn create_dummy_link_with_addr(ns_name: &str, ifname: &str, addr_cidr: &str) {
        let add_link = Command::new("ip")
            .args(["netns", "exec", ns_name, "ip", "link", "add", ifname, "type", "dummy"])
            .output()
            .expect("failed to run ip link add");
        assert!(add_link.status.success(), "ip link add failed: {}", String::from_utf8_lossy(&add_link.stderr));

        Command::new("ip").args(["netns", "exec", ns_name, "ip", "link", "set", ifname, "up"]).output().ok();

        let add_addr = Command::new("ip")
            .args(["netns", "exec", ns_name, "ip", "addr", "add", addr_cidr, "dev", ifname])
            .output()
            .expect("failed to run ip addr add");
        assert!(add_addr.status.success(), "ip addr add failed: {}", String::from_utf8_lossy(&add_addr.stderr));
    }

    fn default_route_in_ns(ns_name: &str) -> String {
        let output = Command::new("ip")
            .args(["netns", "exec", ns_name, "ip", "route", "show", "default"])
            .output()
            .expect("failed to run ip route show");
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    struct FakeNetworkDefinitionStore {
        networks: std::collections::HashMap<String, Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl NetworkDefinitionStore for FakeNetworkDefinitionStore {
        async fn get_network(&self, name: &str) -> Result<Vec<serde_json::Value>> {
            self.networks
                .get(name)
                .cloned()
                .ok_or_else(|| NetAttachError::Input(format!("no such network-attachment-definition \"{name}\"")))
        }
    }

    /// Reports every pod as absent and records annotation clears, standing
    /// in for a control-plane client after the pod record has been deleted.
    struct DeletedPodStore {
        cleared: StdMutex<Vec<String>>,
    }

    impl DeletedPodStore {
        fn new() -> Self {
            DeletedPodStore { cleared: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl PodStore for DeletedPodStore {
        fn is_cache_backed(&self) -> bool {
            true
        }

        async fn get_once(&self, _namespace: &str, _name: &str) -> Result<Option<PodRecord>> {
            Ok(None)
        }

        async fn patch_annotation(&self, _namespace: &str, _name: &str, _key: &str, _value: &str) -> Result<()> {
            Ok(())
        }

        async fn clear_annotation(&self, namespace: &str, name: &str, _key: &str) -> Result<()> {
            self.cleared.lock().unwrap().push(format!("{namespace}/{name}"));
            Ok(())
        }

        async fn emit_event(&self, _namespace: &str, _name: &str, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn create_netns(name: &str) -> String {
        std::fs::create_dir_all("/var/run/netns").ok();
        let output = Command::new("ip").args(["netns", "add", name]).output().expect("failed to run ip netns add");
        assert!(output.status.success(), "ip netns add failed: {}", String::from_utf8_lossy(&output.stderr));
        format!("/var/run/netns/{name}")
    }

    fn delete_netns(name: &str) {
        Command::new("ip").args(["netns", "delete", name]).output().ok();
    }

    fn two_delegate_netconf() -> NetConf {
        let mut netconf = NetConf {
            cni_version: "0.4.0".to_string(),
            ..Default::default()
        };
        netconf.delegates = vec![
            serde_json::json!({"type": "bridge", "name": "net-a"}),
            serde_json::json!({"type": "macvlan", "name": "net-b"}),
        ];
        netconf
    }

    #[test]
    fn determine_ifname_prefers_explicit_request() {
        let mut delegate = Delegate::new(DelegateConf::Conf { plugin_type: "bridge".into() }, "net-a");
        delegate.ifname_request = Some("custom0".to_string());
        assert_eq!(determine_ifname(&delegate, 1, "eth0"), "custom0");
    }

    #[test]
    fn determine_ifname_uses_caller_ifname_for_master() {
        let mut delegate = Delegate::new(DelegateConf::Conf { plugin_type: "bridge".into() }, "net-a");
        delegate.master_plugin = true;
        assert_eq!(determine_ifname(&delegate, 0, "eth0"), "eth0");
    }

    #[test]
    fn determine_ifname_falls_back_to_net_index() {
        let delegate = Delegate::new(DelegateConf::Conf { plugin_type: "bridge".into() }, "net-b");
        assert_eq!(determine_ifname(&delegate, 2, "eth0"), "net2");
    }

    #[test]
    fn plugin_type_for_conflist_uses_first_plugin() {
        let delegate = Delegate::new(
            DelegateConf::ConfList {
                plugins: vec![serde_json::json!({"type": "bridge"}), serde_json::json!({"type": "portmap"})],
            },
            "net-a",
        );
        assert_eq!(plugin_type_for(&delegate), "bridge");
    }

    #[test]
    fn wrap_add_error_includes_uid_when_known() {
        let mut pod = make_pod("c1", "/tmp/doesnotexist");
        pod.uid = Some("abc-123".to_string());
        let wrapped = wrap_add_error(&pod, "net-a", NetAttachError::Plugin("boom".into()));
        match wrapped {
            NetAttachError::AddFailedForPod { uid, network, .. } => {
                assert_eq!(uid, "abc-123");
                assert_eq!(network, "net-a");
            }
            other => panic!("expected AddFailedForPod, got {other:?}"),
        }
    }

    #[test]
    fn wrap_add_error_omits_uid_when_unknown() {
        let pod = make_pod("c1", "/tmp/doesnotexist");
        let wrapped = wrap_add_error(&pod, "net-a", NetAttachError::Plugin("boom".into()));
        assert!(matches!(wrapped, NetAttachError::AddFailed { .. }));
    }

    #[test]
    fn version_ge_compares_numerically() {
        assert!(version_ge("0.4.0", CHECK_VERSION_FLOOR));
        assert!(version_ge("1.0.0", CHECK_VERSION_FLOOR));
        assert!(!version_ge("0.3.1", CHECK_VERSION_FLOOR));
    }

    #[test]
    fn validate_mac_rejects_garbage() {
        assert!(validate_mac("00:11:22:33:44:55").is_ok());
        assert!(validate_mac("not-a-mac").is_err());
    }

    #[test]
    fn validate_ip_or_cidr_accepts_bare_ip_and_cidr() {
        assert!(validate_ip_or_cidr("10.0.0.5").is_ok());
        assert!(validate_ip_or_cidr("10.0.0.0/24").is_ok());
        assert!(validate_ip_or_cidr("not-an-ip").is_err());
    }

    #[tokio::test]
    async fn add_invokes_delegates_in_order_and_promotes_master_result() {
        init_logger();
        let ns_name = format!("netattach-test-{}", uuid::Uuid::new_v4());
        let ns_path = create_netns(&ns_name);
        let cni_dir = tempfile::tempdir().unwrap();

        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let pipeline = DelegatePipeline::new(executor.clone(), None, None, cni_dir.path());

        let pod = make_pod("container-a", &ns_path);
        let netconf = two_delegate_netconf();

        let result = pipeline.add(&netconf, &pod, None).await;
        delete_netns(&ns_name);

        let result = result.expect("add should succeed against an empty netns");
        assert_eq!(executor.calls(), vec![(Verb::Add, "eth0".to_string()), (Verb::Add, "net1".to_string())]);
        assert_eq!(result.per_delegate.len(), 2);
        assert!(result.representative.is_some(), "first delegate is auto-promoted to master");
    }

    #[tokio::test]
    async fn add_rolls_back_already_added_delegates_on_failure() {
        init_logger();
        let ns_name = format!("netattach-test-{}", uuid::Uuid::new_v4());
        let ns_path = create_netns(&ns_name);
        let cni_dir = tempfile::tempdir().unwrap();

        let executor = Arc::new(MockExecutor::new(add_result_json()).failing_on(Verb::Add, "net1"));
        let pipeline = DelegatePipeline::new(executor.clone(), None, None, cni_dir.path());

        let pod = make_pod("container-b", &ns_path);
        let netconf = two_delegate_netconf();

        let result = pipeline.add(&netconf, &pod, None).await;
        delete_netns(&ns_name);

        assert!(result.is_err(), "second delegate's failure should fail the whole ADD");
        assert_eq!(
            executor.calls(),
            vec![
                (Verb::Add, "eth0".to_string()),
                (Verb::Add, "net1".to_string()),
                (Verb::Del, "eth0".to_string()),
            ],
            "only the already-succeeded delegate is torn down, in reverse order"
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent_via_scratch_store_and_clears_it_on_success() {
        init_logger();
        let ns_name = format!("netattach-test-{}", uuid::Uuid::new_v4());
        let ns_path = create_netns(&ns_name);
        let cni_dir = tempfile::tempdir().unwrap();

        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let pipeline = DelegatePipeline::new(executor.clone(), None, None, cni_dir.path());

        let pod = make_pod("container-c", &ns_path);
        let netconf = two_delegate_netconf();

        pipeline.add(&netconf, &pod, None).await.expect("add should succeed");
        pipeline.delete(&netconf, &pod, None).await.expect("delete should succeed from the scratch entry alone");
        delete_netns(&ns_name);

        let calls = executor.calls();
        assert_eq!(&calls[2..], &[(Verb::Del, "net1".to_string()), (Verb::Del, "eth0".to_string())], "DEL tears down in reverse order");

        let scratch = ScratchStore::new(cni_dir.path());
        assert!(scratch.load("container-c").unwrap().is_none(), "successful DEL clears the scratch entry");
    }

    #[tokio::test]
    async fn delete_without_scratch_entry_or_pod_record_is_a_no_op() {
        init_logger();
        let cni_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let pipeline = DelegatePipeline::new(executor.clone(), None, None, cni_dir.path());

        let pod = make_pod("container-never-added", "/does/not/exist");
        let netconf = two_delegate_netconf();

        pipeline.delete(&netconf, &pod, None).await.expect("DEL with nothing to tear down must succeed");
        assert!(executor.calls().is_empty(), "no delegate invocation should happen when there is nothing to undo");
    }

    /// S3: a bad netns path must fail before any delegate is invoked.
    #[tokio::test]
    async fn add_fails_before_any_delegate_invocation_when_netns_path_is_invalid() {
        init_logger();
        let cni_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let pipeline = DelegatePipeline::new(executor.clone(), None, None, cni_dir.path());

        let pod = make_pod("container-s3", "/does/not/exist-s3");
        let netconf = two_delegate_netconf();

        let result = pipeline.add(&netconf, &pod, None).await;

        assert!(result.is_err(), "a netns path that doesn't exist must fail ADD");
        assert!(executor.calls().is_empty(), "no delegate should be invoked once the netns can't be opened");
    }

    /// S4: a gateway override carried on a pod's network-selection
    /// annotation is round-tripped through a real `add()` call into an
    /// actual kernel default route.
    #[tokio::test]
    async fn add_applies_gateway_override_as_a_real_kernel_default_route() {
        init_logger();
        let ns_name = format!("netattach-test-{}", uuid::Uuid::new_v4());
        let ns_path = create_netns(&ns_name);
        let cni_dir = tempfile::tempdir().unwrap();

        let mut networks = std::collections::HashMap::new();
        networks.insert("net-a".to_string(), vec![serde_json::json!({"type": "bridge"})]);
        let netdef_store = Arc::new(FakeNetworkDefinitionStore { networks });

        let executor = Arc::new(MockExecutor::new(add_result_json()).creating_links_in(&ns_name, "10.0.0.5/24"));
        let pipeline = DelegatePipeline::new(executor.clone(), None, Some(netdef_store), cni_dir.path());

        let mut annotations = std::collections::HashMap::new();
        annotations.insert(
            "k8s.v1.cni.cncf.io/networks".to_string(),
            r#"[{"name":"net-a","default-route":["10.0.0.1"]}]"#.to_string(),
        );
        let pod_record = PodRecord {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "uid-1".to_string(),
            annotations,
        };

        let mut pod = make_pod("container-gw", &ns_path);
        pod.if_name = "eth0".to_string();
        let netconf = NetConf {
            cni_version: "0.4.0".to_string(),
            ..Default::default()
        };

        let result = pipeline.add(&netconf, &pod, Some(&pod_record)).await;
        let route_output = default_route_in_ns(&ns_name);
        delete_netns(&ns_name);

        result.expect("add with a gateway override should succeed");
        assert!(route_output.contains("10.0.0.1"), "gateway override should install a real default route, got: {route_output}");
    }

    /// S5: DEL for a pod that has already been deleted from the control
    /// plane (no scratch entry, no pod record, netns already torn down)
    /// must be a clean no-op that never touches annotations.
    #[tokio::test]
    async fn delete_of_an_already_deleted_pod_skips_rollback_and_annotation_clear() {
        init_logger();
        let cni_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let podstore = Arc::new(DeletedPodStore::new());
        let pipeline = DelegatePipeline::new(executor.clone(), Some(podstore.clone()), None, cni_dir.path());

        let pod = make_pod("container-s5", "/does/not/exist-s5");
        let netconf = two_delegate_netconf();

        pipeline.delete(&netconf, &pod, None).await.expect("DEL of an already-deleted pod must succeed");

        assert!(executor.calls().is_empty(), "nothing to roll back once the pod and its scratch entry are both gone");
        assert!(podstore.cleared.lock().unwrap().is_empty(), "annotation clear is skipped once the netns is gone too");
    }

    /// S6: DEL with no scratch entry but a live pod record must re-resolve
    /// the delegate list from the record's annotations and tear it down.
    #[tokio::test]
    async fn delete_without_scratch_entry_re_resolves_delegates_from_a_live_pod_record() {
        init_logger();
        let cni_dir = tempfile::tempdir().unwrap();

        let mut networks = std::collections::HashMap::new();
        networks.insert("net-a".to_string(), vec![serde_json::json!({"type": "bridge"})]);
        let netdef_store = Arc::new(FakeNetworkDefinitionStore { networks });

        let executor = Arc::new(MockExecutor::new(add_result_json()));
        let pipeline = DelegatePipeline::new(executor.clone(), None, Some(netdef_store), cni_dir.path());

        let mut annotations = std::collections::HashMap::new();
        annotations.insert("k8s.v1.cni.cncf.io/networks".to_string(), "net-a".to_string());
        let pod_record = PodRecord {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "uid-1".to_string(),
            annotations,
        };

        let pod = make_pod("container-s6", "/does/not/exist-s6");
        let netconf = NetConf::default();

        pipeline
            .delete(&netconf, &pod, Some(&pod_record))
            .await
            .expect("DEL must re-resolve delegates from the live pod record and tear them down");

        assert_eq!(executor.calls(), vec![(Verb::Del, "eth0".to_string())], "the re-resolved single delegate is rolled back as master");
    }
}
