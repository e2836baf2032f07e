use async_trait::async_trait;

use crate::error::{NetAttachError, Result};

/// The verb passed to a child plugin invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Check,
    Del,
}

impl Verb {
    pub fn as_cni_command(self) -> &'static str {
        match self {
            Verb::Add => "ADD",
            Verb::Check => "CHECK",
            Verb::Del => "DEL",
        }
    }
}

/// Per-invocation environment handed to a child plugin (spec.md §6,
/// "Child plugin invocation").
#[derive(Debug, Clone, Default)]
pub struct ExecEnv {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub path: Vec<String>,
    pub args: Vec<[String; 2]>,
}

/// External contract C1: runs one child plugin binary with a verb, stdin
/// JSON, and the standard CNI environment variables; returns result JSON
/// on success or an error. The subprocess/exec mechanism itself is opaque
/// to the pipeline — this trait is the seam that lets tests inject a
/// recording double instead of forking real plugins (spec.md §9).
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn exec(&self, verb: Verb, plugin_type: &str, stdin: &[u8], env: ExecEnv) -> Result<Vec<u8>>;
}

/// Real `PluginExecutor`, backed by [`libcni::rust_cni::exec::RawExec`].
pub struct SubprocessExecutor {
    inner: libcni::rust_cni::exec::RawExec,
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        SubprocessExecutor {
            inner: libcni::rust_cni::exec::RawExec::default(),
        }
    }
}

#[async_trait]
impl PluginExecutor for SubprocessExecutor {
    async fn exec(&self, verb: Verb, plugin_type: &str, stdin: &[u8], env: ExecEnv) -> Result<Vec<u8>> {
        use libcni::rust_cni::exec::Exec;

        let plugin_type = plugin_type.to_string();
        let stdin = stdin.to_vec();

        let path = env.path.clone();
        let plugin_path = self
            .inner
            .find_in_path(plugin_type.clone(), path.clone())
            .map_err(|e| NetAttachError::Plugin(e.to_string()))?;

        let args_str = env
            .args
            .iter()
            .map(|pair| format!("{}={}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join(";");

        let exec_args = libcni::rust_cni::exec::ExecArgs {
            command: verb.as_cni_command().to_string(),
            containerd_id: env.container_id.clone(),
            netns: env.netns.clone(),
            plugin_args: env.args.clone(),
            plugin_args_str: args_str,
            ifname: env.ifname.clone(),
            path: path.first().cloned().unwrap_or_default(),
        };

        let envs = build_child_envs(&exec_args);

        // RawExec's plugin spawn is blocking I/O; run it off the async
        // executor's reactor thread the way libcni's exec layer assumes.
        tokio::task::spawn_blocking(move || {
            let raw = libcni::rust_cni::exec::RawExec::default();
            raw.exec_plugins(plugin_path, &stdin, envs)
                .map_err(|e| NetAttachError::Plugin(e.to_string()))
        })
        .await
        .map_err(|e| NetAttachError::Plugin(format!("executor task panicked: {e}")))?
    }
}

/// Builds the child's environment list without going through
/// `ExecArgs::to_env`, which mutates the whole process's environment via
/// `std::env::set_var` before reading it back: two concurrent requests
/// racing through it can interleave their `CNI_*` variables into each
/// other's child invocation. This builds the same CNI_* + inherited-env
/// shape purely from local state.
fn build_child_envs(exec_args: &libcni::rust_cni::exec::ExecArgs) -> Vec<String> {
    let mut envs: std::collections::HashMap<String, String> = std::env::vars().collect();
    envs.insert("CNI_COMMAND".to_string(), exec_args.command.clone());
    envs.insert("CNI_CONTAINERID".to_string(), exec_args.containerd_id.clone());
    envs.insert("CNI_NETNS".to_string(), exec_args.netns.clone());
    envs.insert("CNI_ARGS".to_string(), exec_args.plugin_args_str.clone());
    envs.insert("CNI_IFNAME".to_string(), exec_args.ifname.clone());
    envs.insert("CNI_PATH".to_string(), exec_args.path.clone());
    envs.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}
