use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use tokio::net::UnixListener;

use libnetattach::executor::SubprocessExecutor;
use libnetattach::pipeline::DelegatePipeline;

use netattachd::server;

const DEFAULT_RUNDIR: &str = "/var/run/netattach";
const SOCKET_NAME: &str = "netattach.sock";
const DEFAULT_CNI_DIR: &str = "/var/lib/cni/netattach";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rundir = std::env::var("NETATTACHD_RUNDIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(DEFAULT_RUNDIR));
    let cni_dir = std::env::var("NETATTACHD_CNI_DIR").unwrap_or_else(|_| DEFAULT_CNI_DIR.to_string());

    prepare_rundir(&rundir)?;
    let socket_path = rundir.join(SOCKET_NAME);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    info!("netattachd listening on {}", socket_path.display());

    let pipeline = DelegatePipeline::new(Arc::new(SubprocessExecutor::default()), None, None, cni_dir);
    let ctx = Arc::new(server::Context {
        pipeline: Arc::new(pipeline),
        podstore: None,
    });

    server::serve(listener, ctx).await;
    Ok(())
}

/// Enforces the startup preconditions on the rundir (spec.md §4.7):
/// absent, or owned by UID 0 with mode exactly 0700; created with mode
/// 0700 if absent.
fn prepare_rundir(rundir: &Path) -> anyhow::Result<()> {
    match std::fs::metadata(rundir) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if meta.uid() != 0 || mode != 0o700 {
                anyhow::bail!(
                    "rundir {} must be owned by uid 0 with mode 0700 (found uid={}, mode={:o})",
                    rundir.display(),
                    meta.uid(),
                    mode
                );
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(rundir)?;
            std::fs::set_permissions(rundir, std::fs::Permissions::from_mode(0o700))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
