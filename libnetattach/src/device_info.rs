use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::Value;

use crate::error::Result;

/// Device-plugin-published info files, read-only input (spec.md §6).
pub const DP_DEVINFO_DIR: &str = "/var/run/k8s.cni.cncf.io/devinfo/dp";
/// Device-info files this system owns: written on ADD, removed on DEL.
pub const CNI_DEVINFO_DIR: &str = "/var/run/k8s.cni.cncf.io/devinfo/cni";

fn dp_path(dir: &Path, resource: &str, device_id: &str) -> PathBuf {
    dir.join(format!("{resource}-{device_id}-device.json"))
}

/// Reads the device-plugin's info file for one resource/device pair, if
/// present. Absence is not an error: not every device plugin publishes one.
pub fn load_dp_device_info(resource: &str, device_id: &str) -> Result<Option<Value>> {
    load_dp_device_info_in(Path::new(DP_DEVINFO_DIR), resource, device_id)
}

fn load_dp_device_info_in(dir: &Path, resource: &str, device_id: &str) -> Result<Option<Value>> {
    match std::fs::read(dp_path(dir, resource, device_id)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persists a delegate's loaded device info under the CNI-owned devinfo
/// directory, keyed by network name (spec.md §6, written on ADD).
pub fn write_cni_device_info(name: &str, info: &Value) -> Result<()> {
    write_cni_device_info_in(Path::new(CNI_DEVINFO_DIR), name, info)
}

fn write_cni_device_info_in(dir: &Path, name: &str, info: &Value) -> Result<()> {
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    std::fs::write(dir.join(name), serde_json::to_vec(info)?)?;
    Ok(())
}

/// Removes a delegate's CNI-owned devinfo file, if any (spec.md §6, DEL).
/// Best-effort: a missing file is not an error.
pub fn delete_cni_device_info(name: &str) {
    delete_cni_device_info_in(Path::new(CNI_DEVINFO_DIR), name)
}

fn delete_cni_device_info_in(dir: &Path, name: &str) {
    let path = dir.join(name);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("failed to remove devinfo file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dp_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let info = load_dp_device_info_in(dir.path(), "intel.com/sriov", "0000:01:00.0").unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn present_dp_file_parses_into_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intel.com_sriov-0000:01:00.0-device.json"), br#"{"pciAddress":"0000:01:00.0"}"#).unwrap();

        let info = load_dp_device_info_in(dir.path(), "intel.com_sriov", "0000:01:00.0").unwrap();
        assert_eq!(info, Some(serde_json::json!({"pciAddress": "0000:01:00.0"})));
    }

    #[test]
    fn write_then_delete_cni_device_info_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("devinfo").join("cni");

        write_cni_device_info_in(&dir, "net-a", &serde_json::json!({"pciAddress": "0000:01:00.0"})).unwrap();
        let path = dir.join("net-a");
        assert!(path.exists());

        delete_cni_device_info_in(&dir, "net-a");
        assert!(!path.exists());
    }

    #[test]
    fn delete_of_missing_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        delete_cni_device_info_in(dir.path(), "never-written");
    }
}
