use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::{Value, json};

use crate::error::{NetAttachError, Result};

const V4_DEFAULT: &str = "0.0.0.0/0";
const V6_DEFAULT: &str = "::/0";
const V6_DEFAULT_LEGACY_ALT: &str = "::0/0";

fn is_v4_default(dst: &str) -> bool {
    dst == V4_DEFAULT
}

fn is_v6_default(dst: &str) -> bool {
    dst == V6_DEFAULT || dst == V6_DEFAULT_LEGACY_ALT
}

/// Rewrites a per-attachment on-disk result cache file to add or remove
/// IPv4/IPv6 default routes without re-invoking plugins (spec.md §4.5).
///
/// The file is a JSON envelope `{"result": {...}}`; operations round-trip
/// every key they do not understand by mutating the parsed `Value` in
/// place rather than a strongly-typed struct.
pub struct GatewayCacheEditor {
    path: PathBuf,
    envelope: Value,
}

impl GatewayCacheEditor {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = std::fs::read(&path)?;
        let envelope: Value = serde_json::from_slice(&bytes)?;
        Ok(GatewayCacheEditor { path, envelope })
    }

    fn result_mut(&mut self) -> Result<&mut Value> {
        self.envelope
            .get_mut("result")
            .ok_or_else(|| NetAttachError::CacheEdit("cache file has no \"result\" key".into()))
    }

    fn is_legacy(&self) -> bool {
        match self.envelope.get("result").and_then(|r| r.get("cniVersion")).and_then(|v| v.as_str()) {
            None => true,
            Some(version) => {
                let mut parts = version.split('.');
                let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                major == 0 && minor < 3
            }
        }
    }

    fn legacy_routes_array<'a>(result: &'a mut Value, family_key: &str) -> &'a mut Vec<Value> {
        let family = result
            .as_object_mut()
            .unwrap()
            .entry(family_key)
            .or_insert_with(|| json!({}));
        let routes = family
            .as_object_mut()
            .unwrap()
            .entry("routes")
            .or_insert_with(|| json!([]));
        routes.as_array_mut().unwrap()
    }

    fn modern_routes_array(result: &mut Value) -> &mut Vec<Value> {
        let routes = result
            .as_object_mut()
            .unwrap()
            .entry("routes")
            .or_insert_with(|| json!([]));
        routes.as_array_mut().unwrap()
    }

    /// Delete(ipv4, ipv6): remove route entries whose `dst` is the
    /// corresponding IP-family default, preserving order of survivors.
    pub fn delete(&mut self, ipv4: bool, ipv6: bool) -> Result<()> {
        let legacy = self.is_legacy();
        let result = self.result_mut()?;

        if legacy {
            if ipv4 {
                Self::legacy_routes_array(result, "ip4").retain(|r| !Self::route_dst_matches(r, is_v4_default));
            }
            if ipv6 {
                Self::legacy_routes_array(result, "ip6").retain(|r| !Self::route_dst_matches(r, is_v6_default));
            }
        } else {
            let routes = Self::modern_routes_array(result);
            routes.retain(|r| {
                let matches_v4 = ipv4 && Self::route_dst_matches(r, is_v4_default);
                let matches_v6 = ipv6 && Self::route_dst_matches(r, is_v6_default);
                !(matches_v4 || matches_v6)
            });
        }
        Ok(())
    }

    fn route_dst_matches(route: &Value, pred: fn(&str) -> bool) -> bool {
        route
            .get("dst")
            .and_then(|d| d.as_str())
            .map(pred)
            .unwrap_or(false)
    }

    /// Add(gateways): append one default route per gateway, family decided
    /// by the address shape.
    pub fn add(&mut self, gateways: &[IpAddr]) -> Result<()> {
        let legacy = self.is_legacy();
        let result = self.result_mut()?;

        for gw in gateways {
            let (dst, family_key) = match gw {
                IpAddr::V4(_) => (V4_DEFAULT, "ip4"),
                IpAddr::V6(_) => (V6_DEFAULT, "ip6"),
            };
            let entry = json!({ "dst": dst, "gw": gw.to_string() });
            if legacy {
                Self::legacy_routes_array(result, family_key).push(entry);
            } else {
                Self::modern_routes_array(result).push(entry);
            }
        }
        Ok(())
    }

    /// Persist the (possibly mutated) envelope back to its original path.
    pub fn save(&self) -> Result<()> {
        debug!("writing gateway-edited result cache to {}", self.path.display());
        let bytes = serde_json::to_vec(&self.envelope)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn write_cache(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("net-a-container-x-eth0");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn modern_schema_delete_then_add_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cache(
            dir.path(),
            r#"{"result":{"cniVersion":"1.0.0","interfaces":[{"name":"eth0"}],"routes":[{"dst":"0.0.0.0/0","gw":"10.0.0.1"},{"dst":"10.1.0.0/16"}]}}"#,
        );

        let mut editor = GatewayCacheEditor::open(&path).unwrap();
        assert!(!editor.is_legacy());
        editor.delete(true, false).unwrap();
        editor.add(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]).unwrap();
        editor.save().unwrap();

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let routes = saved["result"]["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 2, "the non-default route survives, the old default is replaced by the new one");
        assert!(routes.iter().any(|r| r["dst"] == "10.1.0.0/16"));
        assert!(routes.iter().any(|r| r["dst"] == "0.0.0.0/0" && r["gw"] == "10.0.0.9"));
    }

    #[test]
    fn legacy_schema_uses_ip4_ip6_routes_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cache(
            dir.path(),
            r#"{"result":{"ip4":{"routes":[{"dst":"0.0.0.0/0","gw":"10.0.0.1"}]},"ip6":{"routes":[{"dst":"::0/0","gw":"fd00::1"}]}}}"#,
        );

        let mut editor = GatewayCacheEditor::open(&path).unwrap();
        assert!(editor.is_legacy());
        editor.delete(true, true).unwrap();
        editor.save().unwrap();

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(saved["result"]["ip4"]["routes"].as_array().unwrap().is_empty());
        assert!(saved["result"]["ip6"]["routes"].as_array().unwrap().is_empty(), "\"::0/0\" is recognized as the v6 default alt form");
    }

    #[test]
    fn cache_missing_result_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cache(dir.path(), r#"{"unexpected": true}"#);
        let mut editor = GatewayCacheEditor::open(&path).unwrap();
        assert!(editor.delete(true, true).is_err());
    }
}
