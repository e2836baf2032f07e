use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use crate::error::{NetAttachError, Result};

/// A minimal view of a pod record, as returned by [`PodStore::get_once`].
#[derive(Debug, Clone)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub annotations: std::collections::HashMap<String, String>,
}

/// External contract C2: a single, non-retrying lookup/patch against
/// whatever client (event-driven cache or direct API) backs the cluster
/// control plane. The client itself — and its internal caching — is
/// opaque to this core; only the bounded-retry *policy* around it
/// ([`lookup_pod_with_retry`]) is specified here.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// True when this store is backed by an event-driven local cache
    /// (50ms poll interval) rather than talking to the control plane
    /// directly (250ms poll interval) — spec.md §5.
    fn is_cache_backed(&self) -> bool;

    async fn get_once(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>>;

    /// Best-effort patch of a single annotation key; implementations must
    /// retry on write conflict with a bounded backoff (spec.md §4.8).
    async fn patch_annotation(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()>;

    /// Clear a previously-published annotation (used by DEL, best-effort).
    async fn clear_annotation(&self, namespace: &str, name: &str, key: &str) -> Result<()>;

    /// Emit an informational event on the pod record (spec.md §4.2.1.h).
    async fn emit_event(&self, namespace: &str, name: &str, message: &str) -> Result<()>;
}

/// External contract: resolves a named cluster-default attachment
/// definition into an ordered set of raw plugin configs.
#[async_trait]
pub trait NetworkDefinitionStore: Send + Sync {
    async fn get_network(&self, name: &str) -> Result<Vec<Value>>;
}

const RETRY_BUDGET: Duration = Duration::from_millis(2500);

fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("service unavailable")
        || msg.contains("internal error")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
}

fn is_not_found_message(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("not found")
}

/// Bounded-retry pod lookup (spec.md §5 "Pod lookup with retry" and §8
/// property 8 "UID mismatch semantics"). `is_del` relaxes not-found and
/// UID-mismatch handling to match DEL's idempotent contract.
pub async fn lookup_pod_with_retry(
    store: &dyn PodStore,
    namespace: &str,
    name: &str,
    uid: Option<&str>,
    is_del: bool,
) -> Result<Option<PodRecord>> {
    let interval = if store.is_cache_backed() {
        Duration::from_millis(50)
    } else {
        Duration::from_millis(250)
    };

    let deadline = tokio::time::Instant::now() + RETRY_BUDGET;
    let mut last_err: Option<NetAttachError> = None;

    loop {
        match store.get_once(namespace, name).await {
            Ok(Some(record)) => {
                if let Some(expected) = uid
                    && expected != record.uid
                {
                    if is_del {
                        debug!(
                            "pod {}/{} uid mismatch on DEL (expected {}, found {}), tolerating",
                            namespace, name, expected, record.uid
                        );
                        return Ok(Some(record));
                    }
                    return Err(NetAttachError::UidMismatch {
                        expected: expected.to_string(),
                        found: record.uid,
                    });
                }
                return Ok(Some(record));
            }
            Ok(None) => {
                if is_del {
                    return Ok(None);
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                // ADD tolerates a lagging cache reporting not-found.
                tokio::time::sleep(interval).await;
                continue;
            }
            Err(e) => {
                let msg = e.to_string();
                if is_not_found_message(&msg) && !is_del {
                    // treated the same as Ok(None) above: retry until the
                    // cache catches up or the budget is exhausted.
                } else if !is_retryable_message(&msg) {
                    return Err(e);
                }
                last_err = Some(e);
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }
    }

    warn!("pod lookup for {namespace}/{name} exhausted retry budget");
    Err(last_err.unwrap_or_else(|| NetAttachError::PodLookup("lookup retry budget exhausted".into())))
}
