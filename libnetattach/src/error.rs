use thiserror::Error;

/// Error taxonomy for the delegate pipeline and its collaborators
/// (spec.md §7).
#[derive(Debug, Error)]
pub enum NetAttachError {
    #[error("input error: {0}")]
    Input(String),

    #[error("no delegates available after resolution")]
    NoDelegates,

    #[error("error adding container to network \"{network}\": {source}")]
    AddFailed {
        network: String,
        #[source]
        source: Box<NetAttachError>,
    },

    #[error("[{namespace}/{name}:{uid}] error adding container to network \"{network}\": {source}")]
    AddFailedForPod {
        namespace: String,
        name: String,
        uid: String,
        network: String,
        #[source]
        source: Box<NetAttachError>,
    },

    #[error("plugin execution failed: {0}")]
    Plugin(String),

    #[error("netns error: {0}")]
    Netns(String),

    #[error("kernel route/link error: {0}")]
    Kernel(String),

    #[error("gateway cache edit failed: {0}")]
    CacheEdit(String),

    #[error("status publication failed: {0}")]
    StatusPublish(String),

    #[error("rollback encountered errors: {0}")]
    Rollback(String),

    #[error("pod lookup failed: {0}")]
    PodLookup(String),

    #[error("pod uid mismatch: expected {expected}, found {found}")]
    UidMismatch { expected: String, found: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CNI plugin error: {0}")]
    Cni(String),
}

impl NetAttachError {
    /// True when the underlying message indicates the referenced file/path
    /// is already gone — the `RetryDeleteOnError` string-match rule from
    /// spec.md §4.6/§9.
    pub fn looks_like_not_found(&self) -> bool {
        self.to_string().contains("no such file or directory")
    }
}

pub type Result<T> = std::result::Result<T, NetAttachError>;
