use thiserror::Error;

pub type Result<T> = std::result::Result<T, GoatError>;

/// Errors produced by the core, grouped the way §7 groups them: input,
/// integrity, transient, quarantine, fatal.
#[derive(Debug, Error)]
pub enum GoatError {
    // --- input errors ---
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("type mismatch on field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("missing required field '{0}'")]
    MissingRequired(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid patch: source checksum mismatch")]
    InvalidPatch,
    #[error("corrupt value: {0}")]
    CorruptValue(String),

    // --- integrity errors ---
    #[error("corrupt commit {commit_id}: {reason}")]
    CorruptCommit { commit_id: String, reason: String },
    #[error("signature verification failed for commit {0}")]
    SignatureFailure(String),
    #[error("checksum mismatch on commit {0}")]
    ChecksumMismatch(String),
    #[error("commit already frozen")]
    AlreadyFrozen,

    // --- transient errors ---
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("peer busy: {0}")]
    PeerBusy(String),

    // --- quarantine errors ---
    #[error("corrupt leaf for key '{0}'")]
    CorruptLeaf(String),
    #[error("unknown schema {namespace}@{version}")]
    UnknownSchema { namespace: String, version: u32 },
    #[error("unknown session {0}")]
    UnknownSession(String),

    // --- fatal errors ---
    #[error("no upgrade path from {namespace}@{from} to @{to}")]
    NoUpgradePath {
        namespace: String,
        from: u32,
        to: u32,
    },
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    // --- bridged / encoding errors ---
    #[error("(de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("malformed session: {0}")]
    MalformedSession(String),
    #[error("commit has no parent")]
    OrphanCommit,
}

impl GoatError {
    /// Whether the facade can absorb this error and keep serving the last
    /// known-good head, per §7 ("the facade never crashes on integrity or
    /// transient errors").
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            GoatError::NoUpgradePath { .. } | GoatError::ConfigurationInvalid(_)
        )
    }
}
