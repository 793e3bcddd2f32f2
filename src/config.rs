use std::path::PathBuf;
use std::sync::Arc;

use crate::schema::SchemaRegistry;

/// Address of a sync peer, as handed to the core by the (external)
/// transport layer. The core never resolves hostnames or opens sockets
/// itself — it only knows where to point `PeerTransport::exchange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The core's process-wide configuration, per §6: `{path, orgId, port,
/// peers, registry, trusted}`. Constructed explicitly by the embedding
/// application; the core reads exactly two environment variables beyond
/// this (`GOATDB_SUITE`, `GOATDB_TEST`), both test-selection switches,
/// never production wiring.
#[derive(Clone)]
pub struct Config {
    pub path: PathBuf,
    pub org_id: String,
    pub port: u16,
    pub peers: Vec<PeerAddr>,
    pub registry: Arc<SchemaRegistry>,
    /// When true, `persistVerifiedCommits` skips signature verification.
    /// Intended for trusted-ingest paths (bulk load, same-process tests).
    pub trusted: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>, org_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            org_id: org_id.into(),
            port: 0,
            peers: Vec::new(),
            registry: Arc::new(SchemaRegistry::new()),
            trusted: false,
        }
    }

    pub fn with_peers(mut self, peers: Vec<PeerAddr>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }
}

/// The `GOATDB_TEST` switch some test fixtures gate on; the core never
/// branches on it in non-test code.
pub fn test_suite_selector() -> Option<String> {
    std::env::var("GOATDB_SUITE").ok()
}

pub fn is_test_mode() -> bool {
    std::env::var("GOATDB_TEST")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
