//! Stateless Bloom-filter sync protocol (§4.6): a single round transfers
//! only the commits each side may be missing.

pub mod scheduler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::commit::{Commit, CommitSource};
use crate::error::Result;
use crate::repository::Repository;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomReq {
    pub repo_path: String,
    pub filter: BloomFilter,
    pub count: u64,
    pub expected_fpr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomRsp {
    pub commits_to_client: Vec<Commit>,
    pub filter_to_client: BloomFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushAck {
    pub accepted: usize,
    pub rejected: usize,
}

/// The external-collaborator boundary for a peer connection (§1: the
/// HTTP transport itself is out of scope; this is what the core needs
/// from whatever carries the bytes).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn bloom_exchange(&self, req: BloomReq) -> Result<BloomRsp>;
    async fn push(&self, push: Push) -> Result<PushAck>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStatus {
    pub received: usize,
    pub sent: usize,
}

/// Runs one client-initiated round (§4.6's `Client: ... Server: ... `
/// exchange) against `peer`.
pub async fn run_round(
    repo: &Repository,
    repo_path: &str,
    peer: &dyn PeerTransport,
    capacity_hint: usize,
    fpr: f64,
) -> Result<SyncStatus> {
    let local_ids = repo.all_commit_ids();
    let mut filter = BloomFilter::new(capacity_hint.max(local_ids.len()).max(1), fpr);
    for id in &local_ids {
        filter.add(id.as_bytes());
    }

    let req = BloomReq {
        repo_path: repo_path.to_string(),
        filter,
        count: local_ids.len() as u64,
        expected_fpr: fpr,
    };
    let rsp = peer.bloom_exchange(req).await?;

    let received = rsp.commits_to_client.len();
    repo.persist_verified_commits(rsp.commits_to_client)?;

    let local_ids = repo.all_commit_ids();
    let commits_to_server: Vec<Commit> = local_ids
        .iter()
        .filter(|id| !rsp.filter_to_client.may_contain(id.as_bytes()))
        .filter_map(|id| repo.get(id))
        .collect();
    let sent = commits_to_server.len();
    peer.push(Push { commits: commits_to_server }).await?;

    Ok(SyncStatus { received, sent })
}

/// Server-side response construction for an inbound `BloomReq` (§4.6).
/// Served externally over HTTP; this computes the content.
pub fn answer_bloom_req(repo: &Repository, req: &BloomReq) -> BloomRsp {
    let local_ids = repo.all_commit_ids();
    let commits_to_client: Vec<Commit> = local_ids
        .iter()
        .filter(|id| !req.filter.may_contain(id.as_bytes()))
        .filter_map(|id| repo.get(id))
        .collect();

    let mut filter_to_client = BloomFilter::new(local_ids.len().max(1), req.expected_fpr);
    for id in &local_ids {
        filter_to_client.add(id.as_bytes());
    }
    BloomRsp { commits_to_client, filter_to_client }
}

/// Server-side handling of an inbound `Push` (§4.6).
pub fn answer_push(repo: &Repository, push: Push) -> Result<PushAck> {
    let report = repo.persist_verified_commits(push.commits)?;
    Ok(PushAck { accepted: report.accepted.len(), rejected: report.rejected.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Session;
    use crate::item::Item;
    use crate::repository::SessionResolver;
    use crate::schema::{FieldSchema, Schema};
    use crate::value::Value;
    use std::sync::Arc;

    struct AllowAll;
    impl SessionResolver for AllowAll {
        fn public_key_for(&self, _session_id: &str) -> Option<crate::crypto::PublicKey> {
            None
        }
    }

    struct LoopbackPeer {
        server: Repository,
    }

    #[async_trait]
    impl PeerTransport for LoopbackPeer {
        async fn bloom_exchange(&self, req: BloomReq) -> Result<BloomRsp> {
            Ok(answer_bloom_req(&self.server, &req))
        }
        async fn push(&self, push: Push) -> Result<PushAck> {
            answer_push(&self.server, push)
        }
    }

    fn schema() -> Schema {
        Schema::new("doc", 1).with_field("title", FieldSchema::required("string"))
    }

    fn item(title: &str) -> Item {
        Item::new(&schema(), [("title".to_string(), Value::String(title.into()))].into()).unwrap()
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("goatdb-sync-test-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn client_learns_server_only_commit() {
        let client_dir = temp_dir("client");
        let server_dir = temp_dir("server");
        let client = Repository::open(&client_dir, true, Arc::new(AllowAll)).unwrap();
        let server = Repository::open(&server_dir, true, Arc::new(AllowAll)).unwrap();

        let session = Session::generate("s1", None, i64::MAX);
        let commit = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        server.persist_verified_commits(vec![commit.clone()]).unwrap();

        let peer = LoopbackPeer { server };
        let status = run_round(&client, "/data/x", &peer, 100, 0.01).await.unwrap();
        assert_eq!(status.received, 1);

        let (loaded, _) = client.value_for_key("k1").unwrap().unwrap();
        assert_eq!(loaded.get("title"), Some(&Value::String("hello".into())));

        let _ = std::fs::remove_dir_all(&client_dir);
        let _ = std::fs::remove_dir_all(&server_dir);
    }
}
