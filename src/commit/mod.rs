//! Commits: content-addressed, signed, immutable nodes of a per-key DAG
//! (§3, §4.3).

pub mod canonical;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::crypto::{self, PublicKey, Session};
use crate::error::{GoatError, Result};
use crate::item::Item;
use crate::value::FieldChange;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Four-tuple identifying the code and schema generation that produced a
/// commit (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub schema_gen: u32,
}

impl Default for BuildVersion {
    fn default() -> Self {
        BuildVersion {
            major: 0,
            minor: 1,
            patch: 0,
            schema_gen: 1,
        }
    }
}

/// `{changes, srcChecksum, dstChecksum}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edit {
    pub changes: BTreeMap<String, Vec<FieldChange>>,
    #[serde(rename = "srcChecksum")]
    pub src_checksum: u64,
    #[serde(rename = "dstChecksum")]
    pub dst_checksum: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CommitContents {
    Document { item: Item },
    Delta { base: String, edit: Edit },
}

fn frozen_true() -> AtomicBool {
    AtomicBool::new(true)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub key: String,
    pub session: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    pub timestamp: i64,
    #[serde(rename = "buildVersion")]
    pub build_version: BuildVersion,
    pub parents: Vec<String>,
    #[serde(rename = "ancestorsFilter")]
    pub ancestors_filter: BloomFilter,
    #[serde(rename = "ancestorsCount")]
    pub ancestors_count: u64,
    pub contents: CommitContents,
    pub signature: String,
    #[serde(rename = "mergeBase", skip_serializing_if = "Option::is_none")]
    pub merge_base: Option<String>,
    #[serde(rename = "mergeLeader", skip_serializing_if = "Option::is_none")]
    pub merge_leader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert: Option<String>,
    /// Commits are frozen after deserialisation/construction (§3); this
    /// flag exists only to guard `reload_from_bytes`, the one place a
    /// caller might otherwise mutate an already-frozen instance in place.
    #[serde(skip, default = "frozen_true")]
    frozen: AtomicBool,
}

impl Clone for Commit {
    fn clone(&self) -> Self {
        Commit {
            id: self.id.clone(),
            key: self.key.clone(),
            session: self.session.clone(),
            org_id: self.org_id.clone(),
            timestamp: self.timestamp,
            build_version: self.build_version,
            parents: self.parents.clone(),
            ancestors_filter: self.ancestors_filter.clone(),
            ancestors_count: self.ancestors_count,
            contents: self.contents.clone(),
            signature: self.signature.clone(),
            merge_base: self.merge_base.clone(),
            merge_leader: self.merge_leader.clone(),
            revert: self.revert.clone(),
            frozen: AtomicBool::new(self.frozen.load(Ordering::Relaxed)),
        }
    }
}

/// Narrow read boundary `materialise`/`isCorrupted` use to walk parent
/// chains, implemented by `Repository` — kept here (rather than taking a
/// concrete `Repository`) so this module has no dependency on storage.
pub trait CommitSource {
    fn get(&self, id: &str) -> Option<Commit>;
}

#[derive(Serialize)]
struct CommitBody<'a> {
    key: &'a str,
    session: &'a str,
    #[serde(rename = "orgId")]
    org_id: &'a str,
    timestamp: i64,
    #[serde(rename = "buildVersion")]
    build_version: BuildVersion,
    parents: &'a [String],
    #[serde(rename = "ancestorsFilter")]
    ancestors_filter: &'a BloomFilter,
    #[serde(rename = "ancestorsCount")]
    ancestors_count: u64,
    contents: &'a CommitContents,
    #[serde(rename = "mergeBase", skip_serializing_if = "Option::is_none")]
    merge_base: &'a Option<String>,
    #[serde(rename = "mergeLeader", skip_serializing_if = "Option::is_none")]
    merge_leader: &'a Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revert: &'a Option<String>,
}

impl Commit {
    fn to_body(&self) -> CommitBody<'_> {
        CommitBody {
            key: &self.key,
            session: &self.session,
            org_id: &self.org_id,
            timestamp: self.timestamp,
            build_version: self.build_version,
            parents: &self.parents,
            ancestors_filter: &self.ancestors_filter,
            ancestors_count: self.ancestors_count,
            contents: &self.contents,
            merge_base: &self.merge_base,
            merge_leader: &self.merge_leader,
            revert: &self.revert,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }

    fn assemble(
        session: &Session,
        key: &str,
        org_id: &str,
        contents: CommitContents,
        parents: &[Commit],
        merge_base: Option<String>,
        merge_leader: Option<String>,
        revert: Option<String>,
    ) -> Result<Commit> {
        let (ancestors_filter, ancestors_count) = ancestor_summary(parents);
        let mut parent_ids: Vec<String> = parents.iter().map(|p| p.id.clone()).collect();
        parent_ids.sort();

        let mut commit = Commit {
            id: String::new(),
            key: key.to_string(),
            session: session.id.clone(),
            org_id: org_id.to_string(),
            timestamp: now_ms(),
            build_version: BuildVersion::default(),
            parents: parent_ids,
            ancestors_filter,
            ancestors_count,
            contents,
            signature: String::new(),
            merge_base,
            merge_leader,
            revert,
            frozen: AtomicBool::new(false),
        };
        commit.id = canonical::content_hash(&commit.to_body())?;
        let body = canonical::to_canonical_bytes(&commit.to_body())?;
        commit.signature = session.sign(&body)?;
        commit.frozen.store(true, Ordering::Relaxed);
        Ok(commit)
    }

    /// `buildDocument(session, key, item, parents)` (§4.3).
    pub fn build_document(
        session: &Session,
        key: &str,
        org_id: &str,
        item: &Item,
        parents: &[Commit],
    ) -> Result<Commit> {
        Self::assemble(
            session,
            key,
            org_id,
            CommitContents::Document { item: item.clone() },
            parents,
            None,
            None,
            None,
        )
    }

    /// `buildDelta(session, key, base, item, parents)` (§4.3): computes
    /// `edit = diff(base.item, item)`.
    pub fn build_delta(
        session: &Session,
        key: &str,
        org_id: &str,
        base_id: &str,
        base_item: &Item,
        new_item: &Item,
        parents: &[Commit],
    ) -> Result<Commit> {
        let edit = Edit {
            changes: base_item.diff(new_item),
            src_checksum: base_item.checksum(),
            dst_checksum: new_item.checksum(),
        };
        Self::assemble(
            session,
            key,
            org_id,
            CommitContents::Delta {
                base: base_id.to_string(),
                edit,
            },
            parents,
            None,
            None,
            None,
        )
    }

    /// A merge commit: a Delta with `parents = sort(leaves)`, `mergeBase`,
    /// `mergeLeader` (§4.5 step 5).
    pub fn build_merge(
        session: &Session,
        key: &str,
        org_id: &str,
        merge_base_id: &str,
        base_item: &Item,
        merged_item: &Item,
        leaves: &[Commit],
        merge_leader: &str,
    ) -> Result<Commit> {
        let edit = Edit {
            changes: base_item.diff(merged_item),
            src_checksum: base_item.checksum(),
            dst_checksum: merged_item.checksum(),
        };
        Self::assemble(
            session,
            key,
            org_id,
            CommitContents::Delta {
                base: merge_base_id.to_string(),
                edit,
            },
            leaves,
            Some(merge_base_id.to_string()),
            Some(merge_leader.to_string()),
            None,
        )
    }

    /// Appends a commit whose `revert` names `reverted` and whose
    /// contents are its logical inverse: a fresh Document snapshotting
    /// the item as it stood immediately before `reverted` was applied
    /// (per DESIGN.md's Open Question decision — commit-level tombstones
    /// via `revert`, not a schema field).
    pub fn build_revert(
        session: &Session,
        key: &str,
        org_id: &str,
        reverted: &Commit,
        prior_item: &Item,
        parents: &[Commit],
    ) -> Result<Commit> {
        Self::assemble(
            session,
            key,
            org_id,
            CommitContents::Document {
                item: prior_item.clone(),
            },
            parents,
            None,
            None,
            Some(reverted.id.clone()),
        )
    }

    /// `verify(publicKey)` (§4.3).
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        match canonical::to_canonical_bytes(&self.to_body()) {
            Ok(body) => crypto::verify_signature(public_key, &body, &self.signature).is_ok(),
            Err(_) => false,
        }
    }

    /// `materialise(repo)` (§4.3): recursively applies delta chains.
    pub fn materialise(&self, source: &dyn CommitSource) -> Result<Item> {
        match &self.contents {
            CommitContents::Document { item } => Ok(item.clone()),
            CommitContents::Delta { base, edit } => {
                let base_commit = source.get(base).ok_or(GoatError::OrphanCommit)?;
                let base_item = base_commit.materialise(source)?;
                base_item.patch(&edit.changes)
            }
        }
    }

    /// `isCorrupted(repo)` (§4.3).
    pub fn is_corrupted(&self, source: &dyn CommitSource) -> bool {
        match &self.contents {
            CommitContents::Document { .. } => false,
            CommitContents::Delta { base, edit } => {
                let base_commit = match source.get(base) {
                    Some(c) => c,
                    None => return true,
                };
                let base_item = match base_commit.materialise(source) {
                    Ok(i) => i,
                    Err(_) => return true,
                };
                if edit.src_checksum != base_item.checksum() {
                    return true;
                }
                match self.materialise(source) {
                    Ok(item) => edit.dst_checksum != item.checksum(),
                    Err(_) => true,
                }
            }
        }
    }

    /// Canonical encoding of the full record (contents only, minus `id`
    /// and `signature`) — the input to `id` and `signature` (§4.3).
    pub fn canonical_body_bytes(&self) -> Result<Vec<u8>> {
        canonical::to_canonical_bytes(&self.to_body())
    }

    /// Serialises the full frozen commit (including `id`/`signature`) as
    /// one NDJSON log record.
    pub fn to_log_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_log_bytes(bytes: &[u8]) -> Result<Commit> {
        let commit: Commit = serde_json::from_slice(bytes)?;
        commit.frozen.store(true, Ordering::Relaxed);
        Ok(commit)
    }

    /// Re-parses `bytes` into a fresh commit, refusing if `self` is
    /// already frozen — "re-deserialising a frozen commit fails with
    /// `AlreadyFrozen`" (§3). Every commit obtained through the normal
    /// constructors is frozen immediately, so in practice this only
    /// guards against an accidental double-load onto the same handle.
    pub fn reload_from_bytes(&self, bytes: &[u8]) -> Result<Commit> {
        if self.is_frozen() {
            return Err(GoatError::AlreadyFrozen);
        }
        Commit::from_log_bytes(bytes)
    }
}

fn ancestor_summary(parents: &[Commit]) -> (BloomFilter, u64) {
    let mut filter = BloomFilter::new(crate::bloom::DEFAULT_CAPACITY, crate::bloom::DEFAULT_FPR);
    for p in parents {
        filter.union_with(&p.ancestors_filter);
        filter.add(p.id.as_bytes());
    }
    let total = parents.iter().map(|p| p.ancestors_count).sum::<u64>() + parents.len() as u64;
    (filter, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, Schema};
    use crate::value::Value;
    use std::collections::BTreeMap as Map;

    struct MapSource(Map<String, Commit>);
    impl CommitSource for MapSource {
        fn get(&self, id: &str) -> Option<Commit> {
            self.0.get(id).cloned()
        }
    }

    fn doc_schema() -> Schema {
        Schema::new("doc", 1).with_field("title", FieldSchema::required("string"))
    }

    fn item(title: &str) -> Item {
        Item::new(
            &doc_schema(),
            [("title".to_string(), Value::String(title.into()))].into(),
        )
        .unwrap()
    }

    #[test]
    fn build_document_verifies_and_detects_tamper() {
        let session = Session::generate("s1", None, i64::MAX);
        let commit = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        let pk = session.public_key().unwrap();
        assert!(commit.verify(&pk));

        let mut tampered = commit.clone();
        tampered.timestamp += 1;
        assert!(!tampered.verify(&pk));
    }

    #[test]
    fn delta_materialises_through_document_base() {
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        let delta = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &item("hello"),
            &item("world"),
            &[root.clone()],
        )
        .unwrap();

        let mut store = Map::new();
        store.insert(root.id.clone(), root.clone());
        store.insert(delta.id.clone(), delta.clone());
        let source = MapSource(store);

        let materialised = delta.materialise(&source).unwrap();
        assert_eq!(materialised.get("title"), Some(&Value::String("world".into())));
        assert!(!delta.is_corrupted(&source));
    }

    #[test]
    fn tampered_checksum_is_detected_as_corrupted() {
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        let mut delta = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &item("hello"),
            &item("world"),
            &[root.clone()],
        )
        .unwrap();
        if let CommitContents::Delta { edit, .. } = &mut delta.contents {
            edit.src_checksum = edit.src_checksum.wrapping_add(1);
        }

        let mut store = Map::new();
        store.insert(root.id.clone(), root.clone());
        let source = MapSource(store);
        assert!(delta.is_corrupted(&source));
    }

    #[test]
    fn root_and_merge_classification() {
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        assert!(root.is_root());
        assert!(!root.is_merge());
    }
}
