//! Per-key commit DAG store: persistence, indices, leaf/head/value
//! caches, pending-parent queue, corruption checks (§4.4).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::commit::{Commit, CommitSource};
use crate::crypto::PublicKey;
use crate::error::{GoatError, Result};
use crate::item::Item;
use crate::storage::Storage;

/// The session-identity lookup `persistVerifiedCommits` needs to verify
/// signatures (§4.6: "the receiver looks up the signing session in
/// `/sys/sessions`"). Implemented by `sessions::SessionStore`; kept as a
/// trait here so this module doesn't depend on that one directly.
pub trait SessionResolver: Send + Sync {
    fn public_key_for(&self, session_id: &str) -> Option<PublicKey>;
}

/// The merge-engine boundary `headForKey` invokes when a key has more
/// than one leaf (§4.4, §4.5). Implemented by `merge::MergeEngine`.
/// Returns `Ok(None)` when this process doesn't own the electing
/// session and must simply wait for the merge commit to arrive via sync.
pub trait MergeHook: Send + Sync {
    fn merge(&self, repo: &Repository, key: &str, leaves: &[Commit]) -> Result<Option<Commit>>;
}

#[derive(Debug, Clone)]
pub enum RepoEvent {
    Committed(Commit),
    HeadChanged { key: String, head: Option<String> },
    LeavesChanged { key: String, count: usize },
}

#[derive(Debug, Default)]
pub struct PersistReport {
    pub accepted: Vec<String>,
    pub buffered: Vec<String>,
    pub rejected: Vec<String>,
}

enum InsertOutcome {
    Accepted,
    MissingParent,
    UnknownSession,
    Rejected(String),
}

/// The result of `findMergeBase` (§4.4): the subset of leaves actually
/// reduced into `base`, the base itself, the max schema among them, and
/// whether the pairwise walk ever reached a root.
pub struct MergeBaseResult {
    pub included: Vec<String>,
    pub base: Option<Commit>,
    pub schema: Option<crate::schema::SchemaRef>,
    pub reached_root: bool,
}

pub struct Repository {
    trusted: bool,
    storage: Mutex<Storage>,
    session_resolver: Arc<dyn SessionResolver>,
    merge_hook: RwLock<Option<Arc<dyn MergeHook>>>,

    commits: RwLock<BTreeMap<String, Commit>>,
    by_key: RwLock<BTreeMap<String, BTreeSet<String>>>,
    leaves: RwLock<BTreeMap<String, BTreeSet<String>>>,
    value_cache: RwLock<BTreeMap<String, (String, Item)>>,

    pending: RwLock<Vec<Commit>>,
    quarantine_session: RwLock<Vec<Commit>>,
    quarantined_keys: RwLock<BTreeMap<String, String>>,

    key_locks: RwLock<BTreeMap<String, Arc<Mutex<()>>>>,
    subscribers: RwLock<Vec<tokio::sync::mpsc::UnboundedSender<RepoEvent>>>,
}

impl CommitSource for Repository {
    fn get(&self, id: &str) -> Option<Commit> {
        self.commits.read().get(id).cloned()
    }
}

impl Repository {
    pub fn open(
        path: impl AsRef<Path>,
        trusted: bool,
        session_resolver: Arc<dyn SessionResolver>,
    ) -> Result<Repository> {
        let storage = Storage::open(path)?;
        let repo = Repository {
            trusted,
            storage: Mutex::new(storage),
            session_resolver,
            merge_hook: RwLock::new(None),
            commits: RwLock::new(BTreeMap::new()),
            by_key: RwLock::new(BTreeMap::new()),
            leaves: RwLock::new(BTreeMap::new()),
            value_cache: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(Vec::new()),
            quarantine_session: RwLock::new(Vec::new()),
            quarantined_keys: RwLock::new(BTreeMap::new()),
            key_locks: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(Vec::new()),
        };
        let existing = repo.storage.lock().load_all()?;
        let report = repo.persist_verified_commits(existing)?;
        tracing::info!(
            accepted = report.accepted.len(),
            buffered = report.buffered.len(),
            rejected = report.rejected.len(),
            "repository opened"
        );
        Ok(repo)
    }

    /// Closing flushes pending commits — here, "flush" means logging
    /// anything still unresolved; a commit with a genuinely missing
    /// parent cannot be written regardless (§3 "repositories ... closed
    /// either explicitly or on database shutdown; closing flushes any
    /// pending commits").
    pub fn close(&self) -> Result<()> {
        let pending = self.pending.read().len();
        let quarantined = self.quarantine_session.read().len();
        if pending > 0 || quarantined > 0 {
            tracing::warn!(pending, quarantined, "closing repository with unresolved commits");
        }
        Ok(())
    }

    pub fn set_merge_hook(&self, hook: Arc<dyn MergeHook>) {
        *self.merge_hook.write() = Some(hook);
    }

    pub fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.key_locks.read().get(key) {
            return lock.clone();
        }
        self.key_locks
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<RepoEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    fn publish(&self, event: RepoEvent) {
        self.subscribers.write().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// `persistVerifiedCommits(commits)` (§4.4): atomic bulk insert with
    /// re-examination of the pending-parent queue after each round of
    /// progress.
    #[tracing::instrument(skip(self, commits))]
    pub fn persist_verified_commits(&self, commits: Vec<Commit>) -> Result<PersistReport> {
        let mut report = PersistReport::default();
        let mut queue = commits;
        queue.extend(self.pending.write().drain(..));

        loop {
            let mut still_pending = Vec::new();
            let mut made_progress = false;
            for commit in queue.drain(..) {
                match self.try_insert(&commit)? {
                    InsertOutcome::Accepted => {
                        report.accepted.push(commit.id.clone());
                        made_progress = true;
                    }
                    InsertOutcome::MissingParent => still_pending.push(commit),
                    InsertOutcome::UnknownSession => {
                        tracing::warn!(commit = %commit.id, "quarantined: unknown signing session");
                        report.buffered.push(commit.id.clone());
                        self.quarantine_session.write().push(commit);
                    }
                    InsertOutcome::Rejected(reason) => {
                        tracing::warn!(commit = %commit.id, reason, "rejected commit");
                        report.rejected.push(commit.id.clone());
                    }
                }
            }
            queue = still_pending;
            if !made_progress || queue.is_empty() {
                break;
            }
        }
        *self.pending.write() = queue;
        Ok(report)
    }

    fn try_insert(&self, commit: &Commit) -> Result<InsertOutcome> {
        for pid in &commit.parents {
            if self.get(pid).is_none() {
                return Ok(InsertOutcome::MissingParent);
            }
        }
        if !self.trusted {
            match self.session_resolver.public_key_for(&commit.session) {
                Some(pk) => {
                    if !commit.verify(&pk) {
                        return Ok(InsertOutcome::Rejected("signature verification failed".into()));
                    }
                }
                None => return Ok(InsertOutcome::UnknownSession),
            }
        }
        if commit.is_corrupted(self) {
            return Ok(InsertOutcome::Rejected("corrupt commit".into()));
        }
        self.insert_verified(commit.clone())?;
        Ok(InsertOutcome::Accepted)
    }

    fn insert_verified(&self, commit: Commit) -> Result<()> {
        let key = commit.key.clone();
        let id = commit.id.clone();

        self.storage.lock().append(&commit)?;
        self.commits.write().insert(id.clone(), commit.clone());
        self.by_key.write().entry(key.clone()).or_default().insert(id);

        self.recompute_leaves(&key);
        self.value_cache.write().remove(&key);

        self.publish(RepoEvent::Committed(commit));
        let leaf_count = self.leaves.read().get(&key).map(BTreeSet::len).unwrap_or(0);
        self.publish(RepoEvent::LeavesChanged { key: key.clone(), count: leaf_count });
        if leaf_count == 1 {
            let head = self.leaves.read().get(&key).and_then(|s| s.iter().next().cloned());
            self.publish(RepoEvent::HeadChanged { key, head });
        }
        Ok(())
    }

    fn recompute_leaves(&self, key: &str) {
        let ids = self.by_key.read().get(key).cloned().unwrap_or_default();
        let commits = self.commits.read();
        let mut referenced_as_parent: BTreeSet<String> = BTreeSet::new();
        for id in &ids {
            if let Some(c) = commits.get(id) {
                referenced_as_parent.extend(c.parents.iter().cloned());
            }
        }
        drop(commits);
        let leaves: BTreeSet<String> =
            ids.into_iter().filter(|id| !referenced_as_parent.contains(id)).collect();
        self.leaves.write().insert(key.to_string(), leaves);
    }

    /// `leavesForKey(k)` (§4.4), sorted for determinism.
    pub fn leaves_for_key(&self, key: &str) -> Vec<String> {
        self.leaves.read().get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Every commit id known to this repository, for Bloom filter
    /// construction during sync (§4.6).
    pub fn all_commit_ids(&self) -> Vec<String> {
        self.commits.read().keys().cloned().collect()
    }

    /// Every key with at least one commit, for query scans (§4.8).
    pub fn all_keys(&self) -> Vec<String> {
        self.by_key.read().keys().cloned().collect()
    }

    /// `headForKey(k)` (§4.4): the sole leaf, or the merge result.
    pub fn head_for_key(&self, key: &str) -> Result<Option<Commit>> {
        let _guard = self.key_lock(key).lock();
        let leaves = self.leaves_for_key(key);
        if leaves.is_empty() {
            return Ok(None);
        }
        if leaves.len() == 1 {
            return Ok(self.get(&leaves[0]));
        }
        if let Some(reason) = self.quarantined_keys.read().get(key).cloned() {
            return Err(GoatError::CorruptLeaf(format!("{key}: {reason}")));
        }
        let hook = self
            .merge_hook
            .read()
            .clone()
            .ok_or_else(|| GoatError::ConfigurationInvalid("no merge hook configured".into()))?;
        let leaf_commits: Vec<Commit> = leaves.iter().filter_map(|id| self.get(id)).collect();
        match hook.merge(self, key, &leaf_commits) {
            Ok(Some(commit)) => {
                self.persist_verified_commits(vec![commit.clone()])?;
                Ok(Some(commit))
            }
            Ok(None) => Ok(None),
            Err(GoatError::CorruptLeaf(reason)) => {
                self.quarantined_keys.write().insert(key.to_string(), reason.clone());
                Err(GoatError::CorruptLeaf(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// `valueForKey(k)` (§4.4): `(item, head)`, memoised until the head
    /// changes.
    pub fn value_for_key(&self, key: &str) -> Result<Option<(Item, Commit)>> {
        let head = match self.head_for_key(key)? {
            Some(h) => h,
            None => return Ok(None),
        };
        if let Some((cached_head, item)) = self.value_cache.read().get(key).cloned() {
            if cached_head == head.id {
                return Ok(Some((item, head)));
            }
        }
        let item = head.materialise(self)?;
        self.value_cache.write().insert(key.to_string(), (head.id.clone(), item.clone()));
        Ok(Some((item, head)))
    }

    /// `commitIsHighProbabilityLeaf(c)` (§4.4): advisory; used by sync to
    /// prioritise.
    pub fn commit_is_high_probability_leaf(&self, c: &Commit) -> bool {
        let ids = self.by_key.read().get(&c.key).cloned().unwrap_or_default();
        let commits = self.commits.read();
        !ids.iter().any(|id| {
            id != &c.id
                && commits
                    .get(id)
                    .map(|other| other.ancestors_filter.may_contain(c.id.as_bytes()))
                    .unwrap_or(false)
        })
    }

    /// `commitsForKey(k)` (§4.4): sorted descending by timestamp, id
    /// tie-break.
    pub fn commits_for_key(&self, key: &str) -> Vec<Commit> {
        let ids = self.by_key.read().get(key).cloned().unwrap_or_default();
        let commits = self.commits.read();
        let mut out: Vec<Commit> = ids.iter().filter_map(|id| commits.get(id).cloned()).collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        out
    }

    fn schema_of(&self, commit: &Commit) -> Option<crate::schema::SchemaRef> {
        commit.materialise(self).ok().map(|item| item.schema)
    }

    /// `findMergeBase(commits)` (§4.4): reduces pairwise from left.
    pub fn find_merge_base(&self, commits: &[Commit]) -> MergeBaseResult {
        if commits.is_empty() {
            return MergeBaseResult { included: Vec::new(), base: None, schema: None, reached_root: false };
        }
        let mut included = vec![commits[0].id.clone()];
        let mut current = commits[0].clone();
        let mut reached_root = current.is_root();

        for next in &commits[1..] {
            match self.pairwise_lca(&current, next) {
                Some(lca) => {
                    reached_root = reached_root || current.is_root() || next.is_root() || lca.is_root();
                    current = lca;
                    included.push(next.id.clone());
                }
                None => continue, // undefined for this pair; dropped
            }
        }

        let schema = commits
            .iter()
            .filter(|c| included.contains(&c.id))
            .filter_map(|c| self.schema_of(c))
            .max_by_key(|s| s.version);

        MergeBaseResult { included, base: Some(current), schema, reached_root }
    }

    fn pairwise_lca(&self, a: &Commit, b: &Commit) -> Option<Commit> {
        let mut visited_a: BTreeMap<String, i64> = BTreeMap::from([(a.id.clone(), a.timestamp)]);
        let mut visited_b: BTreeMap<String, i64> = BTreeMap::from([(b.id.clone(), b.timestamp)]);

        if let Some(id) = intersect_pick(&visited_a, &visited_b) {
            return self.get(&id);
        }

        let mut frontier_a = vec![a.clone()];
        let mut frontier_b = vec![b.clone()];

        loop {
            let next_a = self.expand_frontier(&frontier_a, &mut visited_a);
            let next_b = self.expand_frontier(&frontier_b, &mut visited_b);

            if let Some(id) = intersect_pick(&visited_a, &visited_b) {
                return self.get(&id);
            }
            if next_a.is_empty() && next_b.is_empty() {
                return None;
            }
            frontier_a = next_a;
            frontier_b = next_b;
        }
    }

    fn expand_frontier(&self, frontier: &[Commit], visited: &mut BTreeMap<String, i64>) -> Vec<Commit> {
        let mut next = Vec::new();
        for c in frontier {
            for pid in &c.parents {
                if visited.contains_key(pid) {
                    continue;
                }
                if let Some(p) = self.get(pid) {
                    visited.insert(pid.clone(), p.timestamp);
                    next.push(p);
                }
            }
        }
        next
    }

    /// `rebase(key, localItem, fromHeadId)` (§4.4): local changes win on
    /// conflicting fields.
    pub fn rebase(&self, key: &str, local_item: &Item, from_head_id: &str) -> Result<Item> {
        let from_commit = self.get(from_head_id).ok_or(GoatError::OrphanCommit)?;
        let from_item = from_commit.materialise(self)?;
        let local_changes = from_item.diff(local_item);

        let current_head = self.head_for_key(key)?.ok_or(GoatError::OrphanCommit)?;
        let current_item = current_head.materialise(self)?;
        current_item.patch(&local_changes)
    }
}

fn intersect_pick(a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>) -> Option<String> {
    a.iter()
        .filter(|(id, _)| b.contains_key(*id))
        .max_by_key(|(id, ts)| (**ts, (*id).clone()))
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Session;
    use crate::item::Item;
    use crate::schema::{FieldSchema, Schema};
    use crate::value::Value;

    struct AllowAll;
    impl SessionResolver for AllowAll {
        fn public_key_for(&self, _session_id: &str) -> Option<PublicKey> {
            None
        }
    }

    fn schema() -> Schema {
        Schema::new("doc", 1).with_field("title", FieldSchema::required("string"))
    }

    fn item(title: &str) -> Item {
        Item::new(&schema(), [("title".to_string(), Value::String(title.into()))].into()).unwrap()
    }

    fn temp_repo() -> (Repository, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "goatdb-repo-test-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let repo = Repository::open(&dir, true, Arc::new(AllowAll)).unwrap();
        (repo, dir)
    }

    #[test]
    fn single_leaf_is_head() {
        let (repo, dir) = temp_repo();
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        repo.persist_verified_commits(vec![root.clone()]).unwrap();

        let head = repo.head_for_key("k1").unwrap().unwrap();
        assert_eq!(head.id, root.id);
        let (materialised, _) = repo.value_for_key("k1").unwrap().unwrap();
        assert_eq!(materialised.get("title"), Some(&Value::String("hello".into())));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn commit_with_missing_parent_is_buffered() {
        let (repo, dir) = temp_repo();
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("hello"), &[]).unwrap();
        let child = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &item("hello"),
            &item("world"),
            &[root.clone()],
        )
        .unwrap();

        // persist child before root is known: it must buffer, not reject.
        let report = repo.persist_verified_commits(vec![child.clone()]).unwrap();
        assert!(report.accepted.is_empty());
        assert!(report.rejected.is_empty());
        assert!(repo.head_for_key("k1").unwrap().is_none());

        let report = repo.persist_verified_commits(vec![root.clone()]).unwrap();
        assert!(report.accepted.contains(&root.id));
        assert!(report.accepted.contains(&child.id));
        assert_eq!(repo.head_for_key("k1").unwrap().unwrap().id, child.id);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_merge_base_returns_common_ancestor() {
        let (repo, dir) = temp_repo();
        let session = Session::generate("s1", None, i64::MAX);
        let root = Commit::build_document(&session, "k1", "org", &item("base"), &[]).unwrap();
        let a = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &item("base"),
            &item("a"),
            &[root.clone()],
        )
        .unwrap();
        let b = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &item("base"),
            &item("b"),
            &[root.clone()],
        )
        .unwrap();
        repo.persist_verified_commits(vec![root.clone(), a.clone(), b.clone()]).unwrap();

        let result = repo.find_merge_base(&[a, b]);
        assert_eq!(result.base.unwrap().id, root.id);
        assert!(result.reached_root);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rebase_preserves_non_overlapping_remote_change() {
        let (repo, dir) = temp_repo();
        let session = Session::generate("s1", None, i64::MAX);

        let schema = Schema::new("doc", 1)
            .with_field("title", FieldSchema::required("string"))
            .with_field("body", FieldSchema::required("string"));
        let mk = |title: &str, body: &str| {
            Item::new(
                &schema,
                [
                    ("title".to_string(), Value::String(title.into())),
                    ("body".to_string(), Value::String(body.into())),
                ]
                .into(),
            )
            .unwrap()
        };

        let root = Commit::build_document(&session, "k1", "org", &mk("t0", "b0"), &[]).unwrap();
        repo.persist_verified_commits(vec![root.clone()]).unwrap();

        // Remote advances the head with an edit to `body` only.
        let remote = Commit::build_delta(
            &session,
            "k1",
            "org",
            &root.id,
            &mk("t0", "b0"),
            &mk("t0", "b1"),
            &[root.clone()],
        )
        .unwrap();
        repo.persist_verified_commits(vec![remote.clone()]).unwrap();

        // Local, unsynced edit to `title` based on the stale root.
        let local_item = mk("t1", "b0");
        let rebased = repo.rebase("k1", &local_item, &root.id).unwrap();

        assert_eq!(rebased.get("title"), Some(&Value::String("t1".into())));
        assert_eq!(rebased.get("body"), Some(&Value::String("b1".into())));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
