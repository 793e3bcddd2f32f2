//! Database facade (§4.8): repository lifecycle, `ManagedItem` with
//! debounced dirty-field commits, materialised `Query`, and the
//! application-facing `sync`/`flush` entry points.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::commit::{Commit, CommitSource};
use crate::config::Config;
use crate::crypto::Session;
use crate::error::{GoatError, Result};
use crate::item::Item;
use crate::merge::{MergeEngine, OwnedSessions};
use crate::repository::{Repository, RepoEvent, SessionResolver};
use crate::schema::Schema;
use crate::sync::PeerTransport;
use crate::value::Value;

/// Default debounce window for `ManagedItem` dirty-field coalescing
/// (§4.8).
pub const DEBOUNCE: Duration = Duration::from_millis(100);

fn generate_key() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

fn split_item_path(item_path: &str) -> Result<(&str, &str)> {
    match item_path.rsplit_once('/') {
        Some((repo, key)) if !repo.is_empty() && !key.is_empty() => Ok((repo, key)),
        _ => Err(GoatError::InvalidPath(item_path.to_string())),
    }
}

pub struct Database {
    config: Config,
    session_resolver: Arc<dyn SessionResolver>,
    owned_sessions: Arc<dyn OwnedSessions>,
    repos: RwLock<BTreeMap<String, Arc<Repository>>>,
    managed_items: Mutex<Vec<Weak<ManagedItem>>>,
}

impl Database {
    pub fn new(
        config: Config,
        session_resolver: Arc<dyn SessionResolver>,
        owned_sessions: Arc<dyn OwnedSessions>,
    ) -> Database {
        Database {
            config,
            session_resolver,
            owned_sessions,
            repos: RwLock::new(BTreeMap::new()),
            managed_items: Mutex::new(Vec::new()),
        }
    }

    /// `open(path)` (§4.8): opens lazily, wiring a fresh `MergeEngine` as
    /// the repository's merge hook on first open.
    pub fn open(&self, repo_path: &str) -> Result<Arc<Repository>> {
        if let Some(repo) = self.repos.read().get(repo_path) {
            return Ok(repo.clone());
        }
        let full_path: PathBuf = self.config.path.join(repo_path);
        let repo = Arc::new(Repository::open(full_path, self.config.trusted, self.session_resolver.clone())?);
        let engine = MergeEngine::new(self.config.registry.clone(), self.owned_sessions.clone(), self.config.org_id.clone());
        repo.set_merge_hook(Arc::new(engine));
        self.repos.write().insert(repo_path.to_string(), repo.clone());
        Ok(repo)
    }

    pub fn close(&self, repo_path: &str) -> Result<()> {
        if let Some(repo) = self.repos.write().remove(repo_path) {
            repo.close()?;
        }
        Ok(())
    }

    /// `create(repoPath, schema, data) → ManagedItem` (§4.8): appends the
    /// first commit under a freshly generated key.
    pub fn create(
        &self,
        repo_path: &str,
        schema: &Schema,
        data: BTreeMap<String, Value>,
        session: Session,
    ) -> Result<Arc<ManagedItem>> {
        let repo = self.open(repo_path)?;
        let item = Item::new(schema, data)?;
        let key = generate_key();
        let commit = Commit::build_document(&session, &key, &self.config.org_id, &item, &[])?;
        repo.persist_verified_commits(vec![commit])?;
        Ok(self.track(ManagedItem::new(repo, repo_path.to_string(), self.config.org_id.clone(), key, schema.clone(), session)))
    }

    /// `load(itemPath, schema, data)` (§4.8): idempotent bulk load; an
    /// existing item is upgraded to `schema`'s version rather than
    /// overwritten.
    pub fn load(
        &self,
        item_path: &str,
        schema: &Schema,
        data: BTreeMap<String, Value>,
        session: Session,
    ) -> Result<Arc<ManagedItem>> {
        let (repo_path, key) = split_item_path(item_path)?;
        let repo = self.open(repo_path)?;
        if repo.value_for_key(key)?.is_some() {
            return Ok(self.track(ManagedItem::new(repo, repo_path.to_string(), self.config.org_id.clone(), key.to_string(), schema.clone(), session)));
        }
        let item = Item::new(schema, data)?;
        let commit = Commit::build_document(&session, key, &self.config.org_id, &item, &[])?;
        repo.persist_verified_commits(vec![commit])?;
        Ok(self.track(ManagedItem::new(repo, repo_path.to_string(), self.config.org_id.clone(), key.to_string(), schema.clone(), session)))
    }

    /// `item(repoPath, key) → ManagedItem` (§4.8): a lazy proxy onto a
    /// key that may or may not exist yet.
    pub fn item(&self, repo_path: &str, key: &str, schema: &Schema, session: Session) -> Result<Arc<ManagedItem>> {
        let repo = self.open(repo_path)?;
        Ok(self.track(ManagedItem::new(repo, repo_path.to_string(), self.config.org_id.clone(), key.to_string(), schema.clone(), session)))
    }

    fn track(&self, item: ManagedItem) -> Arc<ManagedItem> {
        let arc = Arc::new(item);
        self.managed_items.lock().push(Arc::downgrade(&arc));
        arc
    }

    /// `query({...})` (§4.8): builds and returns an incrementally-updated
    /// view over `repo_path`.
    pub fn query(&self, repo_path: &str, options: QueryOptions) -> Result<Arc<Query>> {
        let repo = self.open(repo_path)?;
        Ok(Query::open(repo, options))
    }

    /// `sync(repoPath)` (§4.8): one round against every supplied peer.
    pub async fn sync(&self, repo_path: &str, peers: &[(String, Arc<dyn PeerTransport>)]) -> SyncOutcome {
        let repo = match self.open(repo_path) {
            Ok(r) => r,
            Err(e) => return SyncOutcome { status: SyncStatusKind::Failure, errors: vec![e.to_string()] },
        };
        let mut errors = Vec::new();
        let mut any_ok = false;
        for (label, peer) in peers {
            match crate::sync::run_round(&repo, repo_path, peer.as_ref(), crate::bloom::DEFAULT_CAPACITY, crate::bloom::DEFAULT_FPR).await {
                Ok(_) => any_ok = true,
                Err(e) => errors.push(format!("{label}: {e}")),
            }
        }
        let status = if errors.is_empty() {
            SyncStatusKind::Success
        } else if any_ok {
            SyncStatusKind::Partial
        } else {
            SyncStatusKind::Failure
        };
        SyncOutcome { status, errors }
    }

    /// `flush(repoPath)` (§4.8): forces every tracked `ManagedItem` open
    /// against `repo_path` to commit its pending dirty fields now.
    pub fn flush(&self, repo_path: &str) -> Result<()> {
        self.managed_items.lock().retain(|weak| {
            if let Some(item) = weak.upgrade() {
                if item.repo_path() == repo_path {
                    let _ = item.flush();
                }
                true
            } else {
                false
            }
        });
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.managed_items.lock().retain(|weak| {
            if let Some(item) = weak.upgrade() {
                let _ = item.flush();
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatusKind {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub status: SyncStatusKind,
    pub errors: Vec<String>,
}

struct ManagedItemState {
    exists: bool,
    item: Option<Item>,
    head_id: Option<String>,
    dirty: BTreeMap<String, Value>,
    generation: u64,
}

/// A lazy proxy onto one item (§4.8). `get`/`set` read through the
/// in-memory dirty overlay; edits are coalesced and committed after
/// [`DEBOUNCE`] or on an explicit [`ManagedItem::flush`].
pub struct ManagedItem {
    repo: Arc<Repository>,
    repo_path: String,
    org_id: String,
    key: String,
    schema: Schema,
    session: Session,
    state: Arc<Mutex<ManagedItemState>>,
    generation: Arc<AtomicU64>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
}

impl ManagedItem {
    fn new(repo: Arc<Repository>, repo_path: String, org_id: String, key: String, schema: Schema, session: Session) -> Self {
        let (item, head_id, exists) = match repo.value_for_key(&key) {
            Ok(Some((item, head))) => (Some(item), Some(head.id), true),
            Ok(None) => (None, None, false),
            Err(_) => (None, None, false),
        };
        ManagedItem {
            repo,
            repo_path,
            org_id,
            key,
            schema,
            session,
            state: Arc::new(Mutex::new(ManagedItemState {
                exists,
                item,
                head_id,
                dirty: BTreeMap::new(),
                generation: 0,
            })),
            generation: Arc::new(AtomicU64::new(0)),
            // Repository lookups are synchronous in this implementation,
            // so by the time this proxy exists its initial state is
            // already resolved — `ready` starts true rather than false.
            ready: Arc::new(AtomicBool::new(true)),
            ready_notify: Arc::new(Notify::new()),
        }
    }

    fn repo_path(&self) -> &str {
        &self.repo_path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Completes once the repository has produced this item's initial
    /// value or confirmed its absence (§4.8). Always immediately ready
    /// here since the lookup already ran in the constructor.
    pub async fn ready_promise(&self) {
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        self.ready_notify.notified().await;
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        let state = self.state.lock();
        if let Some(v) = state.dirty.get(field) {
            return Some(v.clone());
        }
        state.item.as_ref().and_then(|i| i.get(field).cloned())
    }

    /// Records a dirty edit and schedules a debounced commit [`DEBOUNCE`]
    /// from now, unless superseded by a later edit first.
    pub fn set(&self, field: impl Into<String>, value: Value) {
        let my_generation = {
            let mut state = self.state.lock();
            state.dirty.insert(field.into(), value);
            state.generation += 1;
            state.generation
        };
        self.generation.store(my_generation, Ordering::Release);

        let repo = self.repo.clone();
        let org_id = self.org_id.clone();
        let key = self.key.clone();
        let schema = self.schema.clone();
        let session = self.session.clone();
        let state = self.state.clone();
        let generation = self.generation.clone();

        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if generation.load(Ordering::Acquire) == my_generation {
                if let Err(error) = commit_dirty(&repo, &org_id, &key, &schema, &session, &state) {
                    tracing::warn!(%error, key, "debounced commit failed");
                }
            }
        });
    }

    /// Forces any pending dirty fields to commit immediately (§4.8).
    pub fn flush(&self) -> Result<()> {
        commit_dirty(&self.repo, &self.org_id, &self.key, &self.schema, &self.session, &self.state)
    }
}

fn commit_dirty(
    repo: &Repository,
    org_id: &str,
    key: &str,
    schema: &Schema,
    session: &Session,
    state: &Mutex<ManagedItemState>,
) -> Result<()> {
    let mut guard = state.lock();
    if guard.dirty.is_empty() {
        return Ok(());
    }
    let dirty = std::mem::take(&mut guard.dirty);

    let commit = match (&guard.item, &guard.head_id) {
        (Some(current), Some(head_id)) => {
            let mut data = current.data.clone();
            data.extend(dirty);
            let new_item = Item::new(schema, data)?;
            let head = repo.get(head_id).ok_or(GoatError::OrphanCommit)?;
            Commit::build_delta(session, key, org_id, head_id, current, &new_item, std::slice::from_ref(&head))?
        }
        _ => {
            let new_item = Item::new(schema, dirty)?;
            Commit::build_document(session, key, org_id, &new_item, &[])?
        }
    };
    drop(guard);

    repo.persist_verified_commits(vec![commit])?;

    let mut guard = state.lock();
    if let Some((refreshed, head)) = repo.value_for_key(key)? {
        guard.item = Some(refreshed);
        guard.head_id = Some(head.id);
        guard.exists = true;
    }
    Ok(())
}

pub struct QueryOptions {
    pub predicate: Arc<dyn Fn(&Item) -> bool + Send + Sync>,
    pub sort_by: Option<Arc<dyn Fn(&Item, &Item) -> std::cmp::Ordering + Send + Sync>>,
    pub limit: Option<usize>,
}

/// `query({...})` (§4.8): a materialised, incrementally-updated view.
pub struct Query {
    repo: Arc<Repository>,
    options: QueryOptions,
    results: RwLock<Vec<Item>>,
    loaded: Arc<Notify>,
    loaded_flag: Arc<AtomicBool>,
}

impl Query {
    fn open(repo: Arc<Repository>, options: QueryOptions) -> Arc<Query> {
        let query = Arc::new(Query {
            repo: repo.clone(),
            options,
            results: RwLock::new(Vec::new()),
            loaded: Arc::new(Notify::new()),
            loaded_flag: Arc::new(AtomicBool::new(false)),
        });
        query.rescan();
        query.loaded_flag.store(true, Ordering::Release);
        query.loaded.notify_waiters();

        let mut rx = repo.subscribe();
        let weak = Arc::downgrade(&query);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(query) = weak.upgrade() else { break };
                match event {
                    RepoEvent::Committed(_) | RepoEvent::HeadChanged { .. } => query.rescan(),
                    RepoEvent::LeavesChanged { .. } => {}
                }
            }
        });
        query
    }

    fn rescan(&self) {
        let mut items: Vec<Item> = self
            .repo
            .all_keys()
            .into_iter()
            .filter_map(|key| self.repo.value_for_key(&key).ok().flatten())
            .map(|(item, _head)| item)
            .filter(|item| (self.options.predicate)(item))
            .collect();
        if let Some(sort_by) = &self.options.sort_by {
            items.sort_by(|a, b| sort_by(a, b));
        }
        if let Some(limit) = self.options.limit {
            items.truncate(limit);
        }
        *self.results.write() = items;
    }

    /// Completes once the initial scan has run (§4.8).
    pub async fn loading_finished(&self) {
        if self.loaded_flag.load(Ordering::Acquire) {
            return;
        }
        self.loaded.notified().await;
    }

    pub fn results(&self) -> Vec<Item> {
        self.results.read().clone()
    }
}
