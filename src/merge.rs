//! Merge engine: leader election, LCA discovery, per-field three-way
//! merge, merge-slot concurrency control (§4.5).

use std::sync::Arc;

use crate::commit::{Commit, CommitSource};
use crate::crypto::Session;
use crate::error::{GoatError, Result};
use crate::repository::{MergeHook, Repository};
use crate::schema::SchemaRegistry;
use crate::value::MergeTieBreak;

/// Sessions this process owns and may sign commits with, keyed by
/// session id — the set `MergeEngine` consults for leader election
/// (§4.5 step 1: "only a peer owning that session proceeds").
pub trait OwnedSessions: Send + Sync {
    fn session(&self, session_id: &str) -> Option<Session>;
}

pub struct MergeEngine {
    registry: Arc<SchemaRegistry>,
    owned_sessions: Arc<dyn OwnedSessions>,
    org_id: String,
}

impl MergeEngine {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        owned_sessions: Arc<dyn OwnedSessions>,
        org_id: impl Into<String>,
    ) -> Self {
        MergeEngine { registry, owned_sessions, org_id: org_id.into() }
    }

    /// Deterministic leader election: the session that authored the most
    /// recent leaf, tie-broken by commit id (§4.5 step 1).
    fn elect_leader(leaves: &[Commit]) -> &Commit {
        leaves
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
            .expect("leaves is non-empty; headForKey only calls merge with >= 2 leaves")
    }
}

impl MergeHook for MergeEngine {
    #[tracing::instrument(skip(self, repo, leaves), fields(key = %key))]
    fn merge(&self, repo: &Repository, key: &str, leaves: &[Commit]) -> Result<Option<Commit>> {
        let leader_commit = Self::elect_leader(leaves);
        let leader_session = match self.owned_sessions.session(&leader_commit.session) {
            Some(s) => s,
            None => {
                tracing::debug!("not the electing leader; waiting for merge commit via sync");
                return Ok(None);
            }
        };

        let base_result = repo.find_merge_base(leaves);
        let base_commit = base_result.base.ok_or(GoatError::CorruptLeaf(key.to_string()))?;

        let mut base_item = base_commit
            .materialise(repo)
            .map_err(|_| GoatError::CorruptLeaf(key.to_string()))?;

        if let Some(target_ref) = &base_result.schema {
            if base_item.schema.version < target_ref.version {
                base_item = base_item.upgrade_to(&self.registry, target_ref.version)?;
            }
        }
        let target_schema = self.registry.lookup(&base_item.schema.namespace, base_item.schema.version)?;

        let mut leaf_items = Vec::new();
        for leaf in leaves {
            let item = leaf
                .materialise(repo)
                .map_err(|_| GoatError::CorruptLeaf(key.to_string()))?;
            if item.schema.version < base_item.schema.version {
                leaf_items.push((leaf, item.upgrade_to(&self.registry, base_item.schema.version)?));
            } else {
                leaf_items.push((leaf, item));
            }
        }

        // Reduce all leaves pairwise through the shared base, left to
        // right; with exactly two leaves (the common case) this is a
        // single three-way merge.
        let (first_leaf, first_item) = &leaf_items[0];
        let mut merged = first_item.clone();
        let mut merged_timestamp = first_leaf.timestamp;
        let mut merged_id = first_leaf.id.clone();

        for (leaf, item) in &leaf_items[1..] {
            let tie = MergeTieBreak::new(merged_timestamp, merged_id.clone(), leaf.timestamp, leaf.id.clone());
            merged = merge_fields(&base_item, &merged, item, &target_schema, &tie)?;
            if leaf.timestamp > merged_timestamp
                || (leaf.timestamp == merged_timestamp && leaf.id < merged_id)
            {
                merged_timestamp = leaf.timestamp;
                merged_id = leaf.id.clone();
            }
        }

        let mut sorted_leaves: Vec<Commit> = leaves.to_vec();
        sorted_leaves.sort_by(|a, b| a.id.cmp(&b.id));

        let commit = Commit::build_merge(
            &leader_session,
            key,
            &self.org_id,
            &base_commit.id,
            &base_item,
            &merged,
            &sorted_leaves,
            &leader_session.id,
        )?;
        tracing::info!(merge_commit = %commit.id, "merge commit emitted");
        Ok(Some(commit))
    }
}

/// Per-field `merge3` dispatch over the target schema (§4.5 step 4).
fn merge_fields(
    base: &crate::item::Item,
    a: &crate::item::Item,
    b: &crate::item::Item,
    schema: &crate::schema::Schema,
    tie: &MergeTieBreak,
) -> Result<crate::item::Item> {
    let mut data = std::collections::BTreeMap::new();
    for field in schema.fields.keys() {
        let base_v = base.get(field);
        let a_v = a.get(field);
        let b_v = b.get(field);
        let merged = match (base_v, a_v, b_v) {
            (Some(base_v), Some(a_v), Some(b_v)) => crate::value::Value::merge3(base_v, a_v, b_v, tie)?,
            (_, Some(a_v), None) => a_v.clone(),
            (_, None, Some(b_v)) => b_v.clone(),
            (_, Some(a_v), Some(b_v)) => {
                // Neither side has a base value to diff against (both
                // introduced the field independently); merge3 with the
                // base standing in for `a` degenerates to "pick by tie".
                crate::value::Value::merge3(a_v, a_v, b_v, tie).unwrap_or_else(|_| a_v.clone())
            }
            (_, None, None) => continue,
        };
        data.insert(field.clone(), merged);
    }
    crate::item::Item::new(schema, data)
}
