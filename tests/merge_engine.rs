//! §8 scenarios 2-4: set-union across concurrent leaves, scalar
//! last-write-wins, and merge-order associativity across three peers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use goatdb_core::commit::Commit;
use goatdb_core::crypto::{PublicKey, Session};
use goatdb_core::item::Item;
use goatdb_core::merge::{MergeEngine, OwnedSessions};
use goatdb_core::repository::{Repository, SessionResolver};
use goatdb_core::schema::{FieldSchema, Schema, SchemaRegistry};
use goatdb_core::value::Value;

struct AllowAll;
impl SessionResolver for AllowAll {
    fn public_key_for(&self, _session_id: &str) -> Option<PublicKey> {
        None
    }
}

struct SingleOwnedSession(Session);
impl OwnedSessions for SingleOwnedSession {
    fn session(&self, session_id: &str) -> Option<Session> {
        if session_id == self.0.id {
            Some(self.0.clone())
        } else {
            None
        }
    }
}

fn note_schema() -> Schema {
    Schema::new("note", 1)
        .with_field("title", FieldSchema::required("string"))
        .with_field("body", FieldSchema::required("string"))
        .with_field("tags", FieldSchema::optional("set", || Value::Set(Vec::new())))
}

fn note(title: &str, body: &str, tags: &[&str]) -> Item {
    let mut data = BTreeMap::new();
    data.insert("title".to_string(), Value::String(title.into()));
    data.insert("body".to_string(), Value::String(body.into()));
    data.insert(
        "tags".to_string(),
        Value::Set(tags.iter().map(|s| Value::String(s.to_string())).collect()),
    );
    Item::new(&note_schema(), data).unwrap()
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "goatdb-merge-engine-test-{tag}-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ))
}

#[test]
fn set_union_merge_materialises_through_the_database_repository() {
    let dir = temp_dir("union");
    let session = Session::generate("s1", None, i64::MAX);
    let repo = Repository::open(&dir, true, Arc::new(AllowAll)).unwrap();

    let root = Commit::build_document(&session, "k1", "org", &note("t", "b", &["x"]), &[]).unwrap();
    let a = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("t", "b", &["x"]), &note("t", "b", &["x", "y"]),
        &[root.clone()],
    )
    .unwrap();
    let b = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("t", "b", &["x"]), &note("t", "b", &["x", "z"]),
        &[root.clone()],
    )
    .unwrap();
    repo.persist_verified_commits(vec![root, a, b]).unwrap();

    let registry = Arc::new(SchemaRegistry::new());
    registry.register(note_schema());
    repo.set_merge_hook(Arc::new(MergeEngine::new(registry, Arc::new(SingleOwnedSession(session)), "org")));

    let (item, head) = repo.value_for_key("k1").unwrap().unwrap();
    assert!(head.is_merge());
    let Value::Set(tags) = item.get("tags").unwrap() else { panic!("expected a set") };
    let mut names: Vec<String> = tags
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            _ => unreachable!(),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["x", "y", "z"]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn concurrent_scalar_edits_resolve_to_the_later_write() {
    let dir = temp_dir("lww");
    let session = Session::generate("s1", None, i64::MAX);
    let repo = Repository::open(&dir, true, Arc::new(AllowAll)).unwrap();

    let root = Commit::build_document(&session, "k1", "org", &note("base", "b", &[]), &[]).unwrap();
    repo.persist_verified_commits(vec![root.clone()]).unwrap();

    // earlier wall-clock leaf
    let remote = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("base", "b", &[]), &note("remote", "b", &[]),
        &[root.clone()],
    )
    .unwrap();
    sleep(Duration::from_millis(20));
    // later wall-clock leaf
    let local = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("base", "b", &[]), &note("local", "b", &[]),
        &[root.clone()],
    )
    .unwrap();
    assert!(local.timestamp > remote.timestamp);

    repo.persist_verified_commits(vec![remote, local]).unwrap();

    let registry = Arc::new(SchemaRegistry::new());
    registry.register(note_schema());
    repo.set_merge_hook(Arc::new(MergeEngine::new(registry, Arc::new(SingleOwnedSession(session)), "org")));

    let (item, _head) = repo.value_for_key("k1").unwrap().unwrap();
    assert_eq!(item.get("title"), Some(&Value::String("local".into())));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn three_way_field_merge_is_independent_of_persist_order() {
    let session = Session::generate("s1", None, i64::MAX);
    let root = Commit::build_document(&session, "k1", "org", &note("t0", "b0", &[]), &[]).unwrap();
    let by_title = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("t0", "b0", &[]), &note("t1", "b0", &[]),
        &[root.clone()],
    )
    .unwrap();
    let by_body = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("t0", "b0", &[]), &note("t0", "b1", &[]),
        &[root.clone()],
    )
    .unwrap();
    let by_tags = Commit::build_delta(
        &session, "k1", "org", &root.id,
        &note("t0", "b0", &[]), &note("t0", "b0", &["x"]),
        &[root.clone()],
    )
    .unwrap();

    let run = |order: [Commit; 3]| -> Item {
        let dir = temp_dir("assoc");
        let repo = Repository::open(&dir, true, Arc::new(AllowAll)).unwrap();
        repo.persist_verified_commits(vec![root.clone()]).unwrap();
        for c in order {
            repo.persist_verified_commits(vec![c]).unwrap();
        }
        let registry = Arc::new(SchemaRegistry::new());
        registry.register(note_schema());
        repo.set_merge_hook(Arc::new(MergeEngine::new(
            registry,
            Arc::new(SingleOwnedSession(session.clone())),
            "org",
        )));
        let (item, _head) = repo.value_for_key("k1").unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        item
    };

    let forward = run([by_title.clone(), by_body.clone(), by_tags.clone()]);
    let reverse = run([by_tags, by_body, by_title]);

    assert_eq!(forward.get("title"), Some(&Value::String("t1".into())));
    assert_eq!(forward.get("body"), Some(&Value::String("b1".into())));
    assert_eq!(forward.get("tags"), reverse.get("tags"));
    assert_eq!(forward.get("title"), reverse.get("title"));
    assert_eq!(forward.get("body"), reverse.get("body"));
}
