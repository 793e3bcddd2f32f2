//! §8 integration properties: signature verification over the full
//! `build_document`/`build_delta` flow, and the `patch(diff(a,b))==b`
//! roundtrip across realistic multi-field schemas.

use std::collections::BTreeMap;

use goatdb_core::commit::Commit;
use goatdb_core::crypto::Session;
use goatdb_core::item::Item;
use goatdb_core::schema::{FieldSchema, Schema};
use goatdb_core::value::Value;

fn note_schema() -> Schema {
    Schema::new("note", 1)
        .with_field("title", FieldSchema::required("string"))
        .with_field("body", FieldSchema::required("string"))
        .with_field("archived", FieldSchema::optional("boolean", || Value::Boolean(false)))
}

fn note(title: &str, body: &str) -> Item {
    let data: BTreeMap<String, Value> = [
        ("title".to_string(), Value::String(title.into())),
        ("body".to_string(), Value::String(body.into())),
    ]
    .into();
    Item::new(&note_schema(), data).unwrap()
}

#[test]
fn document_commit_verifies_against_signer_and_rejects_tamper() {
    let session = Session::generate("writer", None, i64::MAX);
    let item = note("hello", "world");
    let commit = Commit::build_document(&session, "k1", "org", &item, &[]).unwrap();

    let pk = session.public_key().unwrap();
    assert!(commit.verify(&pk));

    // flip a byte of the canonical body by mutating any signed field and
    // re-checking against the now-stale signature.
    let mut tampered = commit.clone();
    tampered.key = "k2".to_string();
    assert!(!tampered.verify(&pk));

    // a signature produced by a different session must not verify either.
    let other = Session::generate("impostor", None, i64::MAX);
    let other_pk = other.public_key().unwrap();
    assert!(!commit.verify(&other_pk));
}

#[test]
fn delta_commit_round_trips_through_item_diff_patch() {
    let session = Session::generate("writer", None, i64::MAX);
    let base_item = note("hello", "world");
    let root = Commit::build_document(&session, "k1", "org", &base_item, &[]).unwrap();

    let next_item = base_item.set("title", Value::String("hello again".into()));
    let delta = Commit::build_delta(
        &session,
        "k1",
        "org",
        &root.id,
        &base_item,
        &next_item,
        &[root.clone()],
    )
    .unwrap();

    let pk = session.public_key().unwrap();
    assert!(delta.verify(&pk));

    // the delta's own diff/patch round-trips independent of commits.
    let changes = base_item.diff(&next_item);
    let patched = base_item.patch(&changes).unwrap();
    assert_eq!(patched, next_item);

    // diff(a,a) is empty.
    assert!(base_item.diff(&base_item).is_empty());
}

#[test]
fn diff_patch_roundtrips_across_optional_and_set_style_fields() {
    let schema = Schema::new("profile", 1)
        .with_field("name", FieldSchema::required("string"))
        .with_field("tags", FieldSchema::optional("set", || Value::Set(Vec::new())));

    let a = Item::new(
        &schema,
        [
            ("name".to_string(), Value::String("ada".into())),
            (
                "tags".to_string(),
                Value::Set(vec![Value::String("math".into())]),
            ),
        ]
        .into(),
    )
    .unwrap();
    let b = Item::new(
        &schema,
        [
            ("name".to_string(), Value::String("ada".into())),
            (
                "tags".to_string(),
                Value::Set(vec![
                    Value::String("math".into()),
                    Value::String("engineering".into()),
                ]),
            ),
        ]
        .into(),
    )
    .unwrap();

    let changes = a.diff(&b);
    let patched = a.patch(&changes).unwrap();
    assert_eq!(patched, b);
    assert!(a.diff(&a).is_empty());
}

#[test]
fn diff_patch_roundtrips_a_field_that_disappears_entirely() {
    let schema = Schema::new("profile", 1)
        .with_field("name", FieldSchema::required("string"))
        .with_field("bio", FieldSchema::required("string"));

    let a = Item::new(
        &schema,
        [
            ("name".to_string(), Value::String("ada".into())),
            ("bio".to_string(), Value::String("mathematician".into())),
        ]
        .into(),
    )
    .unwrap();
    // `b` has no `bio` at all — built directly rather than via `Item::new`,
    // since a required field can't be constructed missing through the
    // validating constructor.
    let mut data_without_bio = a.data.clone();
    data_without_bio.remove("bio");
    let b = Item { schema: a.schema.clone(), data: data_without_bio };

    let changes = a.diff(&b);
    let patched = a.patch(&changes).unwrap();
    assert_eq!(patched, b);
    assert!(patched.get("bio").is_none());
}
