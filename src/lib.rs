//! `goatdb-core`: a local, signed, multi-peer, Bloom-filter-synced
//! document database — content-addressed per-item commit DAGs merged by
//! a CRDT three-way merge.

pub mod bloom;
pub mod commit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod item;
pub mod merge;
pub mod repository;
pub mod schema;
pub mod sessions;
pub mod storage;
pub mod sync;
pub mod value;

pub use config::Config;
pub use database::Database;
pub use error::{GoatError, Result};
pub use item::Item;
pub use repository::Repository;
pub use schema::{Schema, SchemaRegistry};
