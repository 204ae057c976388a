//! The storage contract every backend implements.
//!
//! The local cache, the reference in-memory backend and the command queue
//! all expose the same [`Storage`] trait, so the queue depends only on this
//! interface.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::keypath::KeyPath;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// This write confirms an earlier speculative write; do not queue it.
    pub insync: bool,
    /// Return the raw sync state, tombstones included.
    pub snapshot: bool,
    /// Skip the remote branch of a read.
    pub noremote: bool,
}

impl Options {
    pub fn insync() -> Self {
        Self {
            insync: true,
            ..Self::default()
        }
    }

    pub fn snapshot() -> Self {
        Self {
            snapshot: true,
            ..Self::default()
        }
    }

    pub fn noremote(mut self) -> Self {
        self.noremote = true;
        self
    }
}

/// Unordered set or ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Set,
    Sequence,
}

/// Field-equality filter for [`Storage::find`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    fields: Document,
}

impl Query {
    /// Match every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.fields.iter().all(|(k, v)| doc.get(k) == Some(v))
    }
}

/// Capability set of a storage backend.
///
/// Document operations are mandatory. `link`, `insert_after` and `ack` are
/// local-only capabilities and fail with [`Error::NotImplemented`] unless
/// a backend overrides them.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `doc` under `key_path + id` and return the id.
    async fn create(&self, key_path: &KeyPath, doc: Document, opts: Options) -> Result<String>;

    /// Merge the fields of `doc` into the existing document.
    async fn put(&self, key_path: &KeyPath, doc: Document, opts: Options) -> Result<()>;

    /// Fetch the document at `key_path`, following links.
    async fn fetch(&self, key_path: &KeyPath, opts: Options) -> Result<Document>;

    /// Delete the document at `key_path`.
    async fn del(&self, key_path: &KeyPath, opts: Options) -> Result<()>;

    /// Install a redirect from `new_key_path` to `target_key_path`.
    async fn link(&self, _new_key_path: &KeyPath, _target_key_path: &KeyPath) -> Result<()> {
        Err(Error::NotImplemented("link"))
    }

    /// Add `item_ids` (documents under `items_key_path`) to a set.
    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()>;

    /// Remove `item_ids` from a set.
    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()>;

    /// Member documents of a set (or all documents of a bucket).
    async fn find(&self, key_path: &KeyPath, query: &Query, opts: Options)
        -> Result<Vec<Document>>;

    /// Item documents of a sequence, in order.
    async fn all(&self, key_path: &KeyPath, opts: Options) -> Result<Vec<Document>>;

    /// Remove the sequence entry `id`.
    async fn delete_item(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()>;

    /// Insert the document at `item_key_path` before entry `ref_id`
    /// (the end of the sequence when `None`). Returns the entry id.
    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
    ) -> Result<String>;

    /// Insert after entry `ref_id` (the beginning when `None`).
    async fn insert_after(
        &self,
        _key_path: &KeyPath,
        _ref_id: Option<&str>,
        _item_key_path: &KeyPath,
        _opts: Options,
    ) -> Result<String> {
        Err(Error::NotImplemented("insertAfter"))
    }

    /// Confirm a pending entry (`ib` becomes `insync`, `rm` is unlinked).
    async fn ack(&self, _key_path: &KeyPath, _id: &str, _opts: Options) -> Result<()> {
        Err(Error::NotImplemented("ack"))
    }
}
