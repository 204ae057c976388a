//! Server-authoritative in-process backend.
//!
//! `MemoryStorage` behaves like a remote persistent store: it assigns a
//! server `_id` on create, marks documents `_persisted`, applies every
//! write as confirmed and returns plain documents without sync annotations.
//! It is the reference remote for the command queue.

use crate::cache::LruStore;
use crate::document::{Document, DocumentExt, ID, PERSISTED};
use crate::error::{Error, Result};
use crate::keypath::KeyPath;
use crate::local::LocalStorage;
use crate::storage::{Options, Query, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

type IdGenerator = Box<dyn FnMut() -> String + Send>;

pub struct MemoryStorage {
    inner: LocalStorage,
    /// Registered bucket names; `None` accepts any bucket.
    models: Option<HashSet<String>>,
    next_id: Mutex<IdGenerator>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: LocalStorage::new(Arc::new(LruStore::new(usize::MAX))),
            models: None,
            next_id: Mutex::new(Box::new(|| uuid::Uuid::new_v4().to_string())),
        }
    }

    /// Draw server ids from `generator` instead of random uuids.
    pub fn with_id_generator(mut self, generator: impl FnMut() -> String + Send + 'static) -> Self {
        self.next_id = Mutex::new(Box::new(generator));
        self
    }

    /// Only accept the given bucket names; others fail with
    /// [`Error::ModelNotFound`].
    pub fn with_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: Some(models.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    fn check_models(&self, key_path: &KeyPath) -> Result<()> {
        let Some(models) = &self.models else {
            return Ok(());
        };
        for bucket in key_path.segments().iter().step_by(2) {
            if !models.contains(bucket) {
                return Err(Error::ModelNotFound(bucket.clone()));
            }
        }
        Ok(())
    }

    fn plain(docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter()
            .map(|mut doc| {
                doc.strip_annotation();
                doc
            })
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, key_path: &KeyPath, mut doc: Document, _opts: Options) -> Result<String> {
        self.check_models(key_path)?;
        let id = {
            let mut next = self.next_id.lock();
            (*next)()
        };
        doc.strip_annotation();
        doc.insert(ID.to_string(), Value::from(id.clone()));
        doc.insert(PERSISTED.to_string(), Value::Bool(true));
        self.inner.create_with_id(key_path, &id, doc)?;
        tracing::debug!(key = %key_path, id = %id, "remote create");
        Ok(id)
    }

    async fn put(&self, key_path: &KeyPath, mut doc: Document, _opts: Options) -> Result<()> {
        self.check_models(key_path)?;
        doc.strip_annotation();
        // Server ids are not client writable.
        doc.remove(ID);
        self.inner.put(key_path, doc, Options::insync()).await
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: Options) -> Result<Document> {
        self.check_models(key_path)?;
        self.inner.fetch(key_path, Options::insync()).await
    }

    async fn del(&self, key_path: &KeyPath, _opts: Options) -> Result<()> {
        self.check_models(key_path)?;
        self.inner.del(key_path, Options::insync()).await
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        _opts: Options,
    ) -> Result<()> {
        self.check_models(key_path)?;
        for id in item_ids {
            let item = items_key_path.child(id.clone())?;
            if self.inner.fetch(&item, Options::insync()).await.is_err() {
                return Err(Error::InvalidId(id.clone()));
            }
        }
        self.inner
            .add(key_path, items_key_path, item_ids, Options::insync())
            .await
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        _opts: Options,
    ) -> Result<()> {
        self.check_models(key_path)?;
        self.inner
            .remove(key_path, items_key_path, item_ids, Options::insync())
            .await
    }

    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        _opts: Options,
    ) -> Result<Vec<Document>> {
        self.check_models(key_path)?;
        let docs = self.inner.find(key_path, query, Options::default()).await?;
        Ok(Self::plain(docs))
    }

    async fn all(&self, key_path: &KeyPath, _opts: Options) -> Result<Vec<Document>> {
        self.check_models(key_path)?;
        let docs = self.inner.all(key_path, Options::default()).await?;
        Ok(Self::plain(docs))
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, _opts: Options) -> Result<()> {
        self.check_models(key_path)?;
        self.inner.delete_item(key_path, id, Options::insync()).await
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        _opts: Options,
    ) -> Result<String> {
        self.check_models(key_path)?;
        if self.inner.fetch(item_key_path, Options::insync()).await.is_err() {
            return Err(Error::InvalidId(item_key_path.to_key()));
        }
        self.inner
            .insert_before(key_path, ref_id, item_key_path, Options::insync())
            .await
    }
}
