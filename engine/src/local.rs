//! Local cache storage.
//!
//! Implements the [`Storage`] contract over a [`KeyValueStore`]. Every
//! cache value is a JSON-serialized [`Entry`]:
//!
//! - documents, with the keys of the links that point at them;
//! - links, redirecting a key path prefix after an id remap;
//! - collection patterns, standing in for "every document under a bucket";
//! - membership sets and sequences.
//!
//! Key paths are resolved prefix by prefix, so a link installed for
//! `zoo@s1` also redirects `zoo@s1@animals@a7`. Traversal is bounded to
//! fail fast on cyclic links.

use crate::cache::{KeyValueStore, LruStore};
use crate::config::CacheConfig;
use crate::document::{new_cid, Document, DocumentExt, SyncState, CID};
use crate::error::{Error, Result};
use crate::keypath::{KeyPath, KEY_SEPARATOR};
use crate::sequence::{NodeIndex, Sequence, BEGIN, END};
use crate::storage::{Options, Query, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Default bound on link hops while resolving a key path.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 16;

/// A record stored in the key/value cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entry {
    Document {
        doc: Document,
        /// Keys of links redirecting here.
        #[serde(default)]
        aliases: Vec<String>,
    },
    Link {
        target: String,
    },
    /// Every document keyed `prefix@<id>`, adjusted by membership writes.
    Collection {
        prefix: String,
        /// Sync state of members written through `add`/`remove`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        overrides: BTreeMap<String, SyncState>,
        /// Documents whose removal the remote confirmed.
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        excluded: BTreeSet<String>,
    },
    Set {
        items: KeyPath,
        members: BTreeMap<String, SyncState>,
    },
    Sequence {
        list: Sequence,
    },
}

/// Storage backed by a bounded key/value cache.
pub struct LocalStorage {
    store: Arc<dyn KeyValueStore>,
    max_link_depth: usize,
    /// Serializes read-modify-write cycles.
    write: Mutex<()>,
}

impl LocalStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_link_depth(store, DEFAULT_MAX_LINK_DEPTH)
    }

    /// A cache over an [`LruStore`] sized by `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_link_depth(
            Arc::new(LruStore::new(config.byte_budget)),
            config.max_link_depth,
        )
    }

    pub fn with_link_depth(store: Arc<dyn KeyValueStore>, max_link_depth: usize) -> Self {
        Self {
            store,
            max_link_depth,
            write: Mutex::new(()),
        }
    }

    /// The underlying key/value store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn read(&self, key: &str) -> Result<Option<Entry>> {
        match self.store.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, entry: &Entry) -> Result<()> {
        self.store.set(key, serde_json::to_string(entry)?);
        Ok(())
    }

    /// Follow links on every document prefix of `key_path`.
    pub fn resolve(&self, key_path: &KeyPath) -> Result<KeyPath> {
        let mut path = key_path.clone();
        let mut hops = 0;
        let mut len = 2;
        while len <= path.len() {
            let prefix = KeyPath::new(path.segments()[..len].iter().cloned())?;
            match self.read(&prefix.to_key())? {
                Some(Entry::Link { target }) => {
                    hops += 1;
                    if hops > self.max_link_depth {
                        return Err(Error::InvalidKey(format!(
                            "link depth exceeded resolving {}",
                            key_path
                        )));
                    }
                    let target = KeyPath::from_key(&target)?;
                    path = path.rebase(len, &target);
                    len = target.len();
                }
                _ => len += 2,
            }
        }
        Ok(path)
    }

    fn read_document(&self, key_path: &KeyPath) -> Result<(KeyPath, Document, Vec<String>)> {
        key_path.expect_document()?;
        let resolved = self.resolve(key_path)?;
        match self.read(&resolved.to_key())? {
            Some(Entry::Document { doc, aliases }) => Ok((resolved, doc, aliases)),
            _ => Err(Error::DocumentNotFound(key_path.to_key())),
        }
    }

    fn fetch_sync(&self, key_path: &KeyPath) -> Result<Document> {
        self.read_document(key_path).map(|(_, doc, _)| doc)
    }

    fn create_sync(&self, key_path: &KeyPath, mut doc: Document) -> Result<String> {
        key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;

        let cid = match doc.cid() {
            Some(cid) => cid.to_string(),
            None => {
                let cid = new_cid();
                doc.insert(CID.to_string(), Value::from(cid.clone()));
                cid
            }
        };
        self.store_document(&bucket, &cid, doc)?;
        Ok(cid)
    }

    /// Store `doc` under `key_path + id` without touching its fields.
    pub(crate) fn create_with_id(&self, key_path: &KeyPath, id: &str, doc: Document) -> Result<()> {
        key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;
        self.store_document(&bucket, id, doc)
    }

    fn store_document(&self, bucket: &KeyPath, id: &str, doc: Document) -> Result<()> {
        let doc_path = bucket.child(id)?;

        let (aliases, fresh) = match self.read(&doc_path.to_key())? {
            Some(Entry::Document { aliases, .. }) => (aliases, false),
            _ => (Vec::new(), true),
        };
        self.write(&doc_path.to_key(), &Entry::Document { doc, aliases })?;

        let bucket_key = bucket.to_key();
        match self.read(&bucket_key)? {
            None => self.write(&bucket_key, &Entry::collection(&bucket_key))?,
            Some(Entry::Collection {
                prefix,
                mut overrides,
                mut excluded,
            }) => {
                // A new document drops whatever membership its id had before.
                if fresh && (excluded.remove(id) | overrides.remove(id).is_some()) {
                    self.write(
                        &bucket_key,
                        &Entry::Collection {
                            prefix,
                            overrides,
                            excluded,
                        },
                    )?;
                }
            }
            Some(_) => {}
        }

        tracing::debug!(key = %doc_path, "stored document");
        Ok(())
    }

    fn put_sync(&self, key_path: &KeyPath, fields: Document) -> Result<()> {
        let _guard = self.write.lock();
        let (resolved, mut doc, aliases) = self.read_document(key_path)?;
        for (k, v) in fields {
            doc.insert(k, v);
        }
        self.write(&resolved.to_key(), &Entry::Document { doc, aliases })
    }

    /// Replace the content of the document at `key_path` with `fields`,
    /// keeping the reserved fields `fields` lacks.
    pub(crate) fn replace(&self, key_path: &KeyPath, fields: &Document) -> Result<()> {
        let _guard = self.write.lock();
        let (resolved, mut doc, aliases) = self.read_document(key_path)?;
        doc.replace_content(fields);
        self.write(&resolved.to_key(), &Entry::Document { doc, aliases })
    }

    fn del_sync(&self, key_path: &KeyPath) -> Result<()> {
        let _guard = self.write.lock();
        let (resolved, _, aliases) = self.read_document(key_path)?;
        for alias in &aliases {
            self.store.remove(alias);
        }
        self.store.remove(&resolved.to_key());
        tracing::debug!(key = %resolved, aliases = aliases.len(), "deleted local document");
        Ok(())
    }

    fn link_sync(&self, new_key_path: &KeyPath, target_key_path: &KeyPath) -> Result<()> {
        new_key_path.expect_document()?;
        let _guard = self.write.lock();
        let (target, doc, mut aliases) = self.read_document(target_key_path)?;
        let new_key = new_key_path.to_key();
        if new_key == target.to_key() {
            return Ok(());
        }
        self.write(
            &new_key,
            &Entry::Link {
                target: target.to_key(),
            },
        )?;
        if !aliases.contains(&new_key) {
            aliases.push(new_key.clone());
        }
        self.write(&target.to_key(), &Entry::Document { doc, aliases })?;
        tracing::debug!(from = %new_key, to = %target, "installed link");
        Ok(())
    }

    /// Documents matched by a collection pattern, sorted by key.
    fn pattern_documents(&self, prefix: &str) -> Result<Vec<(String, Document)>> {
        let mut keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|key| {
                key.strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
                    .is_some_and(|id| !id.is_empty() && !id.contains(KEY_SEPARATOR))
            })
            .collect();
        keys.sort();

        let mut docs = Vec::new();
        for key in keys {
            if let Some(Entry::Document { doc, .. }) = self.read(&key)? {
                let id = key[prefix.len() + 1..].to_string();
                docs.push((id, doc));
            }
        }
        Ok(docs)
    }

    /// Load the membership at `bucket`. Top-level buckets without an entry
    /// start out as an empty collection pattern when `items` is the bucket.
    fn load_membership(&self, bucket: &KeyPath, items: &KeyPath) -> Result<Membership> {
        match self.read(&bucket.to_key())? {
            Some(Entry::Set { items, members }) => Ok(Membership::Set { items, members }),
            Some(Entry::Collection {
                prefix,
                overrides,
                excluded,
            }) => Ok(Membership::Pattern {
                prefix,
                overrides,
                excluded,
            }),
            None if bucket.len() == 1 && self.resolve(items)? == *bucket => {
                Ok(Membership::Pattern {
                    prefix: bucket.to_key(),
                    overrides: BTreeMap::new(),
                    excluded: BTreeSet::new(),
                })
            }
            None => Ok(Membership::Set {
                items: items.clone(),
                members: BTreeMap::new(),
            }),
            Some(_) => Err(Error::InvalidKey(format!("{} is not a set", bucket))),
        }
    }

    /// Apply `edit` to every member addressed by `item_ids` and store the
    /// result.
    fn edit_membership(
        &self,
        bucket: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        mut edit: impl FnMut(MemberEdit<'_>),
    ) -> Result<()> {
        match self.load_membership(bucket, items_key_path)? {
            Membership::Set { items, mut members } => {
                for id in item_ids {
                    let found = self.member_key(&items, members.keys(), id);
                    let known = found.is_some();
                    edit(MemberEdit {
                        key: found.unwrap_or_else(|| id.clone()),
                        known,
                        states: &mut members,
                        excluded: None,
                    });
                }
                self.write(&bucket.to_key(), &Entry::Set { items, members })
            }
            Membership::Pattern {
                prefix,
                mut overrides,
                mut excluded,
            } => {
                let ids: Vec<String> = self
                    .pattern_documents(&prefix)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                for id in item_ids {
                    let found = self.member_key(bucket, ids.iter().chain(overrides.keys()), id);
                    let known = found.as_ref().is_some_and(|key| !excluded.contains(key));
                    edit(MemberEdit {
                        key: found.unwrap_or_else(|| id.clone()),
                        known,
                        states: &mut overrides,
                        excluded: Some(&mut excluded),
                    });
                }
                self.write(
                    &bucket.to_key(),
                    &Entry::Collection {
                        prefix,
                        overrides,
                        excluded,
                    },
                )
            }
        }
    }

    /// The bucket holding the members of the set at `key_path`, and whether
    /// the set is a collection pattern over that bucket.
    pub(crate) fn members_bucket(&self, key_path: &KeyPath) -> Result<(KeyPath, bool)> {
        key_path.expect_bucket()?;
        let bucket = self.resolve(key_path)?;
        match self.read(&bucket.to_key())? {
            Some(Entry::Set { items, .. }) => Ok((items, false)),
            Some(Entry::Collection { .. }) => Ok((bucket, true)),
            None if bucket.len() == 1 => Ok((bucket, true)),
            None => Ok((key_path.items_bucket(), false)),
            Some(_) => Err(Error::InvalidKey(format!("{} is not a set", bucket))),
        }
    }

    /// Find the member key for `id`, directly or through the member
    /// documents' ids.
    fn member_key<'a>(
        &self,
        items: &KeyPath,
        members: impl Iterator<Item = &'a String> + Clone,
        id: &str,
    ) -> Option<String> {
        if members.clone().any(|member| member == id) {
            return Some(id.to_string());
        }
        members.into_iter().find_map(|member| {
            let doc = items
                .child(member.clone())
                .ok()
                .and_then(|path| self.fetch_sync(&path).ok())?;
            doc.answers_to(id).then(|| member.clone())
        })
    }

    fn add_sync(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        key_path.expect_bucket()?;
        items_key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;

        let state = if opts.insync {
            SyncState::Insync
        } else {
            SyncState::Add
        };
        self.edit_membership(&bucket, items_key_path, item_ids, |member| {
            if let Some(excluded) = member.excluded {
                excluded.remove(&member.key);
            }
            member.states.insert(member.key, state);
        })
    }

    fn remove_sync(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;

        self.edit_membership(&bucket, items_key_path, item_ids, |member| {
            if !member.known {
                return;
            }
            if !opts.insync {
                member.states.insert(member.key, SyncState::Rm);
                return;
            }
            member.states.remove(&member.key);
            if let Some(excluded) = member.excluded {
                excluded.insert(member.key);
            }
        })
    }

    fn find_sync(&self, key_path: &KeyPath, query: &Query, opts: Options) -> Result<Vec<Document>> {
        key_path.expect_bucket()?;
        let bucket = self.resolve(key_path)?;
        let mut docs = Vec::new();

        match self.read(&bucket.to_key())? {
            None => {}
            Some(Entry::Collection {
                prefix,
                overrides,
                excluded,
            }) => {
                for (id, mut doc) in self.pattern_documents(&prefix)? {
                    if excluded.contains(&id) {
                        continue;
                    }
                    let state = overrides.get(&id).copied().unwrap_or(if doc.is_persisted() {
                        SyncState::Insync
                    } else {
                        SyncState::Add
                    });
                    if (state == SyncState::Rm && !opts.snapshot) || !query.matches(&doc) {
                        continue;
                    }
                    doc.annotate(state);
                    docs.push(doc);
                }
            }
            Some(Entry::Set { items, members }) => {
                for (id, state) in members {
                    if state == SyncState::Rm && !opts.snapshot {
                        continue;
                    }
                    let path = items.child(id)?;
                    let mut doc = match self.fetch_sync(&path) {
                        Ok(doc) => doc,
                        Err(_) => {
                            tracing::debug!(key = %path, "skipping member without document");
                            continue;
                        }
                    };
                    if !query.matches(&doc) {
                        continue;
                    }
                    doc.annotate(state);
                    docs.push(doc);
                }
            }
            Some(Entry::Sequence { .. }) => {
                return Ok(self
                    .all_sync(key_path, opts)?
                    .into_iter()
                    .filter(|d| query.matches(d))
                    .collect())
            }
            Some(_) => return Err(Error::InvalidKey(format!("{} is not a collection", bucket))),
        }

        Ok(docs)
    }

    fn load_sequence(&self, bucket: &KeyPath) -> Result<Option<Sequence>> {
        match self.read(&bucket.to_key())? {
            Some(Entry::Sequence { list }) => Ok(Some(list)),
            None => Ok(None),
            Some(_) => Err(Error::InvalidKey(format!("{} is not a sequence", bucket))),
        }
    }

    fn all_sync(&self, key_path: &KeyPath, opts: Options) -> Result<Vec<Document>> {
        key_path.expect_bucket()?;
        let bucket = self.resolve(key_path)?;
        let Some(list) = self.load_sequence(&bucket)? else {
            return Ok(Vec::new());
        };

        let mut docs = Vec::new();
        for (_, node) in list.iter() {
            if node.sync == SyncState::Rm && !opts.snapshot {
                continue;
            }
            let path = KeyPath::from_key(&node.key)?;
            let mut doc = match self.fetch_sync(&path) {
                Ok(doc) => doc,
                Err(_) => {
                    tracing::debug!(key = %node.key, "skipping sequence entry without document");
                    continue;
                }
            };
            doc.annotate(node.sync);
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Locate the linked entry for `id` among nodes accepted by `filter`.
    fn locate(
        &self,
        list: &Sequence,
        id: &str,
        filter: impl Fn(SyncState) -> bool,
    ) -> Option<NodeIndex> {
        list.find(|n| filter(n.sync) && entry_id(&n.key) == id)
            .or_else(|| {
                list.find(|n| {
                    filter(n.sync)
                        && KeyPath::from_key(&n.key)
                            .ok()
                            .and_then(|path| self.fetch_sync(&path).ok())
                            .is_some_and(|doc| doc.answers_to(id))
                })
            })
    }

    fn insert_sync(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
        after: bool,
    ) -> Result<String> {
        key_path.expect_bucket()?;
        item_key_path.expect_document()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;
        let item = self.resolve(item_key_path)?;
        let mut list = self.load_sequence(&bucket)?.unwrap_or_default();

        let anchor = match ref_id {
            None if after => BEGIN,
            None => END,
            Some(id) => self
                .locate(&list, id, |s| s != SyncState::Rm)
                .ok_or_else(|| Error::ReferenceItemNotFound(id.to_string()))?,
        };
        let sync = if opts.insync {
            SyncState::Insync
        } else {
            SyncState::Ib
        };
        if after {
            list.insert_after_index(anchor, item.to_key(), sync)?;
        } else {
            list.insert_before_index(anchor, item.to_key(), sync)?;
        }
        self.write(&bucket.to_key(), &Entry::Sequence { list })?;
        Ok(item.last().to_string())
    }

    fn delete_item_sync(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()> {
        key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;
        let mut list = self
            .load_sequence(&bucket)?
            .ok_or_else(|| Error::ReferenceItemNotFound(id.to_string()))?;

        let index = self
            .locate(&list, id, |s| s != SyncState::Rm)
            .or_else(|| {
                if opts.insync {
                    self.locate(&list, id, |s| s == SyncState::Rm)
                } else {
                    None
                }
            })
            .ok_or_else(|| Error::ReferenceItemNotFound(id.to_string()))?;
        list.delete_index(index, opts.insync)?;
        self.write(&bucket.to_key(), &Entry::Sequence { list })
    }

    fn ack_sync(&self, key_path: &KeyPath, id: &str) -> Result<()> {
        key_path.expect_bucket()?;
        let _guard = self.write.lock();
        let bucket = self.resolve(key_path)?;
        let mut list = self
            .load_sequence(&bucket)?
            .ok_or_else(|| Error::ReferenceItemNotFound(id.to_string()))?;

        let index = self
            .locate(&list, id, |s| s != SyncState::Insync)
            .ok_or_else(|| Error::ReferenceItemNotFound(id.to_string()))?;
        list.ack_index(index)?;
        self.write(&bucket.to_key(), &Entry::Sequence { list })
    }
}

impl Entry {
    fn collection(prefix: &str) -> Self {
        Entry::Collection {
            prefix: prefix.to_string(),
            overrides: BTreeMap::new(),
            excluded: BTreeSet::new(),
        }
    }
}

/// Members of a set, either listed or derived from a collection pattern.
enum Membership {
    Set {
        items: KeyPath,
        members: BTreeMap<String, SyncState>,
    },
    Pattern {
        prefix: String,
        overrides: BTreeMap<String, SyncState>,
        excluded: BTreeSet<String>,
    },
}

/// One member addressed by an `add` or `remove`.
struct MemberEdit<'a> {
    key: String,
    /// The key names an existing member.
    known: bool,
    states: &'a mut BTreeMap<String, SyncState>,
    /// Confirmed removals; only collection patterns keep them.
    excluded: Option<&'a mut BTreeSet<String>>,
}

/// The item id of a sequence entry key.
fn entry_id(key: &str) -> &str {
    key.rsplit(KEY_SEPARATOR).next().unwrap_or(key)
}

#[async_trait]
impl Storage for LocalStorage {
    async fn create(&self, key_path: &KeyPath, doc: Document, _opts: Options) -> Result<String> {
        self.create_sync(key_path, doc)
    }

    async fn put(&self, key_path: &KeyPath, doc: Document, _opts: Options) -> Result<()> {
        self.put_sync(key_path, doc)
    }

    async fn fetch(&self, key_path: &KeyPath, _opts: Options) -> Result<Document> {
        self.fetch_sync(key_path)
    }

    async fn del(&self, key_path: &KeyPath, _opts: Options) -> Result<()> {
        self.del_sync(key_path)
    }

    async fn link(&self, new_key_path: &KeyPath, target_key_path: &KeyPath) -> Result<()> {
        self.link_sync(new_key_path, target_key_path)
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.add_sync(key_path, items_key_path, item_ids, opts)
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.remove_sync(key_path, items_key_path, item_ids, opts)
    }

    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: Options,
    ) -> Result<Vec<Document>> {
        self.find_sync(key_path, query, opts)
    }

    async fn all(&self, key_path: &KeyPath, opts: Options) -> Result<Vec<Document>> {
        self.all_sync(key_path, opts)
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()> {
        self.delete_item_sync(key_path, id, opts)
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
    ) -> Result<String> {
        self.insert_sync(key_path, ref_id, item_key_path, opts, false)
    }

    async fn insert_after(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
    ) -> Result<String> {
        self.insert_sync(key_path, ref_id, item_key_path, opts, true)
    }

    async fn ack(&self, key_path: &KeyPath, id: &str, _opts: Options) -> Result<()> {
        self.ack_sync(key_path, id)
    }
}
