//! Shared fixtures for the queue integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parade_engine::{
    CacheConfig, Document, Error, KeyPath, LocalStorage, MemoryStorage, Options, Query, Queue,
    QueueConfig, QueueEvent, Result, Storage,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Route engine logs to the test harness; `RUST_LOG=parade_engine=debug`
/// shows the queue's progress.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn kp(segments: &[&str]) -> KeyPath {
    KeyPath::new(segments.iter().copied()).unwrap()
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

pub fn fast_config() -> QueueConfig {
    QueueConfig {
        remote_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
        ..QueueConfig::default()
    }
}

pub fn local_storage() -> Arc<LocalStorage> {
    init_tracing();
    Arc::new(LocalStorage::from_config(&CacheConfig::default()))
}

/// A remote write as the scripted remote saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub key_path: KeyPath,
    pub ids: Vec<String>,
    pub ok: bool,
}

impl Call {
    /// True if `id` appears in the call's key path or ids.
    pub fn mentions(&self, id: &str) -> bool {
        self.key_path.segments().iter().any(|s| s == id) || self.ids.iter().any(|i| i == id)
    }
}

/// A `MemoryStorage` remote that records writes and fails on demand.
pub struct ScriptedRemote {
    pub inner: MemoryStorage,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<VecDeque<Error>>,
    offline: AtomicBool,
    stall_reads: AtomicBool,
}

impl ScriptedRemote {
    pub fn new(inner: MemoryStorage) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
        })
    }

    /// Fail the next `times` writes with `error`.
    pub fn fail_next(&self, error: Error, times: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Reject every write with `NoConnection` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Never answer reads.
    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn successful_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.ok).collect()
    }

    fn admit(&self, op: &'static str, key_path: &KeyPath, ids: Vec<String>) -> Result<()> {
        let failure = if self.offline.load(Ordering::SeqCst) {
            Some(Error::NoConnection("offline".into()))
        } else {
            self.failures.lock().pop_front()
        };
        self.calls.lock().push(Call {
            op,
            key_path: key_path.clone(),
            ids,
            ok: failure.is_none(),
        });
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn read_gate(&self) {
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl Storage for ScriptedRemote {
    async fn create(&self, key_path: &KeyPath, doc: Document, opts: Options) -> Result<String> {
        self.admit("create", key_path, Vec::new())?;
        self.inner.create(key_path, doc, opts).await
    }

    async fn put(&self, key_path: &KeyPath, doc: Document, opts: Options) -> Result<()> {
        self.admit("update", key_path, Vec::new())?;
        self.inner.put(key_path, doc, opts).await
    }

    async fn fetch(&self, key_path: &KeyPath, opts: Options) -> Result<Document> {
        self.read_gate().await;
        self.inner.fetch(key_path, opts).await
    }

    async fn del(&self, key_path: &KeyPath, opts: Options) -> Result<()> {
        self.admit("delete", key_path, Vec::new())?;
        self.inner.del(key_path, opts).await
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.admit("add", key_path, item_ids.to_vec())?;
        self.inner.add(key_path, items_key_path, item_ids, opts).await
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.admit("remove", key_path, item_ids.to_vec())?;
        self.inner.remove(key_path, items_key_path, item_ids, opts).await
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, opts: Options) -> Result<Vec<Document>> {
        self.read_gate().await;
        self.inner.find(key_path, query, opts).await
    }

    async fn all(&self, key_path: &KeyPath, opts: Options) -> Result<Vec<Document>> {
        self.read_gate().await;
        self.inner.all(key_path, opts).await
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()> {
        self.admit("deleteItem", key_path, vec![id.to_string()])?;
        self.inner.delete_item(key_path, id, opts).await
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
    ) -> Result<String> {
        let ids = ref_id
            .map(str::to_string)
            .into_iter()
            .chain(item_key_path.segments().iter().cloned())
            .collect();
        self.admit("insertBefore", key_path, ids)?;
        self.inner
            .insert_before(key_path, ref_id, item_key_path, opts)
            .await
    }
}

/// Wait until the queue drained, failing the test after a few seconds.
pub async fn idle(queue: &Queue) {
    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue did not drain");
}

/// Drain buffered events without waiting.
pub fn drain_events(events: &mut tokio::sync::broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
