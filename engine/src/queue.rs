//! Queue - the offline-first synchronization engine.
//!
//! Every mutating call is applied to the local cache first, then recorded
//! as a [`Command`], persisted, and replayed against the remote store one
//! command at a time in FIFO order. Reads answer from the local cache
//! immediately and refresh it from the remote in the background.
//!
//! # Drain states
//!
//! - `Idle`: no command in flight.
//! - `Draining`: the head command is being sent to the remote.
//!
//! `Idle -> Draining` whenever the queue is non-empty and a remote is
//! configured; `Draining -> Idle` once the queue runs empty or a transient
//! failure parks the head command until its retry is due.
//!
//! # Failures
//!
//! Transient errors keep the command at the head and retry it with
//! exponential backoff. Terminal errors discard the command, emit
//! [`QueueEvent::Error`] and continue with the next one.

use crate::command::{
    Command, CreateCmd, DeleteCmd, DeleteItemCmd, InsertBeforeCmd, MembershipCmd, PendingCommand,
    SyncTaskCmd, UpdateCmd,
};
use crate::config::QueueConfig;
use crate::document::{new_cid, Document, DocumentExt, CID, ID, PERSISTED};
use crate::error::{Error, Result};
use crate::event::QueueEvent;
use crate::journal::CommandLog;
use crate::keypath::KeyPath;
use crate::local::LocalStorage;
use crate::merge::{self, MergeCommand};
use crate::storage::{CollectionKind, Options, Query, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, OnceCell};

/// Snapshot of the queue's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Commands not yet acknowledged or discarded
    pub pending: usize,
    /// A command is in flight
    pub draining: bool,
}

#[derive(Default)]
struct State {
    commands: VecDeque<PendingCommand>,
    draining: bool,
    retry_scheduled: bool,
    /// Bumped on every park; only the latest retry timer may resume.
    retry_generation: u64,
}

struct Inner {
    local: Arc<LocalStorage>,
    remote: Option<Arc<dyn Storage>>,
    log: Arc<dyn CommandLog>,
    config: QueueConfig,
    state: Mutex<State>,
    /// Orders saves so the last one written reflects the latest state.
    persist: tokio::sync::Mutex<()>,
    /// Set once the persisted log was merged into `state`. Nothing is
    /// saved or drained before that.
    restored: OnceCell<()>,
    events: broadcast::Sender<QueueEvent>,
    status: watch::Sender<QueueStatus>,
}

/// The command queue. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Create a queue over `local`, replaying to `remote` when present.
    ///
    /// Call [`Queue::init`] to restore a persisted log.
    pub fn new(
        local: Arc<LocalStorage>,
        remote: Option<Arc<dyn Storage>>,
        log: Arc<dyn CommandLog>,
        config: QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (status, _) = watch::channel(QueueStatus::default());
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                log,
                config,
                state: Mutex::new(State::default()),
                persist: tokio::sync::Mutex::new(()),
                restored: OnceCell::new(),
                events,
                status,
            }),
        }
    }

    /// Load the persisted command log and start draining it.
    ///
    /// Writes made before `init` are queued behind the restored commands.
    /// Calling it again only re-triggers draining.
    pub async fn init(&self) -> Result<()> {
        self.restore().await?;
        self.publish_status();
        self.kick();
        Ok(())
    }

    /// Merge the persisted log into the queue, once.
    async fn restore(&self) -> Result<()> {
        self.inner
            .restored
            .get_or_try_init(|| async {
                let restored = self.inner.log.load().await?;
                let mut state = self.inner.state.lock();
                let queued = std::mem::take(&mut state.commands);
                let fresh: Vec<PendingCommand> = restored
                    .into_iter()
                    .filter(|r| !queued.iter().any(|q| q.id == r.id))
                    .collect();
                tracing::info!(
                    restored = fresh.len(),
                    queued = queued.len(),
                    "command queue initialized"
                );
                state.commands = fresh.into_iter().chain(queued).collect();
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// The local cache this queue writes to.
    pub fn local(&self) -> &Arc<LocalStorage> {
        &self.inner.local
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            pending: state.commands.len(),
            draining: state.draining,
        }
    }

    /// Commands waiting to be replayed, head first.
    pub fn pending(&self) -> Vec<PendingCommand> {
        self.inner.state.lock().commands.iter().cloned().collect()
    }

    /// Resolve once every queued command was acknowledged or discarded.
    pub async fn wait_idle(&self) {
        let mut status = self.inner.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = status
            .wait_for(|s| s.pending == 0 && !s.draining)
            .await;
    }

    /// Retry the head command now instead of waiting for its backoff.
    pub fn resume(&self) {
        self.inner.state.lock().retry_scheduled = false;
        self.kick();
    }

    /// Resume from the retry timer armed by park number `generation`.
    fn retry_due(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.retry_generation != generation || !state.retry_scheduled {
                return;
            }
            state.retry_scheduled = false;
        }
        self.kick();
    }

    /// Queue a remote re-read of a collection behind all pending commands.
    pub async fn sync(&self, key_path: &KeyPath, kind: CollectionKind, query: Query) -> Result<()> {
        key_path.expect_bucket()?;
        self.enqueue(Command::SyncTask(SyncTaskCmd {
            key_path: key_path.clone(),
            kind,
            query,
        }))
        .await;
        Ok(())
    }

    /// Re-read a collection from the remote now and reconcile the cache.
    pub async fn refresh(&self, key_path: &KeyPath, kind: CollectionKind, query: &Query) -> Result<()> {
        self.resync(key_path, kind, query, false).await
    }

    // ------------------------------------------------------------------
    // Queue mechanics
    // ------------------------------------------------------------------

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn publish_status(&self) {
        let status = self.status();
        self.inner.status.send_replace(status);
    }

    async fn persist(&self) {
        // Saving before the old log is merged would overwrite it.
        if let Err(error) = self.restore().await {
            tracing::warn!(%error, "command log not loaded, keeping commands in memory");
            return;
        }
        let _order = self.inner.persist.lock().await;
        let entries = self.pending();
        if let Err(error) = self.inner.log.save(&entries).await {
            tracing::warn!(%error, pending = entries.len(), "failed to persist command log");
        }
    }

    async fn enqueue(&self, mut command: Command) {
        self.translate(&mut command).await;
        let pending = PendingCommand::new(command);
        tracing::debug!(cmd = pending.command.name(), key = %pending.command.key_path(), "enqueued");
        self.inner.state.lock().commands.push_back(pending);
        self.persist().await;
        self.publish_status();
        self.kick();
    }

    /// Enter `Draining` if there is work and nothing is in flight.
    fn kick(&self) {
        if self.inner.remote.is_none() || !self.inner.restored.initialized() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.draining || state.retry_scheduled || state.commands.is_empty() {
                return;
            }
            state.draining = true;
        }
        self.publish_status();
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self) {
        loop {
            let mut head = {
                let mut state = self.inner.state.lock();
                match state.commands.front() {
                    Some(head) => head.clone(),
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            if self.translate(&mut head.command).await {
                let mut state = self.inner.state.lock();
                if let Some(front) = state.commands.front_mut().filter(|f| f.id == head.id) {
                    front.command = head.command.clone();
                }
            }

            tracing::debug!(cmd = head.command.name(), key = %head.command.key_path(), "dispatching");
            match self.dispatch(&head.command).await {
                Ok(()) => {
                    self.pop(&head.id);
                    self.persist().await;
                    self.emit(QueueEvent::Synced { command: head });
                    self.publish_status();
                }
                Err(error) if error.is_transient() => {
                    self.park(head, error).await;
                    return;
                }
                Err(error) => {
                    tracing::error!(cmd = head.command.name(), key = %head.command.key_path(), %error, "discarding command");
                    self.pop(&head.id);
                    self.persist().await;
                    self.emit(QueueEvent::Error {
                        command: Some(head),
                        error,
                    });
                    self.publish_status();
                }
            }
        }
        self.publish_status();
    }

    fn pop(&self, id: &str) {
        let mut state = self.inner.state.lock();
        if state.commands.front().is_some_and(|c| c.id == id) {
            state.commands.pop_front();
        }
    }

    /// Keep the head command and schedule its retry.
    async fn park(&self, mut head: PendingCommand, error: Error) {
        head.attempts += 1;
        let delay = self.inner.config.backoff(head.attempts);
        let generation = {
            let mut state = self.inner.state.lock();
            if let Some(front) = state.commands.front_mut() {
                if front.id == head.id {
                    front.attempts = head.attempts;
                }
            }
            state.retry_scheduled = true;
            state.retry_generation += 1;
            state.draining = false;
            state.retry_generation
        };
        self.persist().await;
        self.publish_status();
        tracing::warn!(
            cmd = head.command.name(),
            attempts = head.attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "remote unavailable, will retry"
        );
        self.emit(QueueEvent::Retrying {
            command: head,
            error,
            delay_ms: delay.as_millis() as u64,
        });

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.retry_due(generation);
        });
    }

    fn remote(&self) -> Result<&Arc<dyn Storage>> {
        self.inner
            .remote
            .as_ref()
            .ok_or_else(|| Error::NoConnection("no remote configured".into()))
    }

    /// Send one command to the remote and reconcile the local cache.
    async fn dispatch(&self, command: &Command) -> Result<()> {
        let remote = self.remote()?;
        let local = &self.inner.local;
        let insync = Options::insync();

        match command {
            Command::Create(cmd) => {
                let id = remote
                    .create(&cmd.key_path, cmd.args.clone(), Options::default())
                    .await?;
                if let Some(cid) = cmd.args.cid() {
                    self.remap(&cmd.key_path, cid, &id).await;
                }
            }
            Command::Update(cmd) => {
                remote.put(&cmd.key_path, cmd.args.clone(), Options::default()).await?;
            }
            Command::Delete(cmd) => {
                remote.del(&cmd.key_path, Options::default()).await?;
            }
            Command::Add(cmd) => {
                remote
                    .add(&cmd.key_path, &cmd.items_key_path, &cmd.item_ids, Options::default())
                    .await?;
                if !cmd.old_item_ids.is_empty() {
                    settle(
                        "remove superseded members",
                        local
                            .remove(&cmd.key_path, &cmd.items_key_path, &cmd.old_item_ids, insync),
                    )
                    .await;
                }
                settle(
                    "confirm members",
                    local.add(&cmd.key_path, &cmd.items_key_path, &cmd.item_ids, insync),
                )
                .await;
            }
            Command::Remove(cmd) => {
                remote
                    .remove(&cmd.key_path, &cmd.items_key_path, &cmd.item_ids, Options::default())
                    .await?;
                let ids: Vec<String> = cmd
                    .item_ids
                    .iter()
                    .chain(&cmd.old_item_ids)
                    .cloned()
                    .collect();
                settle(
                    "drop removed members",
                    local.remove(&cmd.key_path, &cmd.items_key_path, &ids, insync),
                )
                .await;
            }
            Command::InsertBefore(cmd) => {
                remote
                    .insert_before(
                        &cmd.key_path,
                        cmd.id.as_deref(),
                        &cmd.item_key_path,
                        Options::default(),
                    )
                    .await?;
                settle(
                    "confirm insert",
                    local.ack(&cmd.key_path, &cmd.cid, Options::default()),
                )
                .await;
            }
            Command::DeleteItem(cmd) => {
                remote
                    .delete_item(&cmd.key_path, &cmd.id, Options::default())
                    .await?;
                settle(
                    "confirm delete",
                    local.ack(&cmd.key_path, &cmd.id, Options::default()),
                )
                .await;
            }
            Command::SyncTask(cmd) => {
                self.resync(&cmd.key_path, cmd.kind, &cmd.query, true).await?;
            }
        }
        Ok(())
    }

    /// Attach the server id to a created document and rewrite queued
    /// commands that still address it by client id.
    async fn remap(&self, bucket: &KeyPath, cid: &str, id: &str) {
        let local = &self.inner.local;
        if let (Ok(client_path), Ok(server_path)) = (bucket.child(cid), bucket.child(id)) {
            let mut fields = Document::new();
            fields.insert(ID.to_string(), Value::from(id));
            fields.insert(PERSISTED.to_string(), Value::Bool(true));
            settle(
                "mark persisted",
                local.put(&client_path, fields, Options::insync()),
            )
            .await;
            settle("link server id", local.link(&server_path, &client_path)).await;
        }

        let rewritten = {
            let mut state = self.inner.state.lock();
            state
                .commands
                .iter_mut()
                .skip(1)
                .map(|pending| pending.command.remap(cid, id))
                .filter(|changed| *changed)
                .count()
        };
        tracing::info!(key = %bucket, cid, id, rewritten, "remapped client id");
        self.emit(QueueEvent::Remapped {
            key_path: bucket.clone(),
            cid: cid.to_string(),
            id: id.to_string(),
        });
    }

    /// Rewrite ids of documents the remote already confirmed, for commands
    /// written after the create was acknowledged.
    async fn translate(&self, command: &mut Command) -> bool {
        let mut changed = false;
        for path in addressed_documents(command) {
            let Ok(doc) = self.inner.local.fetch(&path, Options::default()).await else {
                continue;
            };
            if let Some(id) = doc.server_id().filter(|id| *id != path.last()) {
                changed |= command.remap(path.last(), id);
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// True if a queued mutation references `id`.
    fn is_pending(&self, id: &str) -> bool {
        self.inner
            .state
            .lock()
            .commands
            .iter()
            .filter(|c| !matches!(c.command, Command::SyncTask(_)))
            .any(|c| c.command.references(id))
    }

    /// Translate local ids in `key_path` into the server's ids.
    ///
    /// Returns `None` while any addressed document is not yet persisted.
    async fn remote_path(&self, key_path: &KeyPath) -> Result<Option<KeyPath>> {
        let mut segments = key_path.segments().to_vec();
        for len in (2..=key_path.len()).step_by(2) {
            let prefix = KeyPath::new(key_path.segments()[..len].iter().cloned())?;
            if let Ok(doc) = self.inner.local.fetch(&prefix, Options::default()).await {
                match doc.server_id() {
                    Some(id) => segments[len - 1] = id.to_string(),
                    None => return Ok(None),
                }
            }
        }
        KeyPath::new(segments).map(Some)
    }

    async fn with_timeout<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.inner.config.remote_timeout;
        tokio::time::timeout(limit, future)
            .await
            .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
    }

    fn spawn_refresh(&self, key_path: &KeyPath, kind: Option<CollectionKind>, query: Query) {
        if self.inner.remote.is_none() {
            return;
        }
        let queue = self.clone();
        let key_path = key_path.clone();
        tokio::spawn(async move {
            let result = match kind {
                Some(kind) => queue.resync(&key_path, kind, &query, false).await,
                None => queue.refresh_document(&key_path).await,
            };
            if let Err(error) = result {
                tracing::warn!(key = %key_path, %error, "remote read failed");
            }
        });
    }

    async fn refresh_document(&self, key_path: &KeyPath) -> Result<()> {
        let remote = self.remote()?;
        let local = &self.inner.local;
        if key_path.segments().iter().any(|s| self.is_pending(s)) {
            return Ok(());
        }
        let Some(remote_path) = self.remote_path(key_path).await? else {
            return Ok(());
        };
        tracing::debug!(key = %remote_path, "remote fetch");

        let fetched = self
            .with_timeout(remote.fetch(&remote_path, Options::default()))
            .await;
        let cached = local.fetch(key_path, Options::default()).await;
        match (fetched, cached) {
            (Ok(doc), Ok(cached)) => {
                if cached.content_matches(&doc) {
                    return Ok(());
                }
                local.replace(key_path, &doc)?;
            }
            (Ok(doc), Err(Error::DocumentNotFound(_))) => {
                let Some(bucket) = key_path.parent() else {
                    return Ok(());
                };
                self.store_remote_doc(&bucket, doc).await?;
            }
            (Err(Error::DocumentNotFound(_)), Ok(cached)) if cached.is_persisted() => {
                local.del(key_path, Options::insync()).await?;
            }
            (Err(error), _) => return Err(error),
            (Ok(_), Err(error)) => return Err(error),
        }
        self.emit(QueueEvent::Resynced {
            key_path: key_path.clone(),
        });
        Ok(())
    }

    /// Read a collection remotely, merge it into the cache and notify.
    async fn resync(
        &self,
        key_path: &KeyPath,
        kind: CollectionKind,
        query: &Query,
        queued: bool,
    ) -> Result<()> {
        let remote = self.remote()?;
        let local = &self.inner.local;
        let Some(remote_path) = self.remote_path(key_path).await? else {
            return Ok(());
        };
        tracing::debug!(key = %remote_path, ?kind, "remote read");

        let remote_docs = match kind {
            CollectionKind::Set => {
                self.with_timeout(remote.find(&remote_path, query, Options::default()))
                    .await?
            }
            CollectionKind::Sequence => {
                self.with_timeout(remote.all(&remote_path, Options::default()))
                    .await?
            }
        };
        let local_docs = match kind {
            CollectionKind::Set => local.find(key_path, query, Options::snapshot()).await?,
            CollectionKind::Sequence => local.all(key_path, Options::snapshot()).await?,
        };

        let commands = merge::reconcile(kind, &remote_docs, &local_docs);
        let mut applied = 0;
        for command in commands {
            if !queued && command.ids().iter().any(|id| self.is_pending(id)) {
                tracing::debug!(?command, "skipping merge of pending item");
                continue;
            }
            if let Err(error) = self.apply_merge(key_path, kind, command).await {
                tracing::warn!(key = %key_path, %error, "failed to apply merge command");
                continue;
            }
            applied += 1;
        }

        tracing::debug!(key = %key_path, applied, "resynced");
        self.emit(QueueEvent::Resynced {
            key_path: key_path.clone(),
        });
        Ok(())
    }

    async fn apply_merge(
        &self,
        key_path: &KeyPath,
        kind: CollectionKind,
        command: MergeCommand,
    ) -> Result<()> {
        let local = &self.inner.local;
        let insync = Options::insync();
        let (items, pattern) = match kind {
            CollectionKind::Set => local.members_bucket(key_path)?,
            CollectionKind::Sequence => (key_path.items_bucket(), false),
        };

        match command {
            MergeCommand::Add { doc } => {
                let id = self.store_remote_doc(&items, doc).await?;
                if !pattern {
                    local.add(key_path, &items, &[id], insync).await?;
                }
            }
            MergeCommand::Remove { id } => {
                if pattern {
                    local.del(&items.child(id)?, insync).await?;
                } else {
                    local.remove(key_path, &items, &[id], insync).await?;
                }
            }
            MergeCommand::Update { id, doc } => {
                local.replace(&items.child(id)?, &doc)?;
            }
            MergeCommand::InsertBefore { ref_id, doc } => {
                let id = self.store_remote_doc(&items, doc).await?;
                local
                    .insert_before(key_path, ref_id.as_deref(), &items.child(id)?, insync)
                    .await?;
            }
            MergeCommand::RemoveItem { id } => {
                local.delete_item(key_path, &id, insync).await?;
            }
        }
        Ok(())
    }

    /// Cache a document received from the remote under its client id (or
    /// server id if it has none), linking the server id to it.
    async fn store_remote_doc(&self, bucket: &KeyPath, mut doc: Document) -> Result<String> {
        let local = &self.inner.local;
        let Some(id) = doc.identity().map(str::to_string) else {
            return Err(Error::InvalidId(format!("document without id in {}", bucket)));
        };
        let path = bucket.child(id.clone())?;
        if local.fetch(&path, Options::default()).await.is_ok() {
            local.replace(&path, &doc)?;
        } else {
            doc.entry(CID.to_string())
                .or_insert_with(|| Value::from(id.clone()));
            local.create(bucket, doc.clone(), Options::insync()).await?;
        }
        if let Some(server_id) = doc.server_id().filter(|s| *s != id) {
            local.link(&bucket.child(server_id)?, &path).await?;
        }
        Ok(id)
    }
}

fn document_prefixes(key_path: &KeyPath) -> Vec<KeyPath> {
    (2..=key_path.len())
        .step_by(2)
        .filter_map(|len| KeyPath::new(key_path.segments()[..len].iter().cloned()).ok())
        .collect()
}

/// Documents a command addresses by id.
fn addressed_documents(command: &Command) -> Vec<KeyPath> {
    let mut paths = document_prefixes(command.key_path());
    match command {
        Command::Add(cmd) | Command::Remove(cmd) => {
            paths.extend(document_prefixes(&cmd.items_key_path));
            paths.extend(
                cmd.item_ids
                    .iter()
                    .filter_map(|id| cmd.items_key_path.child(id.clone()).ok()),
            );
        }
        Command::InsertBefore(cmd) => {
            paths.extend(document_prefixes(&cmd.item_key_path));
            if let (Some(id), Some(bucket)) = (&cmd.id, cmd.item_key_path.parent()) {
                paths.extend(bucket.child(id.clone()).ok());
            }
        }
        Command::DeleteItem(cmd) => {
            paths.extend(cmd.key_path.items_bucket().child(cmd.id.clone()).ok());
        }
        Command::Create(_) | Command::Update(_) | Command::Delete(_) | Command::SyncTask(_) => {}
    }
    paths
}

/// Await a local reconciliation step; its failure must not fail a command
/// the remote already applied.
async fn settle(step: &'static str, future: impl Future<Output = Result<()>>) {
    if let Err(error) = future.await {
        tracing::warn!(step, %error, "local reconciliation failed");
    }
}

#[async_trait]
impl Storage for Queue {
    async fn create(&self, key_path: &KeyPath, mut doc: Document, opts: Options) -> Result<String> {
        if doc.cid().is_none() {
            doc.insert(CID.to_string(), Value::from(new_cid()));
        }
        let id = self.inner.local.create(key_path, doc.clone(), opts).await?;
        if !opts.insync {
            self.enqueue(Command::Create(CreateCmd {
                key_path: key_path.clone(),
                args: doc,
            }))
            .await;
        }
        Ok(id)
    }

    async fn put(&self, key_path: &KeyPath, doc: Document, opts: Options) -> Result<()> {
        self.inner.local.put(key_path, doc.clone(), opts).await?;
        if !opts.insync {
            self.enqueue(Command::Update(UpdateCmd {
                key_path: key_path.clone(),
                args: doc,
            }))
            .await;
        }
        Ok(())
    }

    async fn fetch(&self, key_path: &KeyPath, opts: Options) -> Result<Document> {
        let result = self.inner.local.fetch(key_path, opts).await;
        if !opts.noremote {
            self.spawn_refresh(key_path, None, Query::all());
        }
        result
    }

    async fn del(&self, key_path: &KeyPath, opts: Options) -> Result<()> {
        let mut command = Command::Delete(DeleteCmd {
            key_path: key_path.clone(),
        });
        // The links to the server id go away with the document.
        self.translate(&mut command).await;
        self.inner.local.del(key_path, opts).await?;
        if !opts.insync {
            self.enqueue(command).await;
        }
        Ok(())
    }

    async fn link(&self, new_key_path: &KeyPath, target_key_path: &KeyPath) -> Result<()> {
        self.inner.local.link(new_key_path, target_key_path).await
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.inner
            .local
            .add(key_path, items_key_path, item_ids, opts)
            .await?;
        if !opts.insync {
            self.enqueue(Command::Add(MembershipCmd {
                key_path: key_path.clone(),
                items_key_path: items_key_path.clone(),
                item_ids: item_ids.to_vec(),
                old_item_ids: Vec::new(),
            }))
            .await;
        }
        Ok(())
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: Options,
    ) -> Result<()> {
        self.inner
            .local
            .remove(key_path, items_key_path, item_ids, opts)
            .await?;
        if !opts.insync {
            self.enqueue(Command::Remove(MembershipCmd {
                key_path: key_path.clone(),
                items_key_path: items_key_path.clone(),
                item_ids: item_ids.to_vec(),
                old_item_ids: Vec::new(),
            }))
            .await;
        }
        Ok(())
    }

    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: Options,
    ) -> Result<Vec<Document>> {
        let docs = self.inner.local.find(key_path, query, opts).await?;
        if !opts.noremote {
            self.spawn_refresh(key_path, Some(CollectionKind::Set), query.clone());
        }
        Ok(docs)
    }

    async fn all(&self, key_path: &KeyPath, opts: Options) -> Result<Vec<Document>> {
        let docs = self.inner.local.all(key_path, opts).await?;
        if !opts.noremote {
            self.spawn_refresh(key_path, Some(CollectionKind::Sequence), Query::all());
        }
        Ok(docs)
    }

    async fn delete_item(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()> {
        self.inner.local.delete_item(key_path, id, opts).await?;
        if !opts.insync {
            self.enqueue(Command::DeleteItem(DeleteItemCmd {
                key_path: key_path.clone(),
                id: id.to_string(),
            }))
            .await;
        }
        Ok(())
    }

    async fn insert_before(
        &self,
        key_path: &KeyPath,
        ref_id: Option<&str>,
        item_key_path: &KeyPath,
        opts: Options,
    ) -> Result<String> {
        let id = self
            .inner
            .local
            .insert_before(key_path, ref_id, item_key_path, opts)
            .await?;
        if !opts.insync {
            self.enqueue(Command::InsertBefore(InsertBeforeCmd {
                key_path: key_path.clone(),
                id: ref_id.map(str::to_string),
                item_key_path: item_key_path.clone(),
                cid: id.clone(),
            }))
            .await;
        }
        Ok(id)
    }

    async fn ack(&self, key_path: &KeyPath, id: &str, opts: Options) -> Result<()> {
        self.inner.local.ack(key_path, id, opts).await
    }
}
