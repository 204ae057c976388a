//! # Parade Engine
//!
//! An offline-first storage and synchronization engine.
//!
//! Applications read and write a local cache that answers immediately.
//! Every write is also recorded as a command and replayed against a remote
//! store in order, with client-generated ids remapped to server ids once
//! the remote confirms them.
//!
//! ## Core Concepts
//!
//! ### Key paths
//!
//! Data is addressed by a [`KeyPath`] alternating bucket names and ids:
//! `["zoo"]` is a bucket, `["zoo", "z1"]` a document and
//! `["zoo", "z1", "animals"]` a nested collection.
//!
//! ### Storage
//!
//! The [`Storage`] trait is the capability set every backend implements:
//! - [`LocalStorage`] - the local cache over a byte-budgeted LRU store
//! - [`MemoryStorage`] - a server-authoritative in-process backend
//! - [`Queue`] - the synchronization engine, wrapping a local cache
//!
//! ### Collections
//!
//! Collections are either unordered membership sets or ordered sequences.
//! Sequences are stored as an arena-backed doubly linked list
//! ([`Sequence`]) whose entries carry a [`SyncState`] until the remote
//! confirms them.
//!
//! ### Merge
//!
//! Remote reads are reconciled with the local cache by
//! [`merge::reconcile`], which emits [`MergeCommand`]s applied as confirmed
//! local writes. Items with pending local changes are never overwritten.
//!
//! ## Quick Start
//!
//! ```rust
//! use parade_engine::{
//!     CacheConfig, KeyPath, LocalStorage, MemoryCommandLog, MemoryStorage, Options, Queue,
//!     QueueConfig, Storage,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> parade_engine::Result<()> {
//! // 1. Local cache and remote store
//! let local = Arc::new(LocalStorage::from_config(&CacheConfig::default()));
//! let remote: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//!
//! // 2. The queue
//! let log = Arc::new(MemoryCommandLog::new());
//! let queue = Queue::new(local, Some(remote), log, QueueConfig::default());
//! queue.init().await?;
//!
//! // 3. Writes answer from the local cache
//! let zoo = KeyPath::bucket("zoo")?;
//! let doc = json!({"name": "Z1"}).as_object().cloned().unwrap_or_default();
//! let cid = queue.create(&zoo, doc, Options::default()).await?;
//!
//! // 4. Once drained, the document carries its server id
//! queue.wait_idle().await;
//! let stored = queue.fetch(&zoo.child(cid)?, Options::default().noremote()).await?;
//! assert_eq!(stored["_persisted"], json!(true));
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! Pending commands survive restarts through a [`CommandLog`];
//! [`FileCommandLog`] keeps them in a JSON file replaced atomically on
//! every change.

pub mod cache;
pub mod command;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod journal;
pub mod keypath;
pub mod local;
pub mod memory;
pub mod merge;
pub mod queue;
pub mod sequence;
pub mod storage;

// Re-export main types at crate root
pub use cache::{CacheStats, KeyValueStore, LruStore};
pub use command::{
    Command, CommandId, CreateCmd, DeleteCmd, DeleteItemCmd, InsertBeforeCmd, MembershipCmd,
    PendingCommand, SyncTaskCmd, UpdateCmd,
};
pub use config::{CacheConfig, ConfigError, QueueConfig};
pub use document::{Document, DocumentExt, SyncState};
pub use error::{Error, ErrorClass, Result};
pub use event::QueueEvent;
pub use journal::{CommandLog, FileCommandLog, MemoryCommandLog};
pub use keypath::KeyPath;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use merge::MergeCommand;
pub use queue::{Queue, QueueStatus};
pub use sequence::{Node, NodeIndex, Sequence};
pub use storage::{CollectionKind, Options, Query, Storage};

/// Type aliases for clarity
pub type ClientId = String;
pub type ServerId = String;
