//! Commands: pending remote effects of local writes.
//!
//! Every mutation applied to the local cache is recorded as a command and
//! replayed against the remote store in FIFO order. Commands are persisted
//! so an interrupted process resumes with the same pending work.

use crate::document::Document;
use crate::keypath::KeyPath;
use crate::storage::{CollectionKind, Query};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a queued command.
pub type CommandId = String;

/// Create a document in a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCmd {
    /// Bucket
    pub key_path: KeyPath,
    /// Document, including its `_cid`
    pub args: Document,
}

/// Merge fields into a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCmd {
    pub key_path: KeyPath,
    pub args: Document,
}

/// Delete a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCmd {
    pub key_path: KeyPath,
}

/// Add or remove set members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipCmd {
    /// The set
    pub key_path: KeyPath,
    /// Bucket holding the member documents
    pub items_key_path: KeyPath,
    pub item_ids: Vec<String>,
    /// Ids superseded by a remap while this command was queued
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_item_ids: Vec<String>,
}

/// Insert a document into a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertBeforeCmd {
    /// The sequence
    pub key_path: KeyPath,
    /// Reference entry; `None` appends
    pub id: Option<String>,
    pub item_key_path: KeyPath,
    /// Id of the local entry this insert created
    pub cid: String,
}

/// Remove an entry from a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemCmd {
    pub key_path: KeyPath,
    pub id: String,
}

/// Re-read a collection from the remote once earlier commands completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTaskCmd {
    pub key_path: KeyPath,
    pub kind: CollectionKind,
    #[serde(default)]
    pub query: Query,
}

/// A command waiting to be replayed against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Create(CreateCmd),
    Update(UpdateCmd),
    Delete(DeleteCmd),
    Add(MembershipCmd),
    Remove(MembershipCmd),
    InsertBefore(InsertBeforeCmd),
    DeleteItem(DeleteItemCmd),
    SyncTask(SyncTaskCmd),
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create(_) => "create",
            Command::Update(_) => "update",
            Command::Delete(_) => "delete",
            Command::Add(_) => "add",
            Command::Remove(_) => "remove",
            Command::InsertBefore(_) => "insertBefore",
            Command::DeleteItem(_) => "deleteItem",
            Command::SyncTask(_) => "syncTask",
        }
    }

    /// Key path the command targets.
    pub fn key_path(&self) -> &KeyPath {
        match self {
            Command::Create(cmd) => &cmd.key_path,
            Command::Update(cmd) => &cmd.key_path,
            Command::Delete(cmd) => &cmd.key_path,
            Command::Add(cmd) | Command::Remove(cmd) => &cmd.key_path,
            Command::InsertBefore(cmd) => &cmd.key_path,
            Command::DeleteItem(cmd) => &cmd.key_path,
            Command::SyncTask(cmd) => &cmd.key_path,
        }
    }

    /// True if `id` appears anywhere in this command's addressing.
    pub fn references(&self, id: &str) -> bool {
        let in_path = |path: &KeyPath| path.segments().iter().skip(1).step_by(2).any(|s| s == id);
        if in_path(self.key_path()) {
            return true;
        }
        match self {
            Command::Create(cmd) => cmd
                .args
                .get(crate::document::CID)
                .and_then(|v| v.as_str())
                .is_some_and(|cid| cid == id),
            Command::Add(cmd) | Command::Remove(cmd) => {
                cmd.item_ids.iter().chain(&cmd.old_item_ids).any(|i| i == id)
            }
            Command::InsertBefore(cmd) => {
                in_path(&cmd.item_key_path) || cmd.cid == id || cmd.id.as_deref() == Some(id)
            }
            Command::DeleteItem(cmd) => cmd.id == id,
            Command::Update(_) | Command::Delete(_) | Command::SyncTask(_) => false,
        }
    }

    /// Rewrite every reference to client id `old` as server id `new`.
    ///
    /// Superseded set member ids are kept in `old_item_ids`. Returns true
    /// if anything changed.
    pub fn remap(&mut self, old: &str, new: &str) -> bool {
        match self {
            Command::Create(cmd) => cmd.key_path.replace_id(old, new),
            Command::Update(cmd) => cmd.key_path.replace_id(old, new),
            Command::Delete(cmd) => cmd.key_path.replace_id(old, new),
            Command::Add(cmd) | Command::Remove(cmd) => {
                let mut changed = cmd.key_path.replace_id(old, new);
                changed |= cmd.items_key_path.replace_id(old, new);
                for id in cmd.item_ids.iter_mut().filter(|id| id.as_str() == old) {
                    *id = new.to_string();
                    if !cmd.old_item_ids.iter().any(|o| o == old) {
                        cmd.old_item_ids.push(old.to_string());
                    }
                    changed = true;
                }
                changed
            }
            Command::InsertBefore(cmd) => {
                let mut changed = cmd.key_path.replace_id(old, new);
                changed |= cmd.item_key_path.replace_id(old, new);
                if cmd.id.as_deref() == Some(old) {
                    cmd.id = Some(new.to_string());
                    changed = true;
                }
                changed
            }
            Command::DeleteItem(cmd) => {
                let mut changed = cmd.key_path.replace_id(old, new);
                if cmd.id == old {
                    cmd.id = new.to_string();
                    changed = true;
                }
                changed
            }
            Command::SyncTask(cmd) => cmd.key_path.replace_id(old, new),
        }
    }
}

/// A command waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub id: CommandId,
    pub command: Command,
    /// Failed dispatch attempts so far
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn new(command: Command) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}
