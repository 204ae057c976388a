//! Notifications emitted by the command queue.

use crate::command::PendingCommand;
use crate::error::Error;
use crate::keypath::KeyPath;

/// Asynchronous outcome of queued work.
///
/// Remote failures never reach the caller of the write, so
/// observers subscribe to these events instead.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The remote store acknowledged a command.
    Synced { command: PendingCommand },
    /// A client id was replaced by a server id.
    Remapped {
        key_path: KeyPath,
        cid: String,
        id: String,
    },
    /// Local state of a collection or document was reconciled with a
    /// remote read; re-read to observe it.
    Resynced { key_path: KeyPath },
    /// A transient failure; the command stays at the head of the queue.
    Retrying {
        command: PendingCommand,
        error: Error,
        delay_ms: u64,
    },
    /// A terminal failure; the command was discarded.
    Error {
        command: Option<PendingCommand>,
        error: Error,
    },
}
