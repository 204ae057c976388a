//! Sequence engine: an arena-backed doubly linked list.
//!
//! Nodes live in an append-only arena and refer to each other by index.
//! Two sentinels, [`BEGIN`] and [`END`], are allocated when the sequence is
//! created and never move. Deleting a node either tombstones it (`rm`,
//! still linked and traversable) or, once the removal is confirmed, unlinks
//! it. Unlinked nodes stay in the arena so indices held by concurrent
//! readers remain valid.

use crate::document::SyncState;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Stable handle of a node in the arena.
pub type NodeIndex = usize;

/// Index of the begin sentinel.
pub const BEGIN: NodeIndex = 0;
/// Index of the end sentinel.
pub const END: NodeIndex = 1;

/// A list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Key of the item this entry points at.
    pub key: String,
    pub sync: SyncState,
    /// `None` only for the begin sentinel and unlinked nodes.
    pub prev: Option<NodeIndex>,
    /// `None` only for the end sentinel and unlinked nodes.
    pub next: Option<NodeIndex>,
}

impl Node {
    fn sentinel(prev: Option<NodeIndex>, next: Option<NodeIndex>) -> Self {
        Self {
            key: String::new(),
            sync: SyncState::Insync,
            prev,
            next,
        }
    }
}

/// A doubly linked list with sentinel begin/end nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    nodes: Vec<Node>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence {
    /// Create an empty sequence holding only the sentinels.
    pub fn new() -> Self {
        Self {
            nodes: vec![
                Node::sentinel(None, Some(END)),
                Node::sentinel(Some(BEGIN), None),
            ],
        }
    }

    /// Get a node by index.
    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Number of arena slots, sentinels and unlinked nodes included.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Number of linked entries (tombstones included).
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[BEGIN].next == Some(END)
    }

    /// Forward traversal of linked entries, sentinels excluded.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            sequence: self,
            cursor: self.nodes[BEGIN].next,
            remaining: self.nodes.len(),
        }
    }

    /// Keys of all entries that are not tombstoned, in order.
    pub fn live_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, n)| n.sync != SyncState::Rm)
            .map(|(_, n)| n.key.as_str())
            .collect()
    }

    /// First linked entry satisfying `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&Node) -> bool) -> Option<NodeIndex> {
        self.iter().find(|(_, n)| predicate(n)).map(|(i, _)| i)
    }

    /// First linked entry with `key`.
    pub fn position(&self, key: &str) -> Option<NodeIndex> {
        self.find(|n| n.key == key)
    }

    /// Insert `key` before the entry keyed `ref_key`, or at the end.
    pub fn insert_before(
        &mut self,
        ref_key: Option<&str>,
        key: impl Into<String>,
        sync: SyncState,
    ) -> Result<NodeIndex> {
        let anchor = self.resolve(ref_key, END)?;
        self.insert_before_index(anchor, key, sync)
    }

    /// Insert `key` after the entry keyed `ref_key`, or at the beginning.
    pub fn insert_after(
        &mut self,
        ref_key: Option<&str>,
        key: impl Into<String>,
        sync: SyncState,
    ) -> Result<NodeIndex> {
        let anchor = self.resolve(ref_key, BEGIN)?;
        self.insert_after_index(anchor, key, sync)
    }

    /// Insert before the linked node at `anchor`.
    pub fn insert_before_index(
        &mut self,
        anchor: NodeIndex,
        key: impl Into<String>,
        sync: SyncState,
    ) -> Result<NodeIndex> {
        let prev = self
            .linked(anchor)
            .and_then(|n| n.prev)
            .ok_or_else(|| Error::ReferenceItemNotFound(format!("node {}", anchor)))?;
        Ok(self.link_between(prev, anchor, key.into(), sync))
    }

    /// Insert after the linked node at `anchor`.
    pub fn insert_after_index(
        &mut self,
        anchor: NodeIndex,
        key: impl Into<String>,
        sync: SyncState,
    ) -> Result<NodeIndex> {
        let next = self
            .linked(anchor)
            .and_then(|n| n.next)
            .ok_or_else(|| Error::ReferenceItemNotFound(format!("node {}", anchor)))?;
        Ok(self.link_between(anchor, next, key.into(), sync))
    }

    /// Delete the entry keyed `key`.
    ///
    /// With `insync` the entry is unlinked; otherwise it is tombstoned.
    pub fn delete_item(&mut self, key: &str, insync: bool) -> Result<()> {
        let index = self
            .position(key)
            .ok_or_else(|| Error::ReferenceItemNotFound(key.to_string()))?;
        self.delete_index(index, insync)
    }

    /// Delete the entry at `index`.
    pub fn delete_index(&mut self, index: NodeIndex, insync: bool) -> Result<()> {
        self.check_entry(index)?;
        if insync {
            self.unlink(index);
        } else {
            self.nodes[index].sync = SyncState::Rm;
        }
        Ok(())
    }

    /// Confirm the entry at `index`: pending inserts become `insync`,
    /// tombstones are unlinked.
    pub fn ack_index(&mut self, index: NodeIndex) -> Result<()> {
        self.check_entry(index)?;
        match self.nodes[index].sync {
            SyncState::Rm => self.unlink(index),
            _ => self.nodes[index].sync = SyncState::Insync,
        }
        Ok(())
    }

    /// Confirm the entry keyed `key`.
    pub fn ack(&mut self, key: &str) -> Result<()> {
        let index = self
            .position(key)
            .ok_or_else(|| Error::ReferenceItemNotFound(key.to_string()))?;
        self.ack_index(index)
    }

    /// Verify that every linked node is doubly consistent and that the
    /// chain runs from [`BEGIN`] to [`END`] without cycles.
    pub fn check_links(&self) -> std::result::Result<(), String> {
        let mut current = BEGIN;
        let mut steps = 0;
        while current != END {
            let next = self.nodes[current]
                .next
                .ok_or_else(|| format!("node {} has no next", current))?;
            let back = self
                .nodes
                .get(next)
                .ok_or_else(|| format!("node {} points past the arena", current))?
                .prev;
            if back != Some(current) {
                return Err(format!(
                    "node {}.next = {} but node {}.prev = {:?}",
                    current, next, next, back
                ));
            }
            current = next;
            steps += 1;
            if steps > self.nodes.len() {
                return Err("cycle detected".into());
            }
        }
        if self.nodes[BEGIN].prev.is_some() || self.nodes[END].next.is_some() {
            return Err("sentinel terminators overwritten".into());
        }
        Ok(())
    }

    fn resolve(&self, ref_key: Option<&str>, default: NodeIndex) -> Result<NodeIndex> {
        match ref_key {
            None => Ok(default),
            Some(key) => self
                .position(key)
                .ok_or_else(|| Error::ReferenceItemNotFound(key.to_string())),
        }
    }

    fn linked(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index).filter(|n| {
            index == BEGIN || index == END || (n.prev.is_some() && n.next.is_some())
        })
    }

    fn check_entry(&self, index: NodeIndex) -> Result<()> {
        if index == BEGIN || index == END || self.linked(index).is_none() {
            return Err(Error::ReferenceItemNotFound(format!("node {}", index)));
        }
        Ok(())
    }

    fn link_between(
        &mut self,
        prev: NodeIndex,
        next: NodeIndex,
        key: String,
        sync: SyncState,
    ) -> NodeIndex {
        let index = self.nodes.len();
        self.nodes.push(Node {
            key,
            sync,
            prev: Some(prev),
            next: Some(next),
        });
        self.nodes[prev].next = Some(index);
        self.nodes[next].prev = Some(index);
        index
    }

    fn unlink(&mut self, index: NodeIndex) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        if let (Some(prev), Some(next)) = (prev, next) {
            self.nodes[prev].next = Some(next);
            self.nodes[next].prev = Some(prev);
        }
        self.nodes[index].prev = None;
        self.nodes[index].next = None;
    }
}

/// Forward iterator over linked entries.
pub struct Iter<'a> {
    sequence: &'a Sequence,
    cursor: Option<NodeIndex>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (NodeIndex, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        if index == END || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let node = self.sequence.nodes.get(index)?;
        self.cursor = node.next;
        Some((index, node))
    }
}
