//! Reconciliation of a locally cached collection with the remote result.
//!
//! The remote read is authoritative for confirmed items. Merging produces
//! the commands that bring the local cache in line with it; the caller
//! applies them as `insync` writes.
//!
//! # Algorithm (sequences)
//!
//! 1. Confirmed local items missing remotely become `RemoveItem`.
//! 2. The longest run of remaining confirmed items that is already in
//!    remote order stays in place. Every other confirmed item is moved
//!    (`RemoveItem` + `InsertBefore`), so a merge moves as few items as
//!    possible.
//! 3. Walk the remote sequence:
//!    - an item pending locally (`ib`, `add`, `rm`) is left alone;
//!    - an item that stays is updated if its content differs;
//!    - anything else is inserted before the next item that stays (or at
//!      the end).
//!
//! Sets use the same rules without the ordering steps.

use crate::document::{Document, DocumentExt, SyncState};
use crate::storage::CollectionKind;
use serde::{Deserialize, Serialize};

/// A local write produced by a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum MergeCommand {
    /// Store `doc` and insert it before `ref_id`, or at the end.
    #[serde(rename_all = "camelCase")]
    InsertBefore { ref_id: Option<String>, doc: Document },
    /// Unlink a confirmed sequence item.
    RemoveItem { id: String },
    /// Store `doc` and add it to the set.
    Add { doc: Document },
    /// Drop a confirmed set member.
    Remove { id: String },
    /// Replace the content of `id` with the remote content.
    Update { id: String, doc: Document },
}

impl MergeCommand {
    /// Ids this command touches, local and remote.
    pub fn ids(&self) -> Vec<&str> {
        match self {
            MergeCommand::InsertBefore { doc, .. } | MergeCommand::Add { doc } => {
                [doc.cid(), doc.server_id()].into_iter().flatten().collect()
            }
            MergeCommand::RemoveItem { id } | MergeCommand::Remove { id } => vec![id.as_str()],
            MergeCommand::Update { id, doc } => std::iter::once(id.as_str())
                .chain([doc.cid(), doc.server_id()].into_iter().flatten())
                .collect(),
        }
    }
}

fn state_of(doc: &Document) -> SyncState {
    doc.sync_state().unwrap_or(SyncState::Insync)
}

/// Merge either kind of collection.
pub fn reconcile(kind: CollectionKind, remote: &[Document], local: &[Document]) -> Vec<MergeCommand> {
    match kind {
        CollectionKind::Set => merge_set(remote, local),
        CollectionKind::Sequence => merge_sequence(remote, local),
    }
}

/// Merge an ordered sequence, correlating items by `_cid`/`_id`.
pub fn merge_sequence(remote: &[Document], local: &[Document]) -> Vec<MergeCommand> {
    merge_sequence_by(remote, local, |a, b| a.same_item(b))
}

/// Merge an ordered sequence with a custom identity function.
pub fn merge_sequence_by<F>(remote: &[Document], local: &[Document], same: F) -> Vec<MergeCommand>
where
    F: Fn(&Document, &Document) -> bool,
{
    let mut commands = Vec::new();
    let local: Vec<&Document> = local.iter().filter(|d| d.identity().is_some()).collect();
    let remote: Vec<&Document> = remote.iter().filter(|d| d.identity().is_some()).collect();

    let mut kept = Vec::new();
    for doc in local.iter().copied().filter(|d| !state_of(d).is_pending()) {
        if remote.iter().any(|r| same(r, doc)) {
            kept.push(doc);
        } else {
            commands.push(MergeCommand::RemoveItem {
                id: identity(doc),
            });
        }
    }

    let pending: Vec<bool> = remote
        .iter()
        .map(|r| local.iter().any(|l| state_of(l).is_pending() && same(r, l)))
        .collect();

    // Position in `kept` of each remote item's confirmed local copy.
    let mut claimed = vec![false; kept.len()];
    let positions: Vec<Option<usize>> = remote
        .iter()
        .zip(&pending)
        .map(|(r, &pending)| {
            if pending {
                return None;
            }
            let i = (0..kept.len()).find(|&i| !claimed[i] && same(r, kept[i]))?;
            claimed[i] = true;
            Some(i)
        })
        .collect();
    let stays = longest_ordered_run(&positions);

    for (position, _) in positions.iter().zip(&stays).filter(|(_, stays)| !**stays) {
        if let Some(i) = position {
            commands.push(MergeCommand::RemoveItem {
                id: identity(kept[*i]),
            });
        }
    }

    let anchors: Vec<&Document> = positions
        .iter()
        .zip(&stays)
        .filter_map(|(position, &stays)| position.filter(|_| stays).map(|i| kept[i]))
        .collect();
    let mut cursor = 0;
    for (i, r) in remote.iter().enumerate() {
        if pending[i] {
            continue;
        }
        if stays[i] {
            let l = anchors[cursor];
            if !l.content_matches(r) {
                commands.push(MergeCommand::Update {
                    id: identity(l),
                    doc: clean(r),
                });
            }
            cursor += 1;
            continue;
        }
        commands.push(MergeCommand::InsertBefore {
            ref_id: anchors.get(cursor).map(|d| identity(d)),
            doc: clean(r),
        });
    }

    commands
}

/// Flags the entries of the longest strictly increasing subsequence of
/// `positions`, skipping `None`.
fn longest_ordered_run(positions: &[Option<usize>]) -> Vec<bool> {
    let entries: Vec<(usize, usize)> = positions
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|p| (i, p)))
        .collect();

    // tails[k] is the entry ending the best run of length k + 1 so far.
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; entries.len()];
    for (e, &(_, position)) in entries.iter().enumerate() {
        let k = tails.partition_point(|&t| entries[t].1 < position);
        if k > 0 {
            prev[e] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(e);
        } else {
            tails[k] = e;
        }
    }

    let mut flags = vec![false; positions.len()];
    let mut current = tails.last().copied();
    while let Some(e) = current {
        flags[entries[e].0] = true;
        current = prev[e];
    }
    flags
}

/// Merge an unordered set, correlating items by `_cid`/`_id`.
pub fn merge_set(remote: &[Document], local: &[Document]) -> Vec<MergeCommand> {
    merge_set_by(remote, local, |a, b| a.same_item(b))
}

/// Merge an unordered set with a custom identity function.
pub fn merge_set_by<F>(remote: &[Document], local: &[Document], same: F) -> Vec<MergeCommand>
where
    F: Fn(&Document, &Document) -> bool,
{
    let mut commands = Vec::new();
    let local: Vec<&Document> = local.iter().filter(|d| d.identity().is_some()).collect();
    let remote: Vec<&Document> = remote.iter().filter(|d| d.identity().is_some()).collect();

    for doc in local.iter().filter(|d| !state_of(d).is_pending()) {
        if !remote.iter().any(|r| same(r, doc)) {
            commands.push(MergeCommand::Remove {
                id: identity(doc),
            });
        }
    }

    for r in remote {
        match local.iter().find(|l| same(r, l)) {
            None => commands.push(MergeCommand::Add { doc: clean(r) }),
            Some(l) if !state_of(l).is_pending() => {
                if !l.content_matches(r) {
                    commands.push(MergeCommand::Update {
                        id: identity(l),
                        doc: clean(r),
                    });
                }
            }
            Some(_) => {}
        }
    }

    commands
}

fn identity(doc: &Document) -> String {
    doc.identity().unwrap_or_default().to_string()
}

fn clean(doc: &Document) -> Document {
    let mut doc = doc.clone();
    doc.strip_annotation();
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    fn item(cid: &str, op: &str) -> Document {
        doc(json!({"_cid": cid, "__op": op}))
    }

    fn remote(cid: &str) -> Document {
        doc(json!({"_cid": cid, "_id": format!("s-{}", cid), "_persisted": true}))
    }

    /// Apply sequence commands to an annotated list the way local storage does.
    fn apply(local: &mut Vec<Document>, commands: &[MergeCommand]) {
        for command in commands {
            match command {
                MergeCommand::RemoveItem { id } | MergeCommand::Remove { id } => {
                    local.retain(|d| !d.answers_to(id));
                }
                MergeCommand::InsertBefore { ref_id, doc } => {
                    let mut doc = doc.clone();
                    doc.annotate(SyncState::Insync);
                    let at = ref_id
                        .as_deref()
                        .and_then(|id| local.iter().position(|d| d.answers_to(id)))
                        .unwrap_or(local.len());
                    local.insert(at, doc);
                }
                MergeCommand::Add { doc } => {
                    let mut doc = doc.clone();
                    doc.annotate(SyncState::Insync);
                    local.push(doc);
                }
                MergeCommand::Update { id, doc } => {
                    if let Some(target) = local.iter_mut().find(|d| d.answers_to(id)) {
                        target.replace_content(doc);
                    }
                }
            }
        }
    }

    fn cids(list: &[Document]) -> Vec<&str> {
        list.iter().filter_map(|d| d.cid()).collect()
    }

    #[test]
    fn empty_local_inserts_everything_in_order() {
        let remote_seq = vec![remote("a"), remote("b")];
        let commands = merge_sequence(&remote_seq, &[]);
        assert_eq!(commands.len(), 2);
        assert!(commands
            .iter()
            .all(|c| matches!(c, MergeCommand::InsertBefore { ref_id: None, .. })));

        let mut local = Vec::new();
        apply(&mut local, &commands);
        assert_eq!(cids(&local), ["a", "b"]);
    }

    #[test]
    fn confirmed_items_missing_remotely_are_removed() {
        let mut local = vec![remote("a"), remote("b")];
        for d in &mut local {
            d.annotate(SyncState::Insync);
        }
        let commands = merge_sequence(&[remote("b")], &local);
        assert_eq!(
            commands,
            vec![MergeCommand::RemoveItem { id: "a".into() }]
        );
    }

    #[test]
    fn pending_items_are_never_dropped() {
        let local = vec![item("a", "ib"), item("b", "rm")];
        let commands = merge_sequence(&[remote("b")], &local);
        assert!(commands.is_empty());
    }

    #[test]
    fn new_remote_items_anchor_before_next_match() {
        let mut local = vec![item("a", "insync"), item("c", "insync")];
        let remote_seq = vec![remote("a"), remote("b"), remote("c")];
        let commands = merge_sequence(&remote_seq, &local);

        let inserts: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                MergeCommand::InsertBefore { ref_id, doc } => Some((ref_id.clone(), doc.cid())),
                _ => None,
            })
            .collect();
        assert_eq!(inserts, vec![(Some("c".to_string()), Some("b"))]);

        apply(&mut local, &commands);
        assert_eq!(cids(&local), ["a", "b", "c"]);
    }

    #[test]
    fn reordered_items_move() {
        let mut local = vec![item("b", "insync"), item("a", "insync")];
        let remote_seq = vec![remote("a"), remote("b")];
        let commands = merge_sequence(&remote_seq, &local);
        apply(&mut local, &commands);
        assert_eq!(cids(&local), ["a", "b"]);

        let again = merge_sequence(&remote_seq, &local);
        assert!(again.is_empty(), "{:?}", again);
    }

    #[test]
    fn moves_the_fewest_items() {
        let mut local = vec![
            item("c", "insync"),
            item("a", "insync"),
            item("b", "insync"),
        ];
        let remote_seq = vec![remote("a"), remote("b"), remote("c")];
        let commands: Vec<_> = merge_sequence(&remote_seq, &local)
            .into_iter()
            .filter(|c| !matches!(c, MergeCommand::Update { .. }))
            .collect();
        assert_eq!(commands.len(), 2, "{:?}", commands);
        assert_eq!(commands[0], MergeCommand::RemoveItem { id: "c".into() });
        assert!(matches!(
            &commands[1],
            MergeCommand::InsertBefore { ref_id: None, doc } if doc.cid() == Some("c")
        ));

        let cmds = merge_sequence(&remote_seq, &local);
        apply(&mut local, &cmds);
        assert_eq!(cids(&local), ["a", "b", "c"]);
        assert!(merge_sequence(&remote_seq, &local).is_empty());
    }

    #[test]
    fn longest_run_skips_unmatched() {
        let flags = longest_ordered_run(&[Some(3), None, Some(0), Some(1), Some(4), Some(2)]);
        assert_eq!(flags, [false, false, true, true, false, true]);
        assert!(longest_ordered_run(&[]).is_empty());
    }

    #[test]
    fn removed_fields_become_updates() {
        let mut local = vec![doc(json!({"_cid": "a", "name": "Z1", "motto": "old", "__op": "insync"}))];
        let remote_seq = vec![doc(json!({"_cid": "a", "name": "Z1"}))];
        let commands = merge_sequence(&remote_seq, &local);
        assert!(matches!(&commands[..], [MergeCommand::Update { id, .. }] if id == "a"));

        apply(&mut local, &commands);
        assert!(!local[0].contains_key("motto"));
        assert!(merge_sequence(&remote_seq, &local).is_empty());
    }

    #[test]
    fn content_changes_become_updates() {
        let local = vec![doc(json!({"_cid": "a", "name": "old", "__op": "insync"}))];
        let remote_seq = vec![doc(json!({"_cid": "a", "_id": "s1", "name": "new"}))];
        let commands = merge_sequence(&remote_seq, &local);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            MergeCommand::Update { id, doc } => {
                assert_eq!(id, "a");
                assert_eq!(doc["name"], json!("new"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let mut local = vec![
            item("x", "insync"),
            item("p", "ib"),
            item("c", "insync"),
            item("a", "insync"),
        ];
        let remote_seq = vec![remote("a"), remote("b"), remote("c"), remote("d")];
        let commands = merge_sequence(&remote_seq, &local);
        apply(&mut local, &commands);

        assert!(merge_sequence(&remote_seq, &local).is_empty());
        // Pending insert kept its slot.
        assert!(cids(&local).contains(&"p"));
        assert!(!cids(&local).contains(&"x"));
    }

    #[test]
    fn set_merge_rules() {
        let mut local = vec![
            item("a", "insync"),
            item("b", "add"),
            item("c", "rm"),
            item("gone", "insync"),
        ];
        let remote_set = vec![remote("a"), remote("c"), remote("new")];
        let commands = merge_set(&remote_set, &local);

        assert!(commands.contains(&MergeCommand::Remove { id: "gone".into() }));
        assert!(commands
            .iter()
            .any(|c| matches!(c, MergeCommand::Add { doc } if doc.cid() == Some("new"))));
        // "a" differs only in fields the local copy lacks.
        assert!(commands
            .iter()
            .any(|c| matches!(c, MergeCommand::Update { id, .. } if id == "a")));

        apply(&mut local, &commands);
        assert!(merge_set(&remote_set, &local).is_empty());
    }

    #[test]
    fn reconcile_dispatches_on_kind() {
        let remote_seq = vec![remote("a")];
        assert!(matches!(
            reconcile(CollectionKind::Sequence, &remote_seq, &[])[0],
            MergeCommand::InsertBefore { .. }
        ));
        assert!(matches!(
            reconcile(CollectionKind::Set, &remote_seq, &[])[0],
            MergeCommand::Add { .. }
        ));
    }

    #[test]
    fn command_ids() {
        let cmd = MergeCommand::Add {
            doc: remote("a"),
        };
        assert_eq!(cmd.ids(), vec!["a", "s-a"]);
    }
}
