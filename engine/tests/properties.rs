//! Property tests for the sequence list and the merge.

use parade_engine::document::OP;
use parade_engine::merge::{merge_sequence, merge_set};
use parade_engine::{Document, DocumentExt, MergeCommand, Sequence, SyncState};
use proptest::prelude::*;
use serde_json::{json, Value};

// ============================================================================
// Sequence list invariant
// ============================================================================

#[derive(Debug, Clone)]
enum ListOp {
    Insert { before: Option<usize>, insync: bool },
    Delete { at: usize, insync: bool },
    Ack { at: usize },
}

fn list_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        3 => (proptest::option::of(any::<usize>()), any::<bool>())
            .prop_map(|(before, insync)| ListOp::Insert { before, insync }),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(at, insync)| ListOp::Delete { at, insync }),
        1 => any::<usize>().prop_map(|at| ListOp::Ack { at }),
    ]
}

fn pick<T>(items: &[T], at: usize) -> Option<&T> {
    if items.is_empty() {
        None
    } else {
        items.get(at % items.len())
    }
}

proptest! {
    #[test]
    fn sequence_links_stay_consistent(ops in proptest::collection::vec(list_op(), 0..64)) {
        let mut seq = Sequence::new();
        // Linked entries in order, tombstones included.
        let mut model: Vec<(String, SyncState)> = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            let live: Vec<String> = model
                .iter()
                .filter(|(_, s)| *s != SyncState::Rm)
                .map(|(k, _)| k.clone())
                .collect();
            match op {
                ListOp::Insert { before, insync } => {
                    let key = format!("k{}", n);
                    let reference = before.and_then(|at| pick(&live, at).cloned());
                    let state = if insync { SyncState::Insync } else { SyncState::Ib };
                    seq.insert_before(reference.as_deref(), key.clone(), state).unwrap();
                    let at = reference
                        .and_then(|r| model.iter().position(|(k, _)| *k == r))
                        .unwrap_or(model.len());
                    model.insert(at, (key, state));
                }
                ListOp::Delete { at, insync } => {
                    let Some(key) = pick(&live, at).cloned() else { continue };
                    seq.delete_item(&key, insync).unwrap();
                    let index = model.iter().position(|(k, _)| *k == key).unwrap();
                    if insync {
                        model.remove(index);
                    } else {
                        model[index].1 = SyncState::Rm;
                    }
                }
                ListOp::Ack { at } => {
                    let pending: Vec<String> = model
                        .iter()
                        .filter(|(_, s)| *s != SyncState::Insync)
                        .map(|(k, _)| k.clone())
                        .collect();
                    let Some(key) = pick(&pending, at).cloned() else { continue };
                    seq.ack(&key).unwrap();
                    let index = model.iter().position(|(k, _)| *k == key).unwrap();
                    if model[index].1 == SyncState::Rm {
                        model.remove(index);
                    } else {
                        model[index].1 = SyncState::Insync;
                    }
                }
            }

            prop_assert_eq!(seq.check_links(), Ok(()));
            let linked: Vec<(String, SyncState)> =
                seq.iter().map(|(_, node)| (node.key.clone(), node.sync)).collect();
            prop_assert_eq!(&linked, &model);
            let expected_live: Vec<&str> = model
                .iter()
                .filter(|(_, s)| *s != SyncState::Rm)
                .map(|(k, _)| k.as_str())
                .collect();
            prop_assert_eq!(seq.live_keys(), expected_live);
        }
    }
}

// ============================================================================
// Merge idempotence
// ============================================================================

const UNIVERSE: usize = 8;

fn unique(ids: Vec<usize>) -> Vec<usize> {
    let mut seen = Vec::new();
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn remote_list() -> impl Strategy<Value = Vec<Document>> {
    proptest::collection::vec((0..UNIVERSE, 0..2u8, any::<bool>()), 0..UNIVERSE).prop_map(|items| {
        let mut seen = Vec::new();
        items
            .into_iter()
            .filter(|(id, _, _)| {
                let fresh = !seen.contains(id);
                seen.push(*id);
                fresh
            })
            .map(|(id, version, with_cid)| {
                let mut doc = object(json!({"_id": format!("s{}", id), "name": format!("v{}", version)}));
                if with_cid {
                    doc.insert("_cid".into(), json!(format!("k{}", id)));
                }
                doc
            })
            .collect()
    })
}

fn local_state() -> impl Strategy<Value = SyncState> {
    prop_oneof![
        3 => Just(SyncState::Insync),
        1 => Just(SyncState::Ib),
        1 => Just(SyncState::Add),
        1 => Just(SyncState::Rm),
    ]
}

fn local_list() -> impl Strategy<Value = Vec<Document>> {
    proptest::collection::vec((0..UNIVERSE, 0..2u8, local_state()), 0..UNIVERSE).prop_map(|items| {
        let ids = unique(items.iter().map(|(id, _, _)| *id).collect());
        ids.into_iter()
            .filter_map(|id| items.iter().find(|(i, _, _)| *i == id).cloned())
            .map(|(id, version, state)| {
                let mut doc = object(json!({"_cid": format!("k{}", id), "name": format!("v{}", version)}));
                if !matches!(state, SyncState::Ib | SyncState::Add) {
                    doc.insert("_id".into(), json!(format!("s{}", id)));
                }
                doc.annotate(state);
                doc
            })
            .collect()
    })
}

/// Apply merge output the way the local cache does.
fn apply(local: &mut Vec<Document>, commands: &[MergeCommand]) {
    for command in commands {
        match command {
            MergeCommand::RemoveItem { id } | MergeCommand::Remove { id } => {
                local.retain(|d| !(d.sync_state() == Some(SyncState::Insync) && d.answers_to(id)));
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

proptest! {
    #[test]
    fn sequence_merge_is_idempotent(remote in remote_list(), local in local_list()) {
        let mut local: Vec<Document> = local
            .into_iter()
            .filter(|d| d.sync_state() != Some(SyncState::Add))
            .collect();
        let first = merge_sequence(&remote, &local);
        apply(&mut local, &first);

        let second = merge_sequence(&remote, &local);
        prop_assert!(second.is_empty(), "second merge produced {:?}", second);
    }

    #[test]
    fn set_merge_is_idempotent(remote in remote_list(), local in local_list()) {
        let mut local: Vec<Document> = local
            .into_iter()
            .filter(|d| d.sync_state() != Some(SyncState::Ib))
            .collect();
        let first = merge_set(&remote, &local);
        apply(&mut local, &first);

        let second = merge_set(&remote, &local);
        prop_assert!(second.is_empty(), "second merge produced {:?}", second);
    }

    #[test]
    fn merge_output_is_annotation_free(remote in remote_list(), local in local_list()) {
        for command in merge_sequence(&remote, &local).iter().chain(&merge_set(&remote, &local)) {
            let doc = match command {
                MergeCommand::InsertBefore { doc, .. }
                | MergeCommand::Add { doc }
                | MergeCommand::Update { doc, .. } => doc,
                _ => continue,
            };
            prop_assert!(!doc.contains_key(OP));
        }
    }
}
