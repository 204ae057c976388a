//! Plain-object documents and their reserved fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A string-keyed document.
pub type Document = serde_json::Map<String, Value>;

/// Client-generated id, assigned at creation time.
pub const CID: &str = "_cid";
/// Server-assigned id.
pub const ID: &str = "_id";
/// Set once a server round-trip succeeded.
pub const PERSISTED: &str = "_persisted";
/// Transient sync annotation, never part of the stored document.
pub const OP: &str = "__op";

/// Sync state of a collection member or sequence node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Confirmed by the remote store.
    Insync,
    /// Added locally, waiting for the remote add.
    Add,
    /// Tombstoned locally, waiting for the remote removal.
    Rm,
    /// Inserted into a sequence locally, waiting for confirmation.
    Ib,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Insync => "insync",
            SyncState::Add => "add",
            SyncState::Rm => "rm",
            SyncState::Ib => "ib",
        }
    }

    /// Every state but `insync` waits for the remote to confirm a local
    /// write.
    pub fn is_pending(self) -> bool {
        self != SyncState::Insync
    }
}

/// Fields the engine maintains; a remote copy may lack them.
pub fn is_reserved(key: &str) -> bool {
    matches!(key, CID | ID | PERSISTED | OP)
}

/// Generate a fresh client id.
pub fn new_cid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Accessors for the reserved document fields.
pub trait DocumentExt {
    fn cid(&self) -> Option<&str>;
    fn server_id(&self) -> Option<&str>;
    fn is_persisted(&self) -> bool;
    fn sync_state(&self) -> Option<SyncState>;

    /// The correlation key: `_cid` when present, otherwise `_id`.
    fn identity(&self) -> Option<&str> {
        self.cid().or_else(|| self.server_id())
    }

    /// True if `id` is either of this document's ids.
    fn answers_to(&self, id: &str) -> bool {
        self.cid() == Some(id) || self.server_id() == Some(id)
    }

    /// True if both documents describe the same logical item.
    fn same_item(&self, other: &Document) -> bool;

    /// True if every field of `other` (ignoring the sync annotation) holds
    /// the same value here and every field here, reserved ones aside, is
    /// present in `other`.
    fn content_matches(&self, other: &Document) -> bool;

    /// Take the content of `other`, keeping reserved fields `other` lacks.
    fn replace_content(&mut self, other: &Document);

    fn annotate(&mut self, state: SyncState);
    fn strip_annotation(&mut self);
}

impl DocumentExt for Document {
    fn cid(&self) -> Option<&str> {
        self.get(CID).and_then(Value::as_str)
    }

    fn server_id(&self) -> Option<&str> {
        self.get(ID).and_then(Value::as_str)
    }

    fn is_persisted(&self) -> bool {
        self.get(PERSISTED).and_then(Value::as_bool).unwrap_or(false)
    }

    fn sync_state(&self) -> Option<SyncState> {
        self.get(OP)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn same_item(&self, other: &Document) -> bool {
        if let (Some(a), Some(b)) = (self.cid(), other.cid()) {
            return a == b;
        }
        [self.cid(), self.server_id()]
            .into_iter()
            .flatten()
            .any(|id| other.answers_to(id))
    }

    fn content_matches(&self, other: &Document) -> bool {
        other
            .iter()
            .filter(|(k, _)| k.as_str() != OP)
            .all(|(k, v)| self.get(k) == Some(v))
            && self.keys().all(|k| is_reserved(k) || other.contains_key(k))
    }

    fn replace_content(&mut self, other: &Document) {
        self.retain(|k, _| is_reserved(k) || other.contains_key(k));
        for (k, v) in other.iter().filter(|(k, _)| k.as_str() != OP) {
            self.insert(k.clone(), v.clone());
        }
    }

    fn annotate(&mut self, state: SyncState) {
        self.insert(OP.to_string(), Value::from(state.as_str()));
    }

    fn strip_annotation(&mut self) {
        self.remove(OP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    #[test]
    fn reserved_accessors() {
        let d = doc(json!({"_cid": "c1", "_id": "s1", "_persisted": true}));
        assert_eq!(d.cid(), Some("c1"));
        assert_eq!(d.server_id(), Some("s1"));
        assert!(d.is_persisted());
        assert_eq!(d.identity(), Some("c1"));

        let bare = doc(json!({"name": "x"}));
        assert!(!bare.is_persisted());
        assert_eq!(bare.identity(), None);
    }

    #[test]
    fn identity_matching() {
        let local = doc(json!({"_cid": "c1"}));
        let remote = doc(json!({"_cid": "c1", "_id": "s1"}));
        assert!(local.same_item(&remote));
        assert!(remote.same_item(&local));

        let server_only = doc(json!({"_id": "s1"}));
        assert!(remote.same_item(&server_only));
        assert!(!local.same_item(&server_only));

        let other = doc(json!({"_cid": "c2", "_id": "s1"}));
        assert!(!remote.same_item(&other));
    }

    #[test]
    fn content_comparison_ignores_annotation() {
        let mut local = doc(json!({"_cid": "c1", "_persisted": true, "name": "Z1"}));
        local.annotate(SyncState::Insync);
        let remote = doc(json!({"_cid": "c1", "name": "Z1"}));
        assert!(local.content_matches(&remote));

        let changed = doc(json!({"_cid": "c1", "name": "Z2"}));
        assert!(!local.content_matches(&changed));
    }

    #[test]
    fn content_comparison_sees_removed_fields() {
        let mut local = doc(json!({"_cid": "c1", "name": "Z1", "motto": "old"}));
        local.annotate(SyncState::Insync);
        let remote = doc(json!({"_cid": "c1", "_id": "s1", "name": "Z1"}));
        assert!(!local.content_matches(&remote));

        local.replace_content(&remote);
        assert_eq!(
            local,
            doc(json!({"_cid": "c1", "_id": "s1", "name": "Z1", "__op": "insync"}))
        );
        assert!(local.content_matches(&remote));
    }

    #[test]
    fn pending_states() {
        assert!(!SyncState::Insync.is_pending());
        for state in [SyncState::Add, SyncState::Rm, SyncState::Ib] {
            assert!(state.is_pending());
        }
    }

    #[test]
    fn annotation_roundtrip() {
        let mut d = Document::new();
        d.annotate(SyncState::Ib);
        assert_eq!(d.sync_state(), Some(SyncState::Ib));
        assert_eq!(d[OP], json!("ib"));
        d.strip_annotation();
        assert!(d.sync_state().is_none());
    }
}
