//! Key paths: the addressing scheme shared by every storage backend.
//!
//! A key path alternates bucket names and identifiers, e.g.
//! `["zoo", "z1", "animals", "a7"]`. Odd lengths address buckets, even
//! lengths address documents.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when a key path is flattened into a cache key.
pub const KEY_SEPARATOR: char = '@';

/// An ordered, non-empty sequence of key path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Build a key path from its segments.
    ///
    /// Fails with [`Error::InvalidKey`] when the path is empty or a segment
    /// is empty or contains the separator.
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::InvalidKey("empty key path".into()));
        }
        for segment in &segments {
            if segment.is_empty() || segment.contains(KEY_SEPARATOR) {
                return Err(Error::InvalidKey(format!(
                    "invalid segment '{}' in {}",
                    segment,
                    segments.join("@")
                )));
            }
        }
        Ok(Self(segments))
    }

    /// A single-segment bucket key path.
    pub fn bucket(name: impl Into<String>) -> Result<Self> {
        Self::new([name.into()])
    }

    /// Parse a flattened cache key back into a key path.
    pub fn from_key(key: &str) -> Result<Self> {
        Self::new(key.split(KEY_SEPARATOR))
    }

    /// Flatten into the `@`-joined cache key.
    pub fn to_key(&self) -> String {
        self.0.join("@")
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when this path names a bucket (collection).
    pub fn is_bucket(&self) -> bool {
        self.0.len() % 2 == 1
    }

    /// True when this path names a single document.
    pub fn is_document(&self) -> bool {
        self.0.len() % 2 == 0
    }

    /// Extend this path by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self> {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    /// The path without its last segment, if any remains.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// The last segment.
    pub fn last(&self) -> &str {
        // Non-empty by construction.
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// Identifier of the addressed document, if this is a document path.
    pub fn id(&self) -> Option<&str> {
        if self.is_document() {
            Some(self.last())
        } else {
            None
        }
    }

    /// The top-level bucket holding the items of this collection.
    ///
    /// Items of `["parade", "p1", "animals"]` live in `["animals"]`.
    pub fn items_bucket(&self) -> Self {
        Self(vec![self.last().to_string()])
    }

    /// Ensure this path addresses a bucket.
    pub fn expect_bucket(&self) -> Result<()> {
        if self.is_bucket() {
            Ok(())
        } else {
            Err(Error::InvalidKey(format!("{} is not a bucket", self)))
        }
    }

    /// Ensure this path addresses a document.
    pub fn expect_document(&self) -> Result<()> {
        if self.is_document() {
            Ok(())
        } else {
            Err(Error::InvalidKey(format!("{} is not a document", self)))
        }
    }

    /// Replace every identifier segment equal to `old` by `new`.
    ///
    /// Returns true if anything changed.
    pub fn replace_id(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        for segment in self.0.iter_mut().skip(1).step_by(2) {
            if segment == old {
                *segment = new.to_string();
                changed = true;
            }
        }
        changed
    }

    /// Replace the leading `prefix` segments by `replacement`.
    pub(crate) fn rebase(&self, prefix_len: usize, replacement: &KeyPath) -> Self {
        let mut segments = replacement.0.clone();
        segments.extend_from_slice(&self.0[prefix_len..]);
        Self(segments)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

impl TryFrom<Vec<String>> for KeyPath {
    type Error = Error;

    fn try_from(segments: Vec<String>) -> Result<Self> {
        Self::new(segments)
    }
}

impl From<KeyPath> for Vec<String> {
    fn from(key_path: KeyPath) -> Self {
        key_path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_and_document_depth() {
        let zoo = KeyPath::bucket("zoo").unwrap();
        assert!(zoo.is_bucket());
        assert!(zoo.id().is_none());

        let z1 = zoo.child("z1").unwrap();
        assert!(z1.is_document());
        assert_eq!(z1.id(), Some("z1"));

        let animals = z1.child("animals").unwrap();
        assert!(animals.is_bucket());
        assert_eq!(animals.items_bucket(), KeyPath::bucket("animals").unwrap());
    }

    #[test]
    fn rejects_invalid_segments() {
        assert!(KeyPath::new(Vec::<String>::new()).is_err());
        assert!(KeyPath::new(["zoo", ""]).is_err());
        assert!(matches!(
            KeyPath::new(["zoo@x"]),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn key_roundtrip() {
        let path = KeyPath::new(["zoo", "z1", "animals", "a7"]).unwrap();
        assert_eq!(path.to_key(), "zoo@z1@animals@a7");
        assert_eq!(KeyPath::from_key("zoo@z1@animals@a7").unwrap(), path);
    }

    #[test]
    fn replace_only_touches_identifiers() {
        let mut path = KeyPath::new(["c1", "c1", "animals", "a7"]).unwrap();
        assert!(path.replace_id("c1", "s1"));
        assert_eq!(path.segments(), ["c1", "s1", "animals", "a7"]);
        assert!(!path.replace_id("zzz", "s2"));
    }

    #[test]
    fn parent_and_rebase() {
        let path = KeyPath::new(["zoo", "s1", "animals"]).unwrap();
        assert_eq!(path.parent().unwrap().to_key(), "zoo@s1");

        let target = KeyPath::new(["zoo", "c1"]).unwrap();
        assert_eq!(path.rebase(2, &target).to_key(), "zoo@c1@animals");
    }

    #[test]
    fn serde_as_array() {
        let path = KeyPath::new(["zoo", "z1"]).unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["zoo","z1"]"#);
        let parsed: KeyPath = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, path);

        assert!(serde_json::from_str::<KeyPath>("[]").is_err());
    }
}
