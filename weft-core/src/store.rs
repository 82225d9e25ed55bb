//! Content-addressed annotation store.
//!
//! Annotation values (styles, links, ...) are stored once and referenced by
//! hash everywhere else in the linear model. The hash is computed over the
//! canonical JSON encoding of the value, so two equal annotations always
//! resolve to the same reference — even when two stores that evolved
//! independently are merged during a rebase.
//!
//! The store is append-only: an existing hash's value is never mutated, so
//! concurrent readers are always safe.

use std::collections::BTreeMap;
use std::hash::Hasher;

use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Reference into an [`AnnotationStore`].
///
/// Stable across replicas: the hash depends only on the annotation value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationHash(String);

impl AnnotationHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnnotationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable annotation value: a name plus arbitrary JSON attributes.
///
/// Attributes use a `BTreeMap` so the JSON encoding is canonical and the
/// content hash is deterministic on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Annotation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Content hash of this annotation value.
    pub fn hash(&self) -> AnnotationHash {
        // BTreeMap ordering makes the JSON encoding canonical.
        let encoded = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = FxHasher::default();
        hasher.write(encoded.as_bytes());
        AnnotationHash(format!("h{:016x}", hasher.finish()))
    }
}

/// Deduplicated table of annotation values, keyed by content hash.
///
/// Insertion order is preserved so that store deltas can be sliced out
/// deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationStore {
    values: FxHashMap<AnnotationHash, Annotation>,
    hashes: Vec<AnnotationHash>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning its reference. Idempotent: inserting an
    /// equal value twice yields the same hash and stores it once.
    pub fn insert(&mut self, annotation: Annotation) -> AnnotationHash {
        let hash = annotation.hash();
        if !self.values.contains_key(&hash) {
            self.hashes.push(hash.clone());
            self.values.insert(hash.clone(), annotation);
        }
        hash
    }

    pub fn get(&self, hash: &AnnotationHash) -> Option<&Annotation> {
        self.values.get(hash)
    }

    pub fn contains(&self, hash: &AnnotationHash) -> bool {
        self.values.contains_key(hash)
    }

    /// Hashes in insertion order.
    pub fn hashes(&self) -> &[AnnotationHash] {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Merge another store into this one.
    ///
    /// Hash identity is preserved by construction: values are content
    /// addressed, so a hash present in both stores maps to an equal value.
    pub fn merge(&mut self, other: &AnnotationStore) {
        for hash in &other.hashes {
            if !self.values.contains_key(hash) {
                self.hashes.push(hash.clone());
                self.values
                    .insert(hash.clone(), other.values[hash].clone());
            }
        }
    }

    /// Absorb a wire delta into this store.
    pub fn absorb(&mut self, delta: &StoreDelta) -> Result<(), CoreError> {
        for hash in &delta.hashes {
            let value = delta
                .hash_store
                .get(hash)
                .ok_or_else(|| {
                    CoreError::InvalidOperation(format!("store delta missing value for {hash}"))
                })?;
            if value.hash() != *hash {
                return Err(CoreError::InvalidOperation(format!(
                    "store delta hash mismatch for {hash}"
                )));
            }
            if !self.values.contains_key(hash) {
                self.hashes.push(hash.clone());
                self.values.insert(hash.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Slice out the subset of this store named by `hashes`, preserving the
    /// given order. Unknown hashes are skipped.
    pub fn slice(&self, hashes: &[AnnotationHash]) -> StoreDelta {
        let mut delta = StoreDelta::default();
        for hash in hashes {
            if let Some(value) = self.values.get(hash) {
                if !delta.hash_store.contains_key(hash) {
                    delta.hashes.push(hash.clone());
                    delta.hash_store.insert(hash.clone(), value.clone());
                }
            }
        }
        delta
    }
}

/// The new annotation entries introduced by one transaction, in wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub hashes: Vec<AnnotationHash>,
    #[serde(rename = "hashStore")]
    pub hash_store: BTreeMap<AnnotationHash, Annotation>,
}

impl StoreDelta {
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn get(&self, hash: &AnnotationHash) -> Option<&Annotation> {
        self.hash_store.get(hash)
    }
}
