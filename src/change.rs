// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content fingerprints and change classification.
//!
//! A [`Fingerprint`] is a short SHA-256 digest of a JSON payload walked in a
//! canonical order (object keys sorted, every value type-tagged), so two
//! structurally identical payloads hash the same regardless of how their maps
//! were built. It also carries an element count used to tell additions from
//! removals.
//!
//! This is a signal-suppression aid, not an integrity check: a collision only
//! costs a skipped broadcast that the next refresh cycle makes up for.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Digest bytes kept in the hex hash.
const HASH_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Hex of the first 16 bytes of the canonical SHA-256
    pub hash: String,
    /// Element count of the payload's list content
    pub items: usize,
}

impl Fingerprint {
    #[must_use]
    pub fn of_value(value: &Value) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, value);
        let digest = hasher.finalize();
        Self {
            hash: hex::encode(&digest[..HASH_BYTES]),
            items: item_count(value),
        }
    }

    /// Fingerprint any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::of_value(&serde_json::to_value(value)?))
    }
}

/// Deterministic hash of `payload`.
#[must_use]
pub fn fingerprint(payload: &Value) -> String {
    Fingerprint::of_value(payload).hash
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n;"),
        Value::Bool(b) => hasher.update(if *b { b"t;" } else { b"f;" }),
        Value::Number(n) => {
            hasher.update(b"d");
            hasher.update(n.to_string().as_bytes());
            hasher.update(b";");
        }
        Value::String(s) => feed_str(hasher, s),
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                feed_str(hasher, key);
                feed(hasher, &map[key.as_str()]);
            }
            hasher.update(b"}");
        }
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update(b"s");
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Arrays count their elements. Objects count the elements of their
/// array-valued fields, nested objects included, or their field count when
/// they hold no arrays at all.
fn item_count(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(map) => array_items(value).unwrap_or(map.len()),
        _ => 1,
    }
}

fn array_items(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => map
            .values()
            .filter_map(array_items)
            .fold(None, |total, n| Some(total.unwrap_or(0) + n)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// First observation of the key
    Initial,
    Unchanged,
    /// More elements than before
    Added,
    /// Fewer elements than before
    Removed,
    /// Same element count, different content
    Updated,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Unchanged => "unchanged",
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Updated => "updated",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `new` against the previously recorded fingerprint.
#[must_use]
pub fn classify(old: Option<&Fingerprint>, new: &Fingerprint) -> ChangeKind {
    let Some(old) = old else {
        return ChangeKind::Initial;
    };
    if old.hash == new.hash {
        ChangeKind::Unchanged
    } else if new.items > old.items {
        ChangeKind::Added
    } else if new.items < old.items {
        ChangeKind::Removed
    } else {
        ChangeKind::Updated
    }
}

/// Result of [`ChangeDetector::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub previous: Option<Fingerprint>,
    pub current: Fingerprint,
}

impl Change {
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.kind != ChangeKind::Unchanged
    }
}

/// Last fingerprint per logical key.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Mutex<HashMap<String, Fingerprint>>,
}

impl ChangeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint `payload`, classify it against the last one seen for
    /// `key`, and record it if it differs. Atomic per call.
    pub fn observe(&self, key: &str, payload: &Value) -> Change {
        let current = Fingerprint::of_value(payload);
        let mut last = self.last.lock();
        let previous = last.get(key).cloned();
        let kind = classify(previous.as_ref(), &current);

        if kind != ChangeKind::Unchanged {
            last.insert(key.to_string(), current.clone());
            debug!(
                key,
                kind = %kind,
                hash = %current.hash,
                previous = previous.as_ref().map(|p| p.hash.as_str()).unwrap_or("-"),
                "Payload changed"
            );
            crate::metrics::record_change(kind.as_str());
        }

        Change { kind, previous, current }
    }

    /// Last fingerprint recorded for `key`.
    #[must_use]
    pub fn last(&self, key: &str) -> Option<Fingerprint> {
        self.last.lock().get(key).cloned()
    }

    /// Forget `key`; its next observation is `Initial` again.
    pub fn forget(&self, key: &str) -> bool {
        self.last.lock().remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.lock().is_empty()
    }
}
