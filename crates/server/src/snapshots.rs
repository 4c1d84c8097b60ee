//! DOM snapshot storage and diffing.
//!
//! `SnapshotStore` is a capacity-bounded store of immutable snapshots keyed
//! by id, oldest evicted on overflow. `diff` is a pure function producing a
//! sparse diff: selectors with no detected difference are omitted entirely.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use domlens_protocol::{new_id, DomSnapshot, ElementSnapshot, ElementSize};
use serde::Serialize;

use crate::error::BrokerError;

#[derive(Debug)]
pub struct SnapshotStore {
    // Insertion order doubles as eviction order; capacity is small enough
    // that id lookup by scan is fine.
    snapshots: VecDeque<DomSnapshot>,
    capacity: usize,
}

impl SnapshotStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity,
        }
    }

    /// Store a snapshot, minting an id if the extension did not provide one.
    /// Returns the id under which it is retrievable.
    pub fn store(&mut self, mut snapshot: DomSnapshot) -> String {
        if snapshot.id.is_empty() {
            snapshot.id = new_id();
        }
        let id = snapshot.id.clone();
        if self.capacity > 0 && self.snapshots.len() == self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
        id
    }

    pub fn get(&self, id: &str) -> Option<&DomSnapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Drop all stored snapshots. Besides capacity eviction, this is the
    /// only way a snapshot is destroyed.
    pub fn clear(&mut self) -> usize {
        let dropped = self.snapshots.len();
        self.snapshots.clear();
        dropped
    }

    pub fn diff(&self, before_id: &str, after_id: &str) -> Result<DomDiff, BrokerError> {
        let before = self
            .get(before_id)
            .ok_or_else(|| BrokerError::SnapshotNotFound(before_id.to_string()))?;
        let after = self
            .get(after_id)
            .ok_or_else(|| BrokerError::SnapshotNotFound(after_id.to_string()))?;
        Ok(diff(before, after))
    }
}

/// Sparse diff between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomDiff {
    pub before_id: String,
    pub after_id: String,
    pub entries: Vec<DiffEntry>,
}

impl DomDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DiffEntry {
    Added {
        selector: String,
    },
    Removed {
        selector: String,
    },
    Changed {
        selector: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        classes_added: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        classes_removed: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<SizeChange>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        styles: Vec<StyleChange>,
    },
}

impl DiffEntry {
    pub fn selector(&self) -> &str {
        match self {
            DiffEntry::Added { selector }
            | DiffEntry::Removed { selector }
            | DiffEntry::Changed { selector, .. } => selector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeChange {
    pub before: ElementSize,
    pub after: ElementSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleChange {
    pub property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// Compute the sparse diff between two snapshots. Selectors are processed in
/// lexicographic order so the output is reproducible.
pub fn diff(before: &DomSnapshot, after: &DomSnapshot) -> DomDiff {
    let selectors: BTreeSet<&String> = before.elements.keys().chain(after.elements.keys()).collect();

    let mut entries = Vec::new();
    for selector in selectors {
        match (before.elements.get(selector), after.elements.get(selector)) {
            (None, Some(_)) => entries.push(DiffEntry::Added {
                selector: selector.clone(),
            }),
            (Some(_), None) => entries.push(DiffEntry::Removed {
                selector: selector.clone(),
            }),
            (Some(b), Some(a)) => {
                if let Some(entry) = diff_element(selector, b, a) {
                    entries.push(entry);
                }
            }
            (None, None) => unreachable!("selector came from one of the two maps"),
        }
    }

    DomDiff {
        before_id: before.id.clone(),
        after_id: after.id.clone(),
        entries,
    }
}

fn diff_element(selector: &str, before: &ElementSnapshot, after: &ElementSnapshot) -> Option<DiffEntry> {
    let before_classes: BTreeSet<&String> = before.classes.iter().collect();
    let after_classes: BTreeSet<&String> = after.classes.iter().collect();
    let classes_added: Vec<String> = after_classes
        .difference(&before_classes)
        .map(|c| (*c).clone())
        .collect();
    let classes_removed: Vec<String> = before_classes
        .difference(&after_classes)
        .map(|c| (*c).clone())
        .collect();

    let size = (!size_eq(before.size, after.size)).then(|| SizeChange {
        before: before.size,
        after: after.size,
    });

    let styles = diff_styles(
        &parse_inline_style(before.inline_style.as_deref().unwrap_or("")),
        &parse_inline_style(after.inline_style.as_deref().unwrap_or("")),
    );

    if classes_added.is_empty() && classes_removed.is_empty() && size.is_none() && styles.is_empty()
    {
        return None;
    }

    Some(DiffEntry::Changed {
        selector: selector.to_string(),
        classes_added,
        classes_removed,
        size,
        styles,
    })
}

/// Exact size equality, except that NaN dimensions (an element the page
/// never laid out) compare equal to themselves so a snapshot never
/// diffs against itself.
fn size_eq(a: ElementSize, b: ElementSize) -> bool {
    dimension_eq(a.width, b.width) && dimension_eq(a.height, b.height)
}

fn dimension_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Parse a `style` attribute value into a property -> value map.
/// Property names are case-insensitive in CSS, so they are lowercased.
pub fn parse_inline_style(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for declaration in raw.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let property = property.trim().to_ascii_lowercase();
        let value = value.trim();
        if property.is_empty() || value.is_empty() {
            continue;
        }
        map.insert(property, value.to_string());
    }
    map
}

fn diff_styles(before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) -> Vec<StyleChange> {
    let properties: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let mut changes = Vec::new();
    for property in properties {
        let b = before.get(property);
        let a = after.get(property);
        if b != a {
            changes.push(StyleChange {
                property: property.clone(),
                before: b.cloned(),
                after: a.cloned(),
            });
        }
    }
    changes
}
