//! Aggregated collections (`key -> set of members`) and the diff between a
//! current and a desired snapshot.

use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::ResourceKey;

/// Resource key mapped to an unordered set of member items.
///
/// `add` unions into an existing entry, so building a collection is
/// order-independent. An entry with no items is legal: the resource exists
/// but has no members.
#[derive(Debug, Clone, Default)]
pub struct AggregatedList {
    entries: FxHashMap<ResourceKey, BTreeSet<String>>,
}

impl AggregatedList {
    pub fn new() -> Self { Self::default() }

    pub fn add<I, S>(&mut self, key: ResourceKey, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.entry(key).or_default().extend(items.into_iter().map(Into::into));
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&BTreeSet<String>> { self.entries.get(key) }
    pub fn contains_key(&self, key: &ResourceKey) -> bool { self.entries.contains_key(key) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Every entry exactly once, in no particular order.
    pub fn dump(&self) -> impl Iterator<Item = (&ResourceKey, &BTreeSet<String>)> + '_ {
        self.entries.iter()
    }

    /// Diff `self` (current) against `desired`.
    pub fn diff(&self, desired: &AggregatedList) -> AggregatedDiff {
        AggregatedDiff::compute(self, desired)
    }
}

/// Diff categories, declared in the order the runner processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffCategory {
    Insert,
    Delete,
    UpdateInsert,
    UpdateDelete,
}

impl DiffCategory {
    pub const ALL: [DiffCategory; 4] =
        [DiffCategory::Insert, DiffCategory::Delete, DiffCategory::UpdateInsert, DiffCategory::UpdateDelete];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiffCategory::Insert => "insert",
            DiffCategory::Delete => "delete",
            DiffCategory::UpdateInsert => "update-insert",
            DiffCategory::UpdateDelete => "update-delete",
        }
    }
}

impl fmt::Display for DiffCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One change. `items` is the full member set for insert/delete and only the
/// delta for update-insert/update-delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub category: DiffCategory,
    pub key: ResourceKey,
    pub items: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub inserts: usize,
    pub deletes: usize,
    pub member_adds: usize,
    pub member_removes: usize,
}

/// The four change categories between two aggregated collections.
/// Entries inside each category are sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedDiff {
    pub insert: Vec<DiffEntry>,
    pub delete: Vec<DiffEntry>,
    pub update_insert: Vec<DiffEntry>,
    pub update_delete: Vec<DiffEntry>,
}

impl AggregatedDiff {
    pub fn compute(current: &AggregatedList, desired: &AggregatedList) -> Self {
        let mut out = AggregatedDiff::default();

        for (key, items) in desired.dump() {
            if !current.contains_key(key) {
                out.insert.push(DiffEntry { category: DiffCategory::Insert, key: key.clone(), items: items.clone() });
            }
        }

        for (key, cur_items) in current.dump() {
            let Some(want_items) = desired.get(key) else {
                out.delete.push(DiffEntry { category: DiffCategory::Delete, key: key.clone(), items: cur_items.clone() });
                continue;
            };
            let added: BTreeSet<String> = want_items.difference(cur_items).cloned().collect();
            let removed: BTreeSet<String> = cur_items.difference(want_items).cloned().collect();
            if !added.is_empty() {
                out.update_insert.push(DiffEntry { category: DiffCategory::UpdateInsert, key: key.clone(), items: added });
            }
            if !removed.is_empty() {
                out.update_delete.push(DiffEntry { category: DiffCategory::UpdateDelete, key: key.clone(), items: removed });
            }
        }

        for list in [&mut out.insert, &mut out.delete, &mut out.update_insert, &mut out.update_delete] {
            list.sort_by(|a, b| a.key.cmp(&b.key));
        }
        out
    }

    pub fn entries(&self, category: DiffCategory) -> &[DiffEntry] {
        match category {
            DiffCategory::Insert => &self.insert,
            DiffCategory::Delete => &self.delete,
            DiffCategory::UpdateInsert => &self.update_insert,
            DiffCategory::UpdateDelete => &self.update_delete,
        }
    }

    /// All entries in runner order.
    pub fn iter(&self) -> impl Iterator<Item = &DiffEntry> + '_ {
        DiffCategory::ALL.into_iter().flat_map(move |c| self.entries(c).iter())
    }

    pub fn is_empty(&self) -> bool { self.iter().next().is_none() }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            inserts: self.insert.len(),
            deletes: self.delete.len(),
            member_adds: self.update_insert.iter().map(|e| e.items.len()).sum(),
            member_removes: self.update_delete.iter().map(|e| e.items.len()).sum(),
        }
    }
}
