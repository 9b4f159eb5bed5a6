//! Keel core types: resource identity, aggregated collections and their diffs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod aggregated;
pub mod error;
pub mod runner;
pub mod shard;

pub use aggregated::{AggregatedDiff, AggregatedList, DiffCategory, DiffEntry, DiffSummary};
pub use error::RunnerError;
pub use runner::{field_is, DiffRunner, RunStats};
pub use shard::ShardPlanner;

pub mod prelude {
    pub use super::{
        field_is, AggregatedDiff, AggregatedList, DiffCategory, DiffEntry, DiffRunner, ResourceKey,
        RunnerError, ShardPlanner,
    };
}

/// Identity of one manageable unit, e.g. `{service=github-org, org=acme}`.
///
/// Fields are kept sorted by name so equality and hashing ignore the order in
/// which they were supplied. A key is never mutated once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ResourceKey {
    fields: SmallVec<[(String, String); 4]>,
}

impl ResourceKey {
    pub fn new() -> Self { Self::default() }

    /// Builder-style field insertion; a repeated field name replaces the earlier value.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        let field = field.into();
        let value = value.into();
        match self.fields.binary_search_by(|(f, _)| f.as_str().cmp(field.as_str())) {
            Ok(idx) => self.fields[idx].1 = value,
            Err(idx) => self.fields.insert(idx, (field, value)),
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .binary_search_by(|(f, _)| f.as_str().cmp(field))
            .ok()
            .map(|idx| self.fields[idx].1.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.fields.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter().fold(ResourceKey::new(), |key, (f, v)| key.with(f, v))
    }
}

impl From<BTreeMap<String, String>> for ResourceKey {
    fn from(map: BTreeMap<String, String>) -> Self {
        // BTreeMap iteration is already sorted by field name
        Self { fields: map.into_iter().collect() }
    }
}

impl From<ResourceKey> for BTreeMap<String, String> {
    fn from(key: ResourceKey) -> Self { key.fields.into_iter().collect() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, value) in self.fields() {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", field, value)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_does_not_affect_identity() {
        let a = ResourceKey::new().with("org", "acme").with("service", "github-org-team").with("team", "sre");
        let b = ResourceKey::new().with("team", "sre").with("service", "github-org-team").with("org", "acme");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "org=acme,service=github-org-team,team=sre");
        assert_eq!(a.get("team"), Some("sre"));
        assert_eq!(a.get("cluster"), None);
    }

    #[test]
    fn differing_field_sets_are_distinct() {
        let org = ResourceKey::new().with("service", "github-org").with("org", "acme");
        let team = org.clone().with("team", "sre");
        assert_ne!(org, team);
        assert_eq!(team.len(), 3);
    }

    #[test]
    fn serializes_as_plain_mapping() {
        let key: ResourceKey = [("service", "github-org"), ("org", "acme")].into_iter().collect();
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!({"org": "acme", "service": "github-org"}));
        let back: ResourceKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }
}
