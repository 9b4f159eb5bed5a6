//! Keel label inventory.
//!
//! For each `(cluster, namespace)` unit the inventory holds:
//! - `desired`: label key/values declared by configuration
//! - `current`: labels observed on the live namespace
//! - `managed`: label keys this reconciler previously claimed (persisted)
//!
//! and, after [`LabelInventory::reconcile`]:
//! - `changed`: the patch to apply; `None` values mean "remove this label"
//! - `updated_managed`: the managed key set to persist, `None` when ownership
//!   did not change
//!
//! Units also accumulate [`LabelIssue`]s. A unit with any issue is frozen:
//! it is skipped by reconcile and apply until the issue is fixed upstream.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod collect;
pub mod validate;

pub use collect::{
    collect_current, collect_desired, collect_managed, CollectStats, DesiredNamespace, NamespaceSource,
    ObservedNamespace,
};
pub use validate::validate_labels;

pub type Labels = BTreeMap<String, String>;
pub type LabelKeys = BTreeSet<String>;
/// Label patch: `Some(value)` sets, `None` removes.
pub type Changes = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceRef {
    pub cluster: String,
    pub namespace: String,
}

impl NamespaceRef {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.into() }
    }

    /// Key under which the managed label keys of this namespace are persisted.
    pub fn state_key(&self) -> String {
        format!("{}/{}-managed-labels", self.cluster, self.namespace)
    }
}

impl fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.namespace)
    }
}

/// A per-unit condition that blocks reconciliation. Never raised, only recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelIssue {
    Validation { message: String },
    Conflict { key: String, desired: String, current: String },
}

impl LabelIssue {
    pub fn validation(message: impl Into<String>) -> Self {
        LabelIssue::Validation { message: message.into() }
    }
}

impl fmt::Display for LabelIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelIssue::Validation { message } => f.write_str(message),
            LabelIssue::Conflict { key, desired, current } => {
                write!(f, "Label conflict: desired {key}={desired} vs current {key}={current}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelUnit {
    pub desired: Option<Labels>,
    pub current: Option<Labels>,
    pub managed: Option<LabelKeys>,
    pub changed: Changes,
    pub updated_managed: Option<LabelKeys>,
}

/// Result of reconciling one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitPlan {
    pub changed: Changes,
    pub updated_managed: Option<LabelKeys>,
}

/// Copy of the previous managed set with ownership toggles applied.
struct Ownership<'a> {
    previous: &'a LabelKeys,
    pending: Option<LabelKeys>,
}

impl<'a> Ownership<'a> {
    fn new(previous: &'a LabelKeys) -> Self { Self { previous, pending: None } }

    /// Previously managed keys are released, others are claimed.
    fn toggle(&mut self, key: &str) {
        let previous = self.previous;
        let pending = self.pending.get_or_insert_with(|| previous.clone());
        if previous.contains(key) {
            pending.remove(key);
        } else {
            pending.insert(key.to_string());
        }
    }

    fn into_updated(self) -> Option<LabelKeys> { self.pending }
}

impl LabelUnit {
    /// Compute the patch and ownership transition for this unit.
    ///
    /// Steps run in a fixed order: release stale managed keys, resolve each
    /// desired key (new / conflict / drift), then schedule removal of managed
    /// keys that are no longer desired. Any conflict discards the whole plan.
    pub fn plan(&self) -> Result<UnitPlan, Vec<LabelIssue>> {
        let no_labels = Labels::new();
        let no_keys = LabelKeys::new();
        let desired = self.desired.as_ref().unwrap_or(&no_labels);
        let current = self.current.as_ref().unwrap_or(&no_labels);
        let managed = self.managed.as_ref().unwrap_or(&no_keys);

        let mut ownership = Ownership::new(managed);
        let mut changed = Changes::new();
        let mut issues = Vec::new();

        for k in managed {
            if !desired.contains_key(k) && !current.contains_key(k) {
                ownership.toggle(k);
            }
        }

        for (k, v) in desired {
            match current.get(k) {
                None => {
                    if !managed.contains(k) {
                        ownership.toggle(k);
                    }
                    changed.insert(k.clone(), Some(v.clone()));
                }
                Some(cur) if !managed.contains(k) => issues.push(LabelIssue::Conflict {
                    key: k.clone(),
                    desired: v.clone(),
                    current: cur.clone(),
                }),
                Some(cur) if cur != v => {
                    changed.insert(k.clone(), Some(v.clone()));
                }
                Some(_) => {}
            }
        }

        for k in current.keys() {
            if managed.contains(k) && !desired.contains_key(k) {
                changed.insert(k.clone(), None);
            }
        }

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(UnitPlan { changed, updated_managed: ownership.into_updated() })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub units: usize,
    pub changed: usize,
    pub ownership_updates: usize,
    pub skipped: usize,
    pub conflicted: usize,
}

#[derive(Default)]
struct Inner {
    units: BTreeMap<NamespaceRef, LabelUnit>,
    issues: BTreeMap<NamespaceRef, Vec<LabelIssue>>,
}

/// Shared, synchronized owner of all label units.
///
/// Every accessor takes the internal lock for a single read or assignment and
/// releases it before returning, so callers may share the inventory across
/// workers and never hold the lock across I/O.
#[derive(Default)]
pub struct LabelInventory {
    inner: Mutex<Inner>,
}

impl LabelInventory {
    pub fn new() -> Self { Self::default() }

    // The guarded maps stay consistent after a panicking writer: every
    // mutation is a single insert/remove.
    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add_issue(&self, ns: &NamespaceRef, issue: LabelIssue) {
        self.lock().issues.entry(ns.clone()).or_default().push(issue);
    }

    pub fn issues(&self, ns: &NamespaceRef) -> Vec<LabelIssue> {
        self.lock().issues.get(ns).cloned().unwrap_or_default()
    }

    pub fn has_issues(&self, ns: &NamespaceRef) -> bool {
        self.lock().issues.get(ns).is_some_and(|v| !v.is_empty())
    }

    pub fn has_any_error(&self) -> bool { self.lock().issues.values().any(|v| !v.is_empty()) }

    /// `(unit, issues)` for every unit with at least one issue, sorted by unit.
    pub fn iter_errors(&self) -> Vec<(NamespaceRef, Vec<LabelIssue>)> {
        self.lock()
            .issues
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(ns, v)| (ns.clone(), v.clone()))
            .collect()
    }

    pub fn desired(&self, ns: &NamespaceRef) -> Option<Labels> {
        self.lock().units.get(ns).and_then(|u| u.desired.clone())
    }

    pub fn has_desired(&self, ns: &NamespaceRef) -> bool {
        self.lock().units.get(ns).is_some_and(|u| u.desired.is_some())
    }

    pub fn set_desired(&self, ns: &NamespaceRef, labels: Labels) {
        self.lock().units.entry(ns.clone()).or_default().desired = Some(labels);
    }

    pub fn set_current(&self, ns: &NamespaceRef, labels: Labels) {
        self.lock().units.entry(ns.clone()).or_default().current = Some(labels);
    }

    pub fn set_managed(&self, ns: &NamespaceRef, keys: LabelKeys) {
        self.lock().units.entry(ns.clone()).or_default().managed = Some(keys);
    }

    /// Drop a unit entirely. Recorded issues are kept.
    pub fn delete(&self, ns: &NamespaceRef) {
        self.lock().units.remove(ns);
    }

    pub fn unit(&self, ns: &NamespaceRef) -> Option<LabelUnit> { self.lock().units.get(ns).cloned() }

    pub fn unit_refs(&self) -> Vec<NamespaceRef> { self.lock().units.keys().cloned().collect() }

    /// Clone of every unit, sorted by unit.
    pub fn snapshot(&self) -> Vec<(NamespaceRef, LabelUnit)> {
        self.lock().units.iter().map(|(ns, u)| (ns.clone(), u.clone())).collect()
    }

    pub fn len(&self) -> usize { self.lock().units.len() }
    pub fn is_empty(&self) -> bool { self.lock().units.is_empty() }

    /// Compute `changed` and `updated_managed` for every unit without issues.
    /// Units lacking a desired or a current view are left untouched.
    ///
    /// Units never read each other's views; the lock is taken per unit.
    pub fn reconcile(&self) -> ReconcileStats {
        let started = std::time::Instant::now();
        let mut stats = ReconcileStats::default();
        for ns in self.unit_refs() {
            stats.units += 1;
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.issues.get(&ns).is_some_and(|v| !v.is_empty()) {
                stats.skipped += 1;
                continue;
            }
            let Some(unit) = inner.units.get_mut(&ns) else { continue };
            if unit.desired.is_none() {
                debug!(unit = %ns, "no desired labels; skipping");
                stats.skipped += 1;
                continue;
            }
            if unit.current.is_none() {
                debug!(unit = %ns, "live labels not observed; skipping");
                stats.skipped += 1;
                continue;
            }
            match unit.plan() {
                Ok(plan) => {
                    if !plan.changed.is_empty() { stats.changed += 1; }
                    if plan.updated_managed.is_some() { stats.ownership_updates += 1; }
                    unit.changed = plan.changed;
                    unit.updated_managed = plan.updated_managed;
                }
                Err(found) => {
                    unit.changed.clear();
                    unit.updated_managed = None;
                    stats.conflicted += 1;
                    inner.issues.entry(ns.clone()).or_default().extend(found);
                }
            }
        }
        histogram!("labels_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn keys(items: &[&str]) -> LabelKeys { items.iter().map(|s| s.to_string()).collect() }

    fn unit(desired: &[(&str, &str)], current: &[(&str, &str)], managed: &[&str]) -> LabelUnit {
        LabelUnit {
            desired: Some(labels(desired)),
            current: Some(labels(current)),
            managed: Some(keys(managed)),
            ..Default::default()
        }
    }

    #[test]
    fn new_label_is_claimed_and_applied() {
        let plan = unit(&[("env", "prod")], &[], &[]).plan().unwrap();
        assert_eq!(plan.changed, Changes::from([("env".into(), Some("prod".into()))]));
        assert_eq!(plan.updated_managed, Some(keys(&["env"])));
    }

    #[test]
    fn removed_desired_label_is_deleted_without_ownership_change() {
        let plan = unit(&[], &[("role", "dev")], &["role"]).plan().unwrap();
        assert_eq!(plan.changed, Changes::from([("role".into(), None)]));
        assert_eq!(plan.updated_managed, None);
    }

    #[test]
    fn unmanaged_existing_label_conflicts() {
        let issues = unit(&[("env", "prod")], &[("env", "staging")], &[]).plan().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].to_string(), "Label conflict: desired env=prod vs current env=staging");
    }

    #[test]
    fn unmanaged_label_conflicts_even_with_equal_value() {
        let issues = unit(&[("env", "prod")], &[("env", "prod")], &[]).plan().unwrap_err();
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn drift_on_owned_key_is_corrected() {
        let plan = unit(&[("env", "prod")], &[("env", "dev")], &["env"]).plan().unwrap();
        assert_eq!(plan.changed, Changes::from([("env".into(), Some("prod".into()))]));
        assert_eq!(plan.updated_managed, None);
    }

    #[test]
    fn stale_managed_key_is_released() {
        let plan = unit(&[("env", "prod")], &[("env", "prod")], &["env", "gone"]).plan().unwrap();
        assert!(plan.changed.is_empty());
        assert_eq!(plan.updated_managed, Some(keys(&["env"])));
    }

    #[test]
    fn managed_key_still_desired_but_missing_live_is_reapplied() {
        let plan = unit(&[("env", "prod")], &[], &["env"]).plan().unwrap();
        assert_eq!(plan.changed, Changes::from([("env".into(), Some("prod".into()))]));
        assert_eq!(plan.updated_managed, None);
    }

    #[test]
    fn unrelated_live_labels_are_left_alone() {
        let plan = unit(&[("env", "prod")], &[("env", "prod"), ("owner", "someone")], &["env"]).plan().unwrap();
        assert!(plan.changed.is_empty());
        assert!(plan.updated_managed.is_none());
    }

    #[test]
    fn reconcile_skips_units_with_issues_and_clears_on_conflict() {
        let inv = LabelInventory::new();
        let ok = NamespaceRef::new("c1", "ok");
        let bad = NamespaceRef::new("c1", "bad");
        let invalid = NamespaceRef::new("c1", "invalid");

        inv.set_desired(&ok, labels(&[("env", "prod")]));
        inv.set_current(&ok, Labels::new());
        inv.set_desired(&bad, labels(&[("env", "prod"), ("tier", "web")]));
        inv.set_current(&bad, labels(&[("env", "staging")]));
        inv.set_desired(&invalid, labels(&[("env", "prod")]));
        inv.add_issue(&invalid, LabelIssue::validation("broken"));

        let stats = inv.reconcile();
        assert_eq!(stats, ReconcileStats { units: 3, changed: 1, ownership_updates: 1, skipped: 1, conflicted: 1 });

        let bad_unit = inv.unit(&bad).unwrap();
        assert!(bad_unit.changed.is_empty());
        assert!(bad_unit.updated_managed.is_none());
        assert_eq!(inv.issues(&bad).len(), 1);

        assert!(inv.unit(&invalid).unwrap().changed.is_empty());
        assert_eq!(inv.iter_errors().len(), 2);
        assert!(inv.has_any_error());
    }

    #[test]
    fn state_key_format() {
        assert_eq!(NamespaceRef::new("prod-1", "billing").state_key(), "prod-1/billing-managed-labels");
    }

    #[test]
    fn delete_drops_unit_but_keeps_issues() {
        let inv = LabelInventory::new();
        let ns = NamespaceRef::new("c", "n");
        inv.set_desired(&ns, labels(&[("a", "b")]));
        inv.add_issue(&ns, LabelIssue::validation("x"));
        inv.delete(&ns);
        assert!(inv.unit(&ns).is_none());
        assert!(inv.has_issues(&ns));
    }

    #[test]
    fn unobserved_unit_is_not_planned() {
        let inv = LabelInventory::new();
        let fresh = NamespaceRef::new("c1", "fresh");
        let owned = NamespaceRef::new("c1", "owned");
        inv.set_desired(&fresh, labels(&[("env", "prod")]));
        inv.set_desired(&owned, Labels::new());
        inv.set_managed(&owned, keys(&["role"]));

        let stats = inv.reconcile();
        assert_eq!(stats.skipped, 2);
        for ns in [&fresh, &owned] {
            let u = inv.unit(ns).unwrap();
            assert!(u.changed.is_empty(), "unit={}", ns);
            assert!(u.updated_managed.is_none(), "unit={}", ns);
        }
        assert!(!inv.has_any_error());
    }

    #[test]
    fn concurrent_writers_land_every_view() {
        let inv = std::sync::Arc::new(LabelInventory::new());
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let inv = std::sync::Arc::clone(&inv);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let ns = NamespaceRef::new(format!("c{}", w % 2), format!("ns-{}-{}", w, i));
                        inv.set_desired(&ns, labels(&[("env", "prod")]));
                        inv.set_managed(&ns, keys(&["env"]));
                        inv.set_current(&ns, labels(&[("env", "dev")]));
                        if i % 10 == 0 {
                            inv.add_issue(&ns, LabelIssue::validation("flagged"));
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(inv.len(), 400);
        for (ns, u) in inv.snapshot() {
            assert_eq!(u.desired, Some(labels(&[("env", "prod")])), "unit={}", ns);
            assert_eq!(u.managed, Some(keys(&["env"])), "unit={}", ns);
            assert_eq!(u.current, Some(labels(&[("env", "dev")])), "unit={}", ns);
        }
        assert_eq!(inv.iter_errors().len(), 40);
        assert!(inv.iter_errors().iter().all(|(_, v)| v.len() == 1));

        let stats = inv.reconcile();
        assert_eq!((stats.changed, stats.skipped), (360, 40));
    }
}
