//! Passes that fill the inventory: desired (from configuration), managed
//! (from the state store) and current (from the clusters).

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use keel_core::ShardPlanner;
use keel_persist::StateStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::{validate_labels, LabelInventory, LabelIssue, LabelKeys, Labels, NamespaceRef};

/// A namespace as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredNamespace {
    pub cluster: String,
    pub name: String,
    #[serde(default)]
    pub labels: Option<Labels>,
    /// Namespace is being removed; nothing to reconcile.
    #[serde(default)]
    pub delete: bool,
}

impl DesiredNamespace {
    pub fn unit(&self) -> NamespaceRef { NamespaceRef::new(&self.cluster, &self.name) }
}

/// A namespace as observed on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedNamespace {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
}

/// Observed-state source.
#[async_trait]
pub trait NamespaceSource: Send + Sync {
    /// Clusters this source can reach and is configured to handle.
    fn clusters(&self) -> Vec<String>;

    /// All namespaces of `cluster`; `Ok(None)` when the cluster is unreachable.
    async fn namespaces(&self, cluster: &str) -> Result<Option<Vec<ObservedNamespace>>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectStats {
    pub accepted: usize,
    pub deleted: usize,
    pub unlabelled: usize,
    pub other_shard: usize,
    pub unhandled_cluster: usize,
    pub invalid: usize,
    pub duplicates_dropped: usize,
}

/// Register desired labels. Later definitions of an already declared unit
/// with different labels cause that unit to be dropped once the whole list
/// has been read.
pub fn collect_desired(
    inventory: &LabelInventory,
    namespaces: &[DesiredNamespace],
    handled_clusters: &BTreeSet<String>,
    shard: &ShardPlanner,
) -> CollectStats {
    let mut stats = CollectStats::default();
    let mut to_drop: BTreeSet<NamespaceRef> = BTreeSet::new();

    for ns in namespaces {
        if ns.delete {
            stats.deleted += 1;
            continue;
        }
        let Some(labels) = ns.labels.as_ref() else {
            stats.unlabelled += 1;
            continue;
        };
        let unit = ns.unit();
        if !shard.owns(&unit.to_string()) {
            stats.other_shard += 1;
            continue;
        }
        if !handled_clusters.contains(&ns.cluster) {
            debug!(cluster = %ns.cluster, ns = %ns.name, "cluster not handled; skipping");
            stats.unhandled_cluster += 1;
            continue;
        }

        for err in validate_labels(labels) {
            inventory.add_issue(&unit, LabelIssue::validation(err));
        }
        if inventory.has_issues(&unit) {
            stats.invalid += 1;
            continue;
        }

        match inventory.desired(&unit) {
            Some(existing) if &existing == labels => {
                debug!(unit = %unit, "identical namespace definition repeated");
            }
            Some(_) => {
                to_drop.insert(unit);
            }
            None => {
                inventory.set_desired(&unit, labels.clone());
                stats.accepted += 1;
            }
        }
    }

    for unit in to_drop {
        warn!(unit = %unit, "found several conflicting namespace definitions; ignoring");
        inventory.delete(&unit);
        stats.accepted = stats.accepted.saturating_sub(1);
        stats.duplicates_dropped += 1;
    }
    stats
}

/// Load previously managed label keys for every unit with a desired view.
/// Returns the number of units that had stored state.
pub fn collect_managed(inventory: &LabelInventory, store: &dyn StateStore) -> Result<usize> {
    let keys = store.list_keys()?;
    let mut loaded = 0usize;
    for (unit, u) in inventory.snapshot() {
        if u.desired.is_none() {
            continue;
        }
        let key = unit.state_key();
        if !keys.contains(&key) {
            continue;
        }
        let Some(value) = store.get(&key)? else { continue };
        match serde_json::from_value::<LabelKeys>(value) {
            Ok(managed) => {
                inventory.set_managed(&unit, managed);
                loaded += 1;
            }
            Err(e) => {
                inventory.add_issue(&unit, LabelIssue::validation(format!("Malformed managed label state under {}: {}", key, e)));
            }
        }
    }
    Ok(loaded)
}

/// Fetch live labels from every handled cluster, at most `pool_size` at a
/// time. Only namespaces already declared desired are recorded; unreachable
/// clusters and source errors leave their units without current data.
pub async fn collect_current(inventory: &LabelInventory, source: Arc<dyn NamespaceSource>, pool_size: usize) -> usize {
    let sem = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut handles = Vec::new();
    for cluster in source.clusters() {
        let sem = Arc::clone(&sem);
        let source = Arc::clone(&source);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let res = source.namespaces(&cluster).await;
            (cluster, res)
        }));
    }

    let mut recorded = 0usize;
    for h in handles {
        let (cluster, res) = match h.await {
            Ok(out) => out,
            Err(e) => {
                error!(error = %e, "namespace lookup task failed");
                continue;
            }
        };
        let list = match res {
            Ok(Some(list)) => list,
            Ok(None) => {
                debug!(cluster = %cluster, "cluster unreachable; no current labels");
                continue;
            }
            Err(e) => {
                error!(cluster = %cluster, error = %e, "namespace lookup failed; cluster skipped");
                continue;
            }
        };
        for observed in list {
            let unit = NamespaceRef::new(&cluster, &observed.name);
            if !inventory.has_desired(&unit) {
                continue;
            }
            inventory.set_current(&unit, observed.labels);
            recorded += 1;
        }
    }
    recorded
}
