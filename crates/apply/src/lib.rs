//! Keel apply: turns a reconciled inventory into side effects.
//!
//! Ownership writes go to the state store first, synchronously. Label patches
//! follow, one per unit, on a bounded pool of tokio tasks. A crash between the
//! two leaves labels under-applied, which the next run picks up.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use keel_core::ShardPlanner;
use keel_inventory::{
    collect_current, collect_desired, collect_managed, Changes, DesiredNamespace, LabelInventory, LabelKeys,
    NamespaceRef, NamespaceSource,
};
use keel_persist::StateStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

pub mod membership;

pub const DEFAULT_THREAD_POOL_SIZE: usize = 10;

/// Label write port. `None` values remove the label; labels not named in
/// `changes` must be left untouched.
#[async_trait]
pub trait LabelSink: Send + Sync {
    async fn patch_labels(&self, unit: &NamespaceRef, changes: &Changes) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("collecting label state: {0}")]
    Collect(#[source] anyhow::Error),
    #[error("persisting managed labels for {unit}: {source}")]
    Persist {
        unit: NamespaceRef,
        #[source]
        source: anyhow::Error,
    },
    #[error("patching labels on {unit}: {source}")]
    Patch {
        unit: NamespaceRef,
        #[source]
        source: anyhow::Error,
    },
    #[error("label patch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Unit errors of a run, one `"{cluster}/{namespace}: {error}"` line each.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NamespaceLabelError(pub String);

impl NamespaceLabelError {
    pub fn from_lines(lines: &[String]) -> Self { Self(lines.join("\n")) }

    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ { self.0.lines() }
}

/// How unit errors are reported once a run completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Return a [`NamespaceLabelError`] to the caller.
    Raise,
    /// Log every line and exit the process with status 1.
    #[default]
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub thread_pool_size: usize,
    pub error_mode: ErrorMode,
    pub shard: ShardPlanner,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self { thread_pool_size: DEFAULT_THREAD_POOL_SIZE, error_mode: ErrorMode::default(), shard: ShardPlanner::single() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RealizeStats {
    pub state_writes: usize,
    pub patched: usize,
    pub failed: usize,
}

/// Persist ownership changes, then patch labels of every unit without issues.
///
/// In dry-run mode nothing is written; the planned patches are logged.
/// A failing patch does not stop the others: all tasks are awaited and the
/// first failure is returned.
pub async fn realize(
    inventory: &LabelInventory,
    state: &dyn StateStore,
    sink: Arc<dyn LabelSink>,
    dry_run: bool,
    pool_size: usize,
) -> Result<RealizeStats, ApplyError> {
    let units: Vec<_> = inventory.snapshot().into_iter().filter(|(ns, _)| !inventory.has_issues(ns)).collect();
    let mut stats = RealizeStats::default();

    for (ns, unit) in &units {
        let Some(updated) = unit.updated_managed.as_ref() else { continue };
        if dry_run {
            info!(unit = %ns, keys = ?updated, "[dry-run] Updating managed labels");
            continue;
        }
        persist_managed(state, ns, updated)?;
        counter!("labels_state_write_total", 1u64);
        debug!(unit = %ns, keys = ?updated, "managed labels persisted");
        stats.state_writes += 1;
    }

    let sem = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut handles = Vec::new();
    for (ns, unit) in units {
        if unit.changed.is_empty() {
            continue;
        }
        let prefix = if dry_run { "[dry-run] " } else { "" };
        info!("{}Updating labels on {}: {:?}", prefix, ns, unit.changed);
        if dry_run {
            continue;
        }
        let sem = Arc::clone(&sem);
        let sink = Arc::clone(&sink);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let t0 = Instant::now();
            let res = sink.patch_labels(&ns, &unit.changed).await;
            histogram!("labels_patch_ms", t0.elapsed().as_secs_f64() * 1000.0);
            match res {
                Ok(()) => {
                    counter!("labels_patch_total", 1u64);
                    Ok(())
                }
                Err(source) => {
                    counter!("labels_patch_err", 1u64);
                    error!(unit = %ns, error = %source, "label patch failed");
                    Err(ApplyError::Patch { unit: ns, source })
                }
            }
        }));
    }

    let mut first_err = None;
    for h in handles {
        match h.await.map_err(ApplyError::from).and_then(|r| r) {
            Ok(()) => stats.patched += 1,
            Err(e) => {
                stats.failed += 1;
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

fn persist_managed(state: &dyn StateStore, ns: &NamespaceRef, keys: &LabelKeys) -> Result<(), ApplyError> {
    let value = serde_json::to_value(keys).map_err(|e| ApplyError::Persist { unit: ns.clone(), source: e.into() })?;
    state.set(&ns.state_key(), &value, true).map_err(|source| ApplyError::Persist { unit: ns.clone(), source })
}

/// Per-unit result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    #[serde(flatten)]
    pub unit: NamespaceRef,
    pub changed: Changes,
    pub updated_managed: Option<LabelKeys>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub dry_run: bool,
    pub units: Vec<UnitReport>,
}

impl ReconcileOutcome {
    /// Report for every unit in the inventory and every unit with issues.
    pub fn from_inventory(inventory: &LabelInventory, dry_run: bool) -> Self {
        let errors = inventory.iter_errors();
        let mut refs: BTreeSet<NamespaceRef> = inventory.unit_refs().into_iter().collect();
        refs.extend(errors.iter().map(|(ns, _)| ns.clone()));

        let units = refs
            .into_iter()
            .map(|ns| {
                let unit = inventory.unit(&ns).unwrap_or_default();
                let errors = errors
                    .iter()
                    .find(|(e, _)| *e == ns)
                    .map(|(_, issues)| issues.iter().map(ToString::to_string).collect())
                    .unwrap_or_default();
                UnitReport { unit: ns, changed: unit.changed, updated_managed: unit.updated_managed, errors }
            })
            .collect();
        Self { dry_run, units }
    }

    pub fn has_errors(&self) -> bool { self.units.iter().any(|u| !u.errors.is_empty()) }

    pub fn error_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        for u in &self.units {
            for e in &u.errors {
                out.push(format!("{}/{}: {}", u.unit.cluster, u.unit.namespace, e));
            }
        }
        out
    }

    pub fn into_result(self) -> Result<Self, NamespaceLabelError> {
        let lines = self.error_lines();
        if lines.is_empty() {
            Ok(self)
        } else {
            Err(NamespaceLabelError::from_lines(&lines))
        }
    }
}

/// One full label pass over desired namespaces: collect, reconcile, realize.
pub struct LabelReconciler {
    settings: ReconcileSettings,
    desired: Vec<DesiredNamespace>,
    source: Arc<dyn NamespaceSource>,
    state: Arc<dyn StateStore>,
    sink: Arc<dyn LabelSink>,
}

impl LabelReconciler {
    pub fn new(
        settings: ReconcileSettings,
        desired: Vec<DesiredNamespace>,
        source: Arc<dyn NamespaceSource>,
        state: Arc<dyn StateStore>,
        sink: Arc<dyn LabelSink>,
    ) -> Self {
        Self { settings, desired, source, state, sink }
    }

    pub fn settings(&self) -> &ReconcileSettings { &self.settings }

    /// A fresh inventory is built on every call; nothing carries over.
    pub async fn reconcile(&self, dry_run: bool) -> Result<ReconcileOutcome, ApplyError> {
        let t0 = Instant::now();
        let pool = self.settings.thread_pool_size.max(1);
        let inventory = LabelInventory::new();

        let handled: BTreeSet<String> = self.source.clusters().into_iter().collect();
        let desired = collect_desired(&inventory, &self.desired, &handled, &self.settings.shard);
        debug!(stats = ?desired, "desired labels collected");

        let loaded = collect_managed(&inventory, self.state.as_ref()).map_err(ApplyError::Collect)?;
        let observed = collect_current(&inventory, Arc::clone(&self.source), pool).await;
        debug!(managed = loaded, current = observed, "state collected");

        let stats = inventory.reconcile();
        info!(
            units = stats.units,
            changed = stats.changed,
            ownership = stats.ownership_updates,
            conflicted = stats.conflicted,
            skipped = stats.skipped,
            "labels reconciled"
        );

        let applied = realize(&inventory, self.state.as_ref(), Arc::clone(&self.sink), dry_run, pool).await?;
        info!(
            dry_run,
            writes = applied.state_writes,
            patched = applied.patched,
            took_ms = %t0.elapsed().as_millis(),
            "labels applied"
        );
        Ok(ReconcileOutcome::from_inventory(&inventory, dry_run))
    }
}
