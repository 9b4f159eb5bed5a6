//! Organization and team membership plans.
//!
//! Current and desired membership are loaded from YAML snapshots into
//! [`AggregatedList`]s keyed by `{service, org[, team]}` and diffed. The plan
//! registers one action per `(category, service)` on a [`DiffRunner`]; org
//! creation and deletion are guarded since orgs are never managed here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use keel_core::{field_is, AggregatedDiff, AggregatedList, DiffCategory, DiffSummary, DiffRunner, ResourceKey, RunnerError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const SERVICE_ORG: &str = "github-org";
pub const SERVICE_TEAM: &str = "github-org-team";

/// Membership write port.
pub trait MembershipSink: Send + Sync {
    fn create_team(&self, org: &str, team: &str) -> Result<()>;
    fn add_to_team(&self, org: &str, team: &str, member: &str) -> Result<()>;
    fn del_from_team(&self, org: &str, team: &str, member: &str) -> Result<()>;
    fn add_to_org(&self, org: &str, member: &str) -> Result<()>;
    fn del_from_org(&self, org: &str, member: &str) -> Result<()>;
}

/// Sink that only logs; used when no provider client is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl MembershipSink for LoggingSink {
    fn create_team(&self, org: &str, team: &str) -> Result<()> {
        info!(org, team, "create team");
        Ok(())
    }
    fn add_to_team(&self, org: &str, team: &str, member: &str) -> Result<()> {
        info!(org, team, member, "add member to team");
        Ok(())
    }
    fn del_from_team(&self, org: &str, team: &str, member: &str) -> Result<()> {
        info!(org, team, member, "remove member from team");
        Ok(())
    }
    fn add_to_org(&self, org: &str, member: &str) -> Result<()> {
        info!(org, member, "add member to org");
        Ok(())
    }
    fn del_from_org(&self, org: &str, member: &str) -> Result<()> {
        info!(org, member, "remove member from org");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("current orgs ({current:?}) don't match desired orgs ({desired:?})")]
    OrgMismatch { current: BTreeSet<String>, desired: BTreeSet<String> },
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotRecord {
    key: BTreeMap<String, String>,
    #[serde(default)]
    members: Vec<String>,
}

/// Parse a snapshot: a YAML list of `{key: {field: value}, members: [..]}`.
/// Member names are lower-cased.
pub fn load_snapshot(yaml: &str) -> Result<AggregatedList> {
    let records: Vec<SnapshotRecord> = serde_yaml::from_str(yaml).context("parsing membership snapshot")?;
    let mut list = AggregatedList::new();
    for r in records {
        list.add(ResourceKey::from(r.key), r.members.into_iter().map(|m| m.to_lowercase()));
    }
    Ok(list)
}

pub fn org_names(list: &AggregatedList) -> BTreeSet<String> {
    list.dump().filter_map(|(k, _)| k.get("org").map(str::to_string)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipReport {
    pub dry_run: bool,
    pub summary: DiffSummary,
    pub actions: usize,
}

/// Diff `current` against `desired` and run every registered action.
///
/// Fails before any action when the two snapshots cover different orgs.
pub fn plan_membership(
    current: &AggregatedList,
    desired: &AggregatedList,
    sink: Arc<dyn MembershipSink>,
    dry_run: bool,
) -> Result<MembershipReport, MembershipError> {
    let (cur_orgs, des_orgs) = (org_names(current), org_names(desired));
    if cur_orgs != des_orgs {
        return Err(MembershipError::OrgMismatch { current: cur_orgs, desired: des_orgs });
    }

    let diff = AggregatedDiff::compute(current, desired);
    let mut runner = DiffRunner::new(&diff);
    let actions = MembershipActions { sink, dry_run };

    runner.forbid(DiffCategory::Insert, "Cannot create a Github Org", field_is("service", SERVICE_ORG));
    runner.register(DiffCategory::Insert, actions.create_team(), field_is("service", SERVICE_TEAM));
    runner.register(DiffCategory::Insert, actions.add_to_team(), field_is("service", SERVICE_TEAM));
    runner.forbid(DiffCategory::Delete, "Cannot delete a Github Org", field_is("service", SERVICE_ORG));
    runner.register(DiffCategory::Delete, actions.del_from_team(), field_is("service", SERVICE_TEAM));
    runner.register(DiffCategory::UpdateInsert, actions.add_to_org(), field_is("service", SERVICE_ORG));
    runner.register(DiffCategory::UpdateInsert, actions.add_to_team(), field_is("service", SERVICE_TEAM));
    runner.register(DiffCategory::UpdateDelete, actions.del_from_org(), field_is("service", SERVICE_ORG));
    runner.register(DiffCategory::UpdateDelete, actions.del_from_team(), field_is("service", SERVICE_TEAM));

    let stats = runner.run()?;
    Ok(MembershipReport { dry_run, summary: diff.summary(), actions: stats.invoked })
}

fn field<'k>(key: &'k ResourceKey, name: &str) -> Result<&'k str> {
    key.get(name).ok_or_else(|| anyhow!("missing `{}` in {}", name, key))
}

/// Builds runner actions bound to one sink. In dry-run mode actions log the
/// planned call and never touch the sink.
struct MembershipActions {
    sink: Arc<dyn MembershipSink>,
    dry_run: bool,
}

impl MembershipActions {
    fn create_team(&self) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> Result<()> + Send + Sync + 'static {
        let (sink, dry_run) = (Arc::clone(&self.sink), self.dry_run);
        move |key, _members| {
            let (org, team) = (field(key, "org")?, field(key, "team")?);
            info!("{}[create_team, {}, {}]", prefix(dry_run), org, team);
            if dry_run { return Ok(()); }
            sink.create_team(org, team)
        }
    }

    fn add_to_team(&self) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> Result<()> + Send + Sync + 'static {
        let (sink, dry_run) = (Arc::clone(&self.sink), self.dry_run);
        move |key, members| {
            let (org, team) = (field(key, "org")?, field(key, "team")?);
            for m in members {
                info!("{}[add_to_team, {}, {}, {}]", prefix(dry_run), m, org, team);
                if !dry_run { sink.add_to_team(org, team, m)?; }
            }
            Ok(())
        }
    }

    fn del_from_team(&self) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> Result<()> + Send + Sync + 'static {
        let (sink, dry_run) = (Arc::clone(&self.sink), self.dry_run);
        move |key, members| {
            let (org, team) = (field(key, "org")?, field(key, "team")?);
            for m in members {
                info!("{}[del_from_team, {}, {}, {}]", prefix(dry_run), m, org, team);
                if !dry_run { sink.del_from_team(org, team, m)?; }
            }
            Ok(())
        }
    }

    fn add_to_org(&self) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> Result<()> + Send + Sync + 'static {
        let (sink, dry_run) = (Arc::clone(&self.sink), self.dry_run);
        move |key, members| {
            let org = field(key, "org")?;
            for m in members {
                info!("{}[add_to_org, {}, {}]", prefix(dry_run), m, org);
                if !dry_run { sink.add_to_org(org, m)?; }
            }
            Ok(())
        }
    }

    fn del_from_org(&self) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> Result<()> + Send + Sync + 'static {
        let (sink, dry_run) = (Arc::clone(&self.sink), self.dry_run);
        move |key, members| {
            let org = field(key, "org")?;
            for m in members {
                info!("{}[del_from_org, {}, {}]", prefix(dry_run), m, org);
                if !dry_run { sink.del_from_org(org, m)?; }
            }
            Ok(())
        }
    }
}

fn prefix(dry_run: bool) -> &'static str { if dry_run { "[dry-run] " } else { "" } }
