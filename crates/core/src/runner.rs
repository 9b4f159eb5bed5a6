//! DiffRunner: dispatches diff entries to registered actions.
//!
//! Registrations are `(category, predicate, handler)` triples kept in
//! registration order. `run()` walks the diff category by category
//! (insert, delete, update-insert, update-delete) and, for each entry,
//! invokes every registration of that category whose predicate accepts the
//! entry's key. The first failing action aborts the run.

use std::collections::BTreeSet;

use tracing::debug;

use crate::{AggregatedDiff, DiffCategory, ResourceKey, RunnerError};

pub type Predicate = Box<dyn Fn(&ResourceKey) -> bool + Send + Sync>;
pub type Action = Box<dyn Fn(&ResourceKey, &BTreeSet<String>) -> anyhow::Result<()> + Send + Sync>;

enum Handler {
    Action(Action),
    Forbidden(String),
}

struct Registration {
    category: DiffCategory,
    predicate: Predicate,
    handler: Handler,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Number of action invocations.
    pub invoked: usize,
    /// Entries no registration matched.
    pub unmatched: usize,
}

pub struct DiffRunner<'a> {
    diff: &'a AggregatedDiff,
    registrations: Vec<Registration>,
}

impl<'a> DiffRunner<'a> {
    pub fn new(diff: &'a AggregatedDiff) -> Self {
        Self { diff, registrations: Vec::new() }
    }

    pub fn register<A, P>(&mut self, category: DiffCategory, action: A, predicate: P) -> &mut Self
    where
        A: Fn(&ResourceKey, &BTreeSet<String>) -> anyhow::Result<()> + Send + Sync + 'static,
        P: Fn(&ResourceKey) -> bool + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            category,
            predicate: Box::new(predicate),
            handler: Handler::Action(Box::new(action)),
        });
        self
    }

    /// Register a guard: any entry of `category` matching `predicate` is a
    /// contract violation and aborts the run.
    pub fn forbid<P>(&mut self, category: DiffCategory, message: impl Into<String>, predicate: P) -> &mut Self
    where
        P: Fn(&ResourceKey) -> bool + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            category,
            predicate: Box::new(predicate),
            handler: Handler::Forbidden(message.into()),
        });
        self
    }

    pub fn len(&self) -> usize { self.registrations.len() }
    pub fn is_empty(&self) -> bool { self.registrations.is_empty() }

    pub fn run(&self) -> Result<RunStats, RunnerError> {
        let mut stats = RunStats::default();
        for category in DiffCategory::ALL {
            for entry in self.diff.entries(category) {
                let mut matched = false;
                for reg in self.registrations.iter().filter(|r| r.category == category) {
                    if !(reg.predicate)(&entry.key) {
                        continue;
                    }
                    matched = true;
                    match &reg.handler {
                        Handler::Forbidden(message) => {
                            return Err(RunnerError::Forbidden {
                                category,
                                key: entry.key.clone(),
                                message: message.clone(),
                            });
                        }
                        Handler::Action(action) => {
                            stats.invoked += 1;
                            action(&entry.key, &entry.items).map_err(|source| RunnerError::Handler {
                                category,
                                key: entry.key.clone(),
                                source,
                            })?;
                        }
                    }
                }
                if !matched {
                    debug!(%category, key = %entry.key, "no handler registered for diff entry");
                    stats.unmatched += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// Predicate matching keys whose `field` equals `value`.
pub fn field_is(field: &'static str, value: &'static str) -> impl Fn(&ResourceKey) -> bool + Send + Sync + 'static {
    move |key| key.get(field) == Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AggregatedList;
    use std::sync::{Arc, Mutex};

    fn org(name: &str) -> ResourceKey {
        ResourceKey::new().with("service", "github-org").with("org", name)
    }

    fn team(org: &str, team: &str) -> ResourceKey {
        ResourceKey::new().with("service", "github-org-team").with("org", org).with("team", team)
    }

    fn sample_diff() -> AggregatedDiff {
        let mut current = AggregatedList::new();
        current.add(org("acme"), ["alice", "bob"]);
        current.add(team("acme", "old"), ["bob"]);
        let mut desired = AggregatedList::new();
        desired.add(org("acme"), ["alice", "carol"]);
        desired.add(team("acme", "new"), ["carol"]);
        current.diff(&desired)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> impl Fn(&ResourceKey, &BTreeSet<String>) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |key, items| {
            let members: Vec<&str> = items.iter().map(String::as_str).collect();
            log.lock().unwrap().push(format!("{label}:{}:{}", key.get("team").or(key.get("org")).unwrap_or(""), members.join("+")));
            Ok(())
        }
    }

    #[test]
    fn runs_categories_in_fixed_order_regardless_of_registration_order() {
        let diff = sample_diff();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runner = DiffRunner::new(&diff);
        runner
            .register(DiffCategory::UpdateDelete, recorder(&log, "del_from_org"), field_is("service", "github-org"))
            .register(DiffCategory::UpdateInsert, recorder(&log, "add_to_org"), field_is("service", "github-org"))
            .register(DiffCategory::Delete, recorder(&log, "del_from_team"), field_is("service", "github-org-team"))
            .register(DiffCategory::Insert, recorder(&log, "create_team"), field_is("service", "github-org-team"));

        let stats = runner.run().unwrap();
        assert_eq!(stats.invoked, 4);
        assert_eq!(stats.unmatched, 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["create_team:new:carol", "del_from_team:old:bob", "add_to_org:acme:carol", "del_from_org:acme:bob"]
        );
    }

    #[test]
    fn all_matching_handlers_run_in_registration_order() {
        let diff = sample_diff();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runner = DiffRunner::new(&diff);
        runner
            .register(DiffCategory::Insert, recorder(&log, "create_team"), field_is("service", "github-org-team"))
            .register(DiffCategory::Insert, recorder(&log, "add_to_team"), field_is("service", "github-org-team"));
        runner.run().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create_team:new:carol", "add_to_team:new:carol"]);
    }

    #[test]
    fn failing_action_aborts_the_run() {
        let diff = sample_diff();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runner = DiffRunner::new(&diff);
        runner
            .register(DiffCategory::Insert, |_, _| Err(anyhow::anyhow!("api down")), |_| true)
            .register(DiffCategory::UpdateInsert, recorder(&log, "add_to_org"), |_| true);

        let err = runner.run().unwrap_err();
        assert!(!err.is_contract_violation());
        assert!(err.to_string().contains("insert action failed"), "err={}", err);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn guard_match_is_a_contract_violation() {
        let mut current = AggregatedList::new();
        current.add(org("acme"), ["alice"]);
        let mut desired = current.clone();
        desired.add(org("initech"), ["bob"]);
        let diff = current.diff(&desired);

        let mut runner = DiffRunner::new(&diff);
        runner.forbid(DiffCategory::Insert, "Cannot create a Github Org", field_is("service", "github-org"));
        let err = runner.run().unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("Cannot create a Github Org"));
    }

    #[test]
    fn unmatched_entries_are_counted_not_failed() {
        let diff = sample_diff();
        let runner = DiffRunner::new(&diff);
        let stats = runner.run().unwrap();
        assert_eq!(stats, RunStats { invoked: 0, unmatched: 4 });
    }
}
