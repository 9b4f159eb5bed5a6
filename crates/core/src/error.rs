use thiserror::Error;

use crate::{DiffCategory, ResourceKey};

/// Errors that abort a `DiffRunner::run`.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A registered action returned an error; the run stops at the first one.
    #[error("{category} action failed for {key}: {source}")]
    Handler {
        category: DiffCategory,
        key: ResourceKey,
        #[source]
        source: anyhow::Error,
    },

    /// An entry matched a guard registered with `DiffRunner::forbid`.
    #[error("contract violation on {category} {key}: {message}")]
    Forbidden {
        category: DiffCategory,
        key: ResourceKey,
        message: String,
    },
}

impl RunnerError {
    pub fn is_contract_violation(&self) -> bool { matches!(self, RunnerError::Forbidden { .. }) }
}
