//! Per-run records: ids, snapshots and descriptors.

mod descriptor;
mod id;
mod snapshot;

pub use descriptor::ExecutionDescriptor;
pub use id::{ExecutionId, ExecutionToken, ParseExecutionIdError};
pub use snapshot::{ExecutionSnapshot, LanguageKind};

/// Parameters for requesting a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteParams {
    /// Run as part of host startup. Startup runs get `startup` tokens
    /// instead of sequential indices.
    pub startup: bool,
}

impl ExecuteParams {
    /// Parameters for a startup run.
    #[must_use]
    pub fn startup() -> Self {
        Self { startup: true }
    }
}
