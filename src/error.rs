//! Typed errors returned by the identify pipeline, tagged with the stage that failed.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdentifyError>;

/// Store round trip or wait that an identify request was performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LockIdentity,
    FindCandidates,
    LockClusters,
    MaterializeGroup,
    InsertContact,
    RepairCluster,
    BuildSummary,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::LockIdentity => "lock_identity",
            Stage::FindCandidates => "find_candidates",
            Stage::LockClusters => "lock_clusters",
            Stage::MaterializeGroup => "materialize_group",
            Stage::InsertContact => "insert_contact",
            Stage::RepairCluster => "repair_cluster",
            Stage::BuildSummary => "build_summary",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("store error during {stage}: {message}")]
    Store { stage: Stage, message: String },

    #[error("deadline exceeded during {stage}")]
    Timeout { stage: Stage },

    /// The worker running the request panicked or was cancelled.
    #[error("identify worker failed: {0}")]
    Worker(String),
}

impl IdentifyError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn store(stage: Stage, err: anyhow::Error) -> Self {
        Self::Store {
            stage,
            message: format!("{err:#}"),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Attach a stage to a store result.
pub(crate) trait StageContext<T> {
    fn at(self, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn at(self, stage: Stage) -> Result<T> {
        self.map_err(|err| IdentifyError::store(stage, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_keeps_message() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = err.at(Stage::InsertContact).unwrap_err();
        assert_eq!(
            err.to_string(),
            "store error during insert_contact: connection reset"
        );
        assert!(!err.is_validation());
    }
}
