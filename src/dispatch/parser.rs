//! Batch response parsing
//!
//! Reconstructs (parent, child) pairs from a batch response strictly by slot.

use serde::Serialize;

use super::planner::{BatchGroup, OpRole};
use crate::platform::{BatchResponse, PlatformError};

/// What happened to one copy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairOutcome {
    Created {
        copy_number: u32,
        parent_id: String,
        child_id: String,
    },
    /// Parent exists without its child
    Orphan {
        copy_number: u32,
        parent_id: String,
        error: PlatformError,
    },
    /// Parent was not created
    Failed {
        copy_number: u32,
        error: PlatformError,
    },
}

impl PairOutcome {
    pub fn copy_number(&self) -> u32 {
        match self {
            PairOutcome::Created { copy_number, .. }
            | PairOutcome::Orphan { copy_number, .. }
            | PairOutcome::Failed { copy_number, .. } => *copy_number,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, PairOutcome::Created { .. })
    }
}

/// Every pair of `group` failed with the same error
pub fn fail_all(group: &BatchGroup, error: &PlatformError) -> Vec<PairOutcome> {
    (0..group.pair_count())
        .map(|pair| PairOutcome::Failed {
            copy_number: group.copy_number(pair),
            error: error.clone(),
        })
        .collect()
}

/// Pair up a batch response with the group that produced it
pub fn parse_group(
    group: &BatchGroup,
    responses: &[Option<BatchResponse>],
) -> Result<Vec<PairOutcome>, PlatformError> {
    if responses.len() != group.len() {
        return Err(PlatformError::Malformed(format!(
            "batch of {} operations answered with {} entries",
            group.len(),
            responses.len()
        )));
    }

    let outcomes = (0..group.pair_count())
        .map(|pair| {
            let copy_number = group.copy_number(pair);
            let parent = entry_result(&responses[group.slot(pair, OpRole::Parent)]);
            let child = entry_result(&responses[group.slot(pair, OpRole::Child)]);

            match (parent, child) {
                (Ok(parent_id), Ok(child_id)) => PairOutcome::Created {
                    copy_number,
                    parent_id,
                    child_id,
                },
                (Ok(parent_id), Err(error)) => PairOutcome::Orphan {
                    copy_number,
                    parent_id,
                    error,
                },
                (Err(error), _) => PairOutcome::Failed { copy_number, error },
            }
        })
        .collect();
    Ok(outcomes)
}

fn entry_result(entry: &Option<BatchResponse>) -> Result<String, PlatformError> {
    match entry {
        None => Err(PlatformError::NotExecuted),
        Some(response) => response
            .created_id()
            .map(str::to_string)
            .ok_or_else(|| response.error()),
    }
}
