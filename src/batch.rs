//! Per-domain outcomes and the batch-level verdict.

use crate::error::VmsError;
use crate::operation::{Completion, OperationKind};

#[derive(Debug)]
pub enum Outcome {
    Succeeded(Completion),
    Failed(VmsError),
    Skipped(VmsError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Succeeded(_) => "succeeded",
            Outcome::Failed(_) => "failed",
            Outcome::Skipped(_) => "skipped",
        }
    }

    /// Human-readable detail: what was done, or why it was not.
    pub fn detail(&self) -> String {
        match self {
            Outcome::Succeeded(Completion::Applied(what) | Completion::NoOp(what)) => what.clone(),
            Outcome::Failed(e) | Outcome::Skipped(e) => e.to_string(),
        }
    }
}

impl From<Result<Completion, VmsError>> for Outcome {
    fn from(result: Result<Completion, VmsError>) -> Self {
        match result {
            Ok(done) => Outcome::Succeeded(done),
            Err(VmsError::Cancelled) => Outcome::Skipped(VmsError::Cancelled),
            Err(e) => Outcome::Failed(e),
        }
    }
}

#[derive(Debug)]
pub struct OperationOutcome {
    pub vm: String,
    pub outcome: Outcome,
}

impl OperationOutcome {
    pub fn new(vm: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            vm: vm.into(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Outcomes of one batch, in the order the domains were selected.
#[derive(Debug)]
pub struct BatchResult {
    operation: OperationKind,
    outcomes: Vec<OperationOutcome>,
}

impl BatchResult {
    pub fn operation(&self) -> &OperationKind {
        &self.operation
    }

    pub fn outcomes(&self) -> &[OperationOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// True iff every outcome succeeded. An empty batch succeeds.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_success())
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for o in &self.outcomes {
            match o.outcome {
                Outcome::Succeeded(_) => summary.succeeded += 1,
                Outcome::Failed(_) => summary.failed += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn exit_status(&self) -> i32 {
        exit_status(self)
    }
}

pub fn aggregate(operation: OperationKind, outcomes: Vec<OperationOutcome>) -> BatchResult {
    BatchResult {
        operation,
        outcomes,
    }
}

/// Process exit code for a batch: 0 on full success, 1 otherwise.
pub fn exit_status(result: &BatchResult) -> i32 {
    if result.succeeded() { 0 } else { 1 }
}
