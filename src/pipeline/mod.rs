//! Ordered, rollback-capable execution of infrastructure steps
//!
//! A pipeline runs a list of [`Step`]s strictly in order against a shared
//! per-operation context. When a forward operation fails and rollback is
//! enabled, the compensating operations of every step that already succeeded
//! run in reverse order:
//!
//! ```text
//! forward:     [network] → [role] → [control plane] → [pool a] → FAIL
//! compensate:                                         [pool a] → [control plane] → [role] → [network]
//! ```
//!
//! Compensation is best-effort: a failed undo is recorded and the remaining
//! undos still run. The pipeline never persists anything; it only returns the
//! ledger in a [`PipelineResult`].

mod executor;

pub use executor::PipelineExecutor;

use crate::error::StepError;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One reversible unit of infrastructure work
///
/// `C` is the per-operation context. Steps read the outputs of earlier steps
/// from it and write their own outputs into it, which is why steps never run
/// concurrently within one pipeline.
#[async_trait]
pub trait Step<C: Send>: Send + Sync {
    /// Name used in the ledger and in logs
    fn name(&self) -> &str;

    /// Destructive steps (deletions) are never compensated
    fn destructive(&self) -> bool {
        false
    }

    /// Whether [`Step::compensate`] does anything
    fn has_compensation(&self) -> bool {
        false
    }

    /// Forward operation
    async fn execute(&self, ctx: &mut C) -> Result<(), StepError>;

    /// Compensating operation, a no-op unless overridden
    async fn compensate(&self, _ctx: &mut C) -> Result<(), StepError> {
        Ok(())
    }
}

pub type BoxedStep<C> = Box<dyn Step<C>>;

/// Which operation of a step a ledger entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Forward,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Compensation not run: the step has none or is destructive
    Skipped,
}

/// Ledger entry for one operation of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub step: String,
    pub phase: StepPhase,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn succeeded(step: &str, phase: StepPhase) -> Self {
        Self {
            step: step.to_string(),
            phase,
            outcome: StepOutcome::Succeeded,
            error: None,
        }
    }

    pub fn failed(step: &str, phase: StepPhase, error: &StepError) -> Self {
        Self {
            step: step.to_string(),
            phase,
            outcome: StepOutcome::Failed,
            error: Some(error.to_string()),
        }
    }

    pub fn skipped(step: &str) -> Self {
        Self {
            step: step.to_string(),
            phase: StepPhase::Compensation,
            outcome: StepOutcome::Skipped,
            error: None,
        }
    }

    fn is(&self, phase: StepPhase, outcome: StepOutcome) -> bool {
        self.phase == phase && self.outcome == outcome
    }
}

/// A compensating operation that failed during rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    pub step: String,
    pub cause: String,
}

/// Terminal failure of a pipeline, derived from its ledger
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("step {step} failed: {cause}")]
    StepFailed { step: String, cause: String },

    #[error("step {step} failed: {cause}; rollback failed for {}", describe_failures(.failures))]
    RollbackPartialFailure {
        step: String,
        cause: String,
        failures: Vec<CompensationFailure>,
    },
}

fn describe_failures(failures: &[CompensationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.step, f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ordered per-step outcome ledger of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub records: Vec<StepRecord>,
    /// Whether rollback was invoked
    pub rolled_back: bool,
}

impl PipelineResult {
    /// Result of a run that executed nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no forward operation failed
    pub fn succeeded(&self) -> bool {
        self.failed_step().is_none()
    }

    /// The forward step that stopped the pipeline
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.records
            .iter()
            .find(|r| r.is(StepPhase::Forward, StepOutcome::Failed))
    }

    /// Names of steps whose forward operation succeeded, in execution order
    pub fn completed_steps(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.is(StepPhase::Forward, StepOutcome::Succeeded))
            .map(|r| r.step.as_str())
            .collect()
    }

    /// Whether the named step's forward operation succeeded
    pub fn step_succeeded(&self, step: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.step == step && r.is(StepPhase::Forward, StepOutcome::Succeeded))
    }

    /// Names of steps whose compensation ran successfully, in rollback order
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.is(StepPhase::Compensation, StepOutcome::Succeeded))
            .map(|r| r.step.as_str())
            .collect()
    }

    pub fn compensation_failures(&self) -> Vec<CompensationFailure> {
        self.records
            .iter()
            .filter(|r| r.is(StepPhase::Compensation, StepOutcome::Failed))
            .map(|r| CompensationFailure {
                step: r.step.clone(),
                cause: r.error.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Terminal error of this run, if any
    pub fn error(&self) -> Option<PipelineError> {
        let failed = self.failed_step()?;
        let step = failed.step.clone();
        let cause = failed.error.clone().unwrap_or_default();
        let failures = self.compensation_failures();

        if failures.is_empty() {
            Some(PipelineError::StepFailed { step, cause })
        } else {
            Some(PipelineError::RollbackPartialFailure {
                step,
                cause,
                failures,
            })
        }
    }

    /// One-line human summary for status messages
    pub fn summary(&self) -> String {
        let completed = self.completed_steps();
        match self.failed_step() {
            None => format!("{} step(s) completed", completed.len()),
            Some(failed) => {
                let mut summary = format!(
                    "{} step(s) completed, {} failed: {}",
                    completed.len(),
                    failed.step,
                    failed.error.as_deref().unwrap_or("unknown error")
                );
                if self.rolled_back {
                    let undone = self.compensated_steps().len();
                    let failures = self.compensation_failures().len();
                    summary.push_str(&format!(
                        "; rolled back {} step(s), {} compensation failure(s)",
                        undone, failures
                    ));
                }
                summary
            }
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod tests;
