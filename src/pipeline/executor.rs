use super::{Step, StepPhase, StepRecord};
use super::{BoxedStep, PipelineResult};
use crate::error::StepError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

/// Runs steps in order and drives rollback
///
/// The executor holds no per-run state, so one instance can serve many
/// pipelines. Log output goes to the span supplied at construction.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    span: Span,
    step_timeout: Option<Duration>,
    cancellation: CancellationToken,
}

impl PipelineExecutor {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            step_timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Same settings, logging into `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bound every forward and compensating operation
    ///
    /// A timed out operation counts as a failure of that operation.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Abort in-flight work when `token` is cancelled
    ///
    /// Cancellation fails the current step; rollback still runs when enabled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Execute `steps` in order against `ctx`
    ///
    /// # Arguments
    /// * `steps` - Steps in execution order
    /// * `ctx` - Per-operation context shared by the steps
    /// * `rollback_on_failure` - Compensate succeeded steps when a step fails
    ///
    /// # Returns
    /// The full ledger. Never an error: failures are part of the ledger and
    /// surfaced through [`PipelineResult::error`].
    pub async fn execute<C: Send>(
        &self,
        steps: &[BoxedStep<C>],
        ctx: &mut C,
        rollback_on_failure: bool,
    ) -> PipelineResult {
        self.run(steps, ctx, rollback_on_failure)
            .instrument(self.span.clone())
            .await
    }

    async fn run<C: Send>(
        &self,
        steps: &[BoxedStep<C>],
        ctx: &mut C,
        rollback_on_failure: bool,
    ) -> PipelineResult {
        let mut result = PipelineResult::empty();
        let mut completed: Vec<&dyn Step<C>> = Vec::with_capacity(steps.len());

        info!(steps = steps.len(), rollback_on_failure, "Executing pipeline");

        for step in steps {
            let step = step.as_ref();
            info!(step = step.name(), "Executing step");

            match self.forward(step, ctx).await {
                Ok(()) => {
                    info!(step = step.name(), "Step succeeded");
                    result
                        .records
                        .push(StepRecord::succeeded(step.name(), StepPhase::Forward));
                    completed.push(step);
                }
                Err(e) => {
                    error!(step = step.name(), error = %e, "Step failed");
                    result
                        .records
                        .push(StepRecord::failed(step.name(), StepPhase::Forward, &e));

                    if rollback_on_failure {
                        self.rollback(&completed, ctx, &mut result).await;
                    } else {
                        warn!(
                            step = step.name(),
                            completed = completed.len(),
                            "Pipeline stopped without rollback"
                        );
                    }
                    return result;
                }
            }
        }

        info!(steps = completed.len(), "Pipeline completed");
        result
    }

    async fn rollback<C: Send>(
        &self,
        completed: &[&dyn Step<C>],
        ctx: &mut C,
        result: &mut PipelineResult,
    ) {
        result.rolled_back = true;
        warn!(steps = completed.len(), "Rolling back completed steps");

        for step in completed.iter().rev() {
            if step.destructive() || !step.has_compensation() {
                result.records.push(StepRecord::skipped(step.name()));
                continue;
            }

            match self.bounded(step.compensate(ctx)).await {
                Ok(()) => {
                    info!(step = step.name(), "Step compensated");
                    result
                        .records
                        .push(StepRecord::succeeded(step.name(), StepPhase::Compensation));
                }
                Err(e) => {
                    // keep going: the remaining undos are independent of this one
                    error!(step = step.name(), error = %e, "Compensation failed");
                    result.records.push(StepRecord::failed(
                        step.name(),
                        StepPhase::Compensation,
                        &e,
                    ));
                }
            }
        }
    }

    async fn forward<C: Send>(&self, step: &dyn Step<C>, ctx: &mut C) -> Result<(), StepError> {
        if self.cancellation.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(StepError::Cancelled),
            outcome = self.bounded(step.execute(ctx)) => outcome,
        }
    }

    async fn bounded<F>(&self, operation: F) -> Result<(), StepError>
    where
        F: std::future::Future<Output = Result<(), StepError>>,
    {
        match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::TimedOut(limit)),
            },
            None => operation.await,
        }
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(Span::none())
    }
}
