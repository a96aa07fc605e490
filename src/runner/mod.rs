//! Sequential step runner with guaranteed reverse-order cleanup.
//!
//! The runner walks its steps in declaration order. Before and after every
//! `run` it checks the cancellation token; a halt signal, a recorded error or
//! cancellation stops forward progress. Every step whose `run` was entered is
//! then cleaned up exactly once, newest first, whatever the reason forward
//! progress ended, including plain success.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction, StepError, StepFuture};

/// Observable position of the runner's state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunnerPhase {
    /// No run has started.
    Idle,
    /// Executing the forward action of the step at `index`.
    Running {
        /// Position of the step in the sequence.
        index: usize,
    },
    /// Unwinding entered steps.
    Compensating,
    /// The last run finished.
    Done,
}

/// Terminal classification of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// Every step continued and no error was recorded.
    Completed,
    /// Forward progress stopped through cancellation or a halt without error.
    Halted,
    /// A step recorded an error.
    Failed,
}

/// Result of [`Runner::run`], derived from the bag's control values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// The forward error recorded by the failing step, if any.
    pub error: Option<StepError>,
    /// Names of the steps whose `run` was entered, in entry order.
    pub entered: Vec<String>,
}

impl RunOutcome {
    /// Reports whether the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Where a debug pause happens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PausePoint {
    /// After a step's forward action returned.
    AfterRun,
    /// After a step's cleanup returned.
    AfterCleanup,
}

/// Debug hook awaited between steps.
pub trait Pause: Send + Sync {
    /// Blocks the run until the operator is ready to continue.
    fn pause<'a>(
        &'a self,
        point: PausePoint,
        step: &'a str,
        state: &'a StateBag,
    ) -> StepFuture<'a, ()>;
}

/// Pause that prompts through the injected UI.
#[derive(Clone, Copy, Debug, Default)]
pub struct AskPause;

impl Pause for AskPause {
    fn pause<'a>(
        &'a self,
        point: PausePoint,
        step: &'a str,
        state: &'a StateBag,
    ) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Ok(ui) = state.ui() else {
                return;
            };
            let phase = match point {
                PausePoint::AfterRun => "run",
                PausePoint::AfterCleanup => "cleanup",
            };
            let query =
                format!("Pausing after {phase} of step '{step}'. Press enter to continue.");
            match tokio::task::spawn_blocking(move || ui.ask(&query)).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => tracing::warn!(step, %error, "debug pause skipped"),
                Err(error) => tracing::warn!(step, %error, "debug prompt task failed"),
            }
        })
    }
}

/// Executes an ordered sequence of steps.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
    pause: Option<Arc<dyn Pause>>,
    phase: Mutex<RunnerPhase>,
}

impl Runner {
    /// Creates a runner for `steps`, executed in the given order.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            pause: None,
            phase: Mutex::new(RunnerPhase::Idle),
        }
    }

    /// Awaits `pause` after every run and every cleanup.
    #[must_use]
    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Current phase of the state machine.
    #[must_use]
    pub fn phase(&self) -> RunnerPhase {
        *self.phase.lock()
    }

    /// Names of the configured steps in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs the steps against `state`, then cleans up every entered step.
    ///
    /// Cancellation is cooperative: `cancel` is checked at step boundaries
    /// and forwarded to steps for their own poll points.
    #[tracing::instrument(name = "Runner::run", skip_all, fields(steps = self.steps.len()))]
    pub async fn run(&self, state: &StateBag, cancel: &CancellationToken) -> RunOutcome {
        tracing::debug!("run starting");
        let entered = self.forward(state, cancel).await;
        let names = entered.iter().map(|step| step.name().to_owned()).collect();
        self.compensate(entered, state).await;
        self.set_phase(RunnerPhase::Done);

        let outcome = Self::outcome(state, names);
        tracing::debug!(status = ?outcome.status, "run finished");
        outcome
    }

    async fn forward<'s>(
        &'s self,
        state: &StateBag,
        cancel: &CancellationToken,
    ) -> Vec<&'s dyn Step> {
        let mut entered: Vec<&'s dyn Step> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(step = step.name(), "cancelled before step");
                Self::mark_cancelled(state);
                break;
            }

            self.set_phase(RunnerPhase::Running { index });
            entered.push(step.as_ref());
            let span = tracing::info_span!("step", step = step.name(), index);
            let action = step.run(state, cancel).instrument(span).await;
            self.pause_at(PausePoint::AfterRun, step.name(), state)
                .await;

            if cancel.is_cancelled() {
                tracing::info!(step = step.name(), "cancelled during step");
                Self::mark_cancelled(state);
                break;
            }
            if action == StepAction::Halt || state.contains(keys::ERROR) {
                tracing::info!(step = step.name(), ?action, "halting");
                state.put(keys::HALTED, true);
                break;
            }
        }
        entered
    }

    async fn compensate(&self, entered: Vec<&dyn Step>, state: &StateBag) {
        self.set_phase(RunnerPhase::Compensating);
        let forward_error = state.error();

        for step in entered.into_iter().rev() {
            let span = tracing::info_span!("cleanup", step = step.name());
            if let Err(error) = step.cleanup(state).instrument(span).await {
                tracing::warn!(step = step.name(), %error, "cleanup failed");
                if let Ok(ui) = state.ui() {
                    ui.error(&format!("cleanup of '{}' failed: {error}", step.name()));
                }
            }
            self.pause_at(PausePoint::AfterCleanup, step.name(), state)
                .await;
        }

        match forward_error {
            Some(error) => state.put(keys::ERROR, error),
            None => {
                state.delete(keys::ERROR);
            }
        }
    }

    async fn pause_at(&self, point: PausePoint, step: &str, state: &StateBag) {
        if let Some(pause) = &self.pause {
            pause.pause(point, step, state).await;
        }
    }

    fn mark_cancelled(state: &StateBag) {
        state.put(keys::CANCELLED, true);
        state.put(keys::HALTED, true);
    }

    fn set_phase(&self, phase: RunnerPhase) {
        *self.phase.lock() = phase;
    }

    fn outcome(state: &StateBag, entered: Vec<String>) -> RunOutcome {
        let error = state.error();
        let status = if error.is_some() {
            RunStatus::Failed
        } else if state.is_cancelled() || state.is_halted() {
            RunStatus::Halted
        } else {
            RunStatus::Completed
        };
        RunOutcome {
            status,
            error,
            entered,
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Runner")
            .field("steps", &self.step_names())
            .field("phase", &self.phase())
            .field("pause", &self.pause.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests;
