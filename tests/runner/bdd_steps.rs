//! BDD step definitions for the step runner.

use std::sync::Arc;

use kiln::test_support::ScriptedStep;
use kiln::{RunStatus, Runner, StateBag, Ui};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::RunnerContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::Assertion(message)
    }
}

#[given("a runner with steps \"{names}\"")]
fn runner_with_steps(runner_context: &RunnerContext, names: String) {
    let mut steps = runner_context.steps.lock();
    steps.clear();
    steps.extend(
        names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| ScriptedStep::new(name, runner_context.journal.clone())),
    );
}

#[given("step \"{name}\" fails with \"{message}\"")]
fn step_fails(runner_context: &RunnerContext, name: String, message: String) -> Result<(), StepError> {
    runner_context
        .update_step(&name, |step| step.failing(message))
        .map_err(StepError::from)
}

#[given("step \"{name}\" halts")]
fn step_halts(runner_context: &RunnerContext, name: String) -> Result<(), StepError> {
    runner_context
        .update_step(&name, ScriptedStep::halting)
        .map_err(StepError::from)
}

#[given("step \"{name}\" cancels the build")]
fn step_cancels(runner_context: &RunnerContext, name: String) -> Result<(), StepError> {
    let token = runner_context.cancel.clone();
    runner_context
        .update_step(&name, |step| step.cancelling(token))
        .map_err(StepError::from)
}

#[given("step \"{name}\" fails cleanup with \"{message}\"")]
fn step_fails_cleanup(
    runner_context: &RunnerContext,
    name: String,
    message: String,
) -> Result<(), StepError> {
    runner_context
        .update_step(&name, |step| step.failing_cleanup(message))
        .map_err(StepError::from)
}

#[when("the runner runs")]
fn runner_runs(runner_context: &RunnerContext) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let steps = runner_context
        .steps
        .lock()
        .iter()
        .cloned()
        .map(ScriptedStep::boxed)
        .collect();
    let runner = Runner::new(steps);
    let state = StateBag::new();
    state.put_ui(Arc::clone(&runner_context.ui) as Arc<dyn Ui>);

    let outcome = runtime.block_on(runner.run(&state, &runner_context.cancel));
    *runner_context.cancelled.lock() = state.is_cancelled();
    *runner_context.outcome.lock() = Some(outcome);
    Ok(())
}

#[then("the journal is \"{entries}\"")]
fn journal_is(runner_context: &RunnerContext, entries: String) -> Result<(), StepError> {
    let actual = runner_context.journal.entries().join(",");
    if actual == entries {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected journal {entries}, got {actual}"
        )))
    }
}

#[then("the run status is \"{status}\"")]
fn run_status_is(runner_context: &RunnerContext, status: String) -> Result<(), StepError> {
    let expected = match status.as_str() {
        "completed" => RunStatus::Completed,
        "halted" => RunStatus::Halted,
        "failed" => RunStatus::Failed,
        other => {
            return Err(StepError::Assertion(format!("unknown run status: {other}")));
        }
    };
    let outcome = runner_context.outcome()?;
    if outcome.status == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected status {expected:?}, got {:?}",
            outcome.status
        )))
    }
}

#[then("the recorded error mentions \"{text}\"")]
fn recorded_error_mentions(runner_context: &RunnerContext, text: String) -> Result<(), StepError> {
    let outcome = runner_context.outcome()?;
    match outcome.error {
        Some(error) if error.to_string().contains(&text) => Ok(()),
        Some(error) => Err(StepError::Assertion(format!(
            "error '{error}' does not mention '{text}'"
        ))),
        None => Err(StepError::Assertion(String::from("no error was recorded"))),
    }
}

#[then("the run is marked cancelled")]
fn run_marked_cancelled(runner_context: &RunnerContext) -> Result<(), StepError> {
    if *runner_context.cancelled.lock() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "the state bag does not record cancellation",
        )))
    }
}

#[then("the operator saw \"{line}\"")]
fn operator_saw(runner_context: &RunnerContext, line: String) -> Result<(), StepError> {
    let errors = runner_context.ui.errors();
    if errors.contains(&line) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected UI error '{line}', got {errors:?}"
        )))
    }
}
