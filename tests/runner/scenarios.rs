//! BDD scenarios for the step runner.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunnerContext, runner_context};

#[scenario(
    path = "tests/features/runner.feature",
    name = "Completed run cleans up in reverse order"
)]
fn scenario_completed_run(runner_context: RunnerContext) {
    drop(runner_context);
}

#[scenario(
    path = "tests/features/runner.feature",
    name = "Failing step stops forward progress"
)]
fn scenario_failing_step(runner_context: RunnerContext) {
    drop(runner_context);
}

#[scenario(
    path = "tests/features/runner.feature",
    name = "Halting step stops without an error"
)]
fn scenario_halting_step(runner_context: RunnerContext) {
    drop(runner_context);
}

#[scenario(
    path = "tests/features/runner.feature",
    name = "Cancellation during a step unwinds entered steps"
)]
fn scenario_cancellation(runner_context: RunnerContext) {
    drop(runner_context);
}

#[scenario(
    path = "tests/features/runner.feature",
    name = "Cleanup failure does not stop unwinding"
)]
fn scenario_cleanup_failure(runner_context: RunnerContext) {
    drop(runner_context);
}
