//! Shared fixtures for runner BDD scenarios.

use std::sync::Arc;

use kiln::RunOutcome;
use kiln::test_support::{Journal, RecordingUi, ScriptedStep};
use parking_lot::Mutex;
use rstest::fixture;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct RunnerContext {
    pub journal: Journal,
    pub steps: Arc<Mutex<Vec<ScriptedStep>>>,
    pub cancel: CancellationToken,
    pub ui: Arc<RecordingUi>,
    pub outcome: Arc<Mutex<Option<RunOutcome>>>,
    pub cancelled: Arc<Mutex<bool>>,
}

impl RunnerContext {
    /// Applies `update` to the scripted step called `name`.
    pub fn update_step(
        &self,
        name: &str,
        update: impl FnOnce(ScriptedStep) -> ScriptedStep,
    ) -> Result<(), String> {
        let mut steps = self.steps.lock();
        let position = steps
            .iter()
            .position(|step| kiln::Step::name(step) == name)
            .ok_or_else(|| format!("no step named {name}"))?;
        let current = steps.remove(position);
        steps.insert(position, update(current));
        Ok(())
    }

    pub fn outcome(&self) -> Result<RunOutcome, String> {
        self.outcome
            .lock()
            .clone()
            .ok_or_else(|| String::from("the runner has not run"))
    }
}

#[fixture]
pub fn runner_context() -> RunnerContext {
    RunnerContext::default()
}
