//! Unit tests for the runner's ordering, halting and cancellation rules.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use rstest::rstest;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_support::{Journal, RecordingUi, ScriptedStep};
use crate::ui::{ReadCloser, Ui, UiError};

fn runs(journal: &Journal) -> Vec<String> {
    journal
        .entries()
        .into_iter()
        .filter_map(|entry| entry.strip_prefix("run:").map(str::to_owned))
        .collect()
}

fn cleanups(journal: &Journal) -> Vec<String> {
    journal
        .entries()
        .into_iter()
        .filter_map(|entry| entry.strip_prefix("cleanup:").map(str::to_owned))
        .collect()
}

fn names(count: usize) -> Vec<String> {
    (0..count).map(|index| format!("step{index}")).collect()
}

fn state_with_ui() -> (StateBag, Arc<RecordingUi>) {
    let state = StateBag::new();
    let ui = Arc::new(RecordingUi::new());
    state.put_ui(ui.clone());
    (state, ui)
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(6)]
#[tokio::test]
async fn completed_runs_clean_up_every_step_in_reverse(#[case] count: usize) {
    let journal = Journal::new();
    let steps = names(count)
        .into_iter()
        .map(|name| ScriptedStep::new(name, journal.clone()).boxed())
        .collect();
    let runner = Runner::new(steps);

    let outcome = runner.run(&StateBag::new(), &CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.error, None);
    let mut reversed = runs(&journal);
    reversed.reverse();
    assert_eq!(cleanups(&journal), reversed);
    assert_eq!(runs(&journal), names(count));
    assert_eq!(runner.phase(), RunnerPhase::Done);
}

#[rstest]
#[case(4, 0)]
#[case(4, 2)]
#[case(4, 3)]
#[tokio::test]
async fn halt_stops_forward_progress_and_cleans_up_entered_steps(
    #[case] count: usize,
    #[case] halt_at: usize,
) {
    let journal = Journal::new();
    let steps = names(count)
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let step = ScriptedStep::new(name, journal.clone());
            let scripted = if index == halt_at { step.halting() } else { step };
            scripted.boxed()
        })
        .collect();

    let outcome = Runner::new(steps)
        .run(&StateBag::new(), &CancellationToken::new())
        .await;

    let entered: Vec<String> = names(halt_at + 1);
    let mut reversed = entered.clone();
    reversed.reverse();
    assert_eq!(runs(&journal), entered);
    assert_eq!(cleanups(&journal), reversed);
    assert_eq!(outcome.entered, entered);
    assert_eq!(outcome.status, RunStatus::Halted);
    assert_eq!(outcome.error, None);
}

#[tokio::test]
async fn recorded_error_fails_the_run_and_skips_later_steps() {
    let journal = Journal::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("CreateInstance", journal.clone()).boxed(),
        ScriptedStep::new("WaitReady", journal.clone())
            .failing("instance never became ready")
            .boxed(),
        ScriptedStep::new("Connect", journal.clone()).boxed(),
    ]);
    let (state, ui) = state_with_ui();

    let outcome = runner.run(&state, &CancellationToken::new()).await;

    assert_eq!(
        journal.entries(),
        vec![
            "run:CreateInstance",
            "run:WaitReady",
            "cleanup:WaitReady",
            "cleanup:CreateInstance",
        ]
    );
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(
        outcome.error,
        Some(StepError::failed("WaitReady", "instance never became ready"))
    );
    assert_eq!(ui.errors(), vec!["WaitReady: instance never became ready"]);
    assert!(state.is_halted());
}

#[tokio::test]
async fn cancellation_before_a_step_prevents_its_run() {
    let journal = Journal::new();
    let cancel = CancellationToken::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("A", journal.clone())
            .cancelling(cancel.clone())
            .boxed(),
        ScriptedStep::new("B", journal.clone()).boxed(),
    ]);
    let state = StateBag::new();

    let outcome = runner.run(&state, &cancel).await;

    assert_eq!(journal.entries(), vec!["run:A", "cleanup:A"]);
    assert_eq!(outcome.status, RunStatus::Halted);
    assert_eq!(outcome.error, None);
    assert!(state.is_cancelled());
    assert!(state.is_halted());
}

#[tokio::test]
async fn cancellation_before_the_first_step_enters_nothing() {
    let journal = Journal::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let runner = Runner::new(vec![ScriptedStep::new("A", journal.clone()).boxed()]);

    let outcome = runner.run(&StateBag::new(), &cancel).await;

    assert!(journal.entries().is_empty());
    assert!(outcome.entered.is_empty());
    assert_eq!(outcome.status, RunStatus::Halted);
}

#[tokio::test]
async fn failing_cleanup_does_not_stop_unwinding_or_replace_the_error() {
    let journal = Journal::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("A", journal.clone()).boxed(),
        ScriptedStep::new("B", journal.clone())
            .failing_cleanup("delete refused")
            .boxed(),
        ScriptedStep::new("C", journal.clone())
            .failing("boom")
            .boxed(),
    ]);
    let (state, ui) = state_with_ui();

    let outcome = runner.run(&state, &CancellationToken::new()).await;

    assert_eq!(cleanups(&journal), vec!["C", "B", "A"]);
    assert_eq!(outcome.error, Some(StepError::failed("C", "boom")));
    assert!(
        ui.errors()
            .iter()
            .any(|line| line.contains("cleanup of 'B' failed")),
        "cleanup failure should be reported: {:?}",
        ui.errors()
    );
}

#[tokio::test]
async fn cleanup_cannot_overwrite_the_forward_error() {
    let journal = Journal::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("A", journal.clone())
            .overwriting_error_in_cleanup()
            .boxed(),
        ScriptedStep::new("B", journal.clone())
            .failing("forward failure")
            .boxed(),
    ]);
    let state = StateBag::new();

    let outcome = runner.run(&state, &CancellationToken::new()).await;

    assert_eq!(outcome.error, Some(StepError::failed("B", "forward failure")));
    assert_eq!(state.error(), Some(StepError::failed("B", "forward failure")));
}

#[tokio::test]
async fn cleanup_error_on_a_successful_run_leaves_it_completed() {
    let journal = Journal::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("A", journal.clone())
            .overwriting_error_in_cleanup()
            .failing_cleanup("late failure")
            .boxed(),
    ]);
    let state = StateBag::new();

    let outcome = runner.run(&state, &CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(state.error(), None);
}

struct RecordingPause {
    journal: Journal,
}

impl Pause for RecordingPause {
    fn pause<'a>(
        &'a self,
        point: PausePoint,
        step: &'a str,
        _state: &'a StateBag,
    ) -> StepFuture<'a, ()> {
        Box::pin(async move {
            self.journal.push(format!("pause:{point:?}:{step}"));
        })
    }
}

#[tokio::test]
async fn pause_follows_every_run_and_cleanup() {
    let journal = Journal::new();
    let runner = Runner::new(vec![
        ScriptedStep::new("A", journal.clone()).boxed(),
        ScriptedStep::new("B", journal.clone()).boxed(),
    ])
    .with_pause(Arc::new(RecordingPause {
        journal: journal.clone(),
    }));

    runner.run(&StateBag::new(), &CancellationToken::new()).await;

    assert_eq!(
        journal.entries(),
        vec![
            "run:A",
            "pause:AfterRun:A",
            "run:B",
            "pause:AfterRun:B",
            "cleanup:B",
            "pause:AfterCleanup:B",
            "cleanup:A",
            "pause:AfterCleanup:A",
        ]
    );
}

#[tokio::test]
async fn ask_pause_prompts_through_the_ui() {
    let state = StateBag::new();
    let ui = Arc::new(RecordingUi::new().with_answer(""));
    state.put_ui(ui.clone());

    AskPause
        .pause(PausePoint::AfterRun, "create_machine", &state)
        .await;

    assert_eq!(
        ui.questions(),
        vec!["Pausing after run of step 'create_machine'. Press enter to continue."]
    );
}

/// Answers only once another task opens its gate.
struct GatedUi {
    gate: parking_lot::Mutex<Receiver<()>>,
    opened: AtomicBool,
}

impl Ui for GatedUi {
    fn say(&self, _message: &str) {}

    fn message(&self, _message: &str) {}

    fn error(&self, _message: &str) {}

    fn machine(&self, _event_type: &str, _args: &[&str]) {}

    fn ask(&self, _query: &str) -> Result<String, UiError> {
        self.gate
            .lock()
            .recv_timeout(Duration::from_secs(2))
            .map_err(|err| UiError::Io(err.to_string()))?;
        self.opened.store(true, Ordering::SeqCst);
        Ok(String::new())
    }

    fn track_progress(
        &self,
        _label: &str,
        _current: u64,
        _total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser> {
        stream
    }
}

#[tokio::test]
async fn ask_pause_leaves_the_runtime_free_while_waiting() {
    let (open, gate) = channel();
    let ui = Arc::new(GatedUi {
        gate: parking_lot::Mutex::new(gate),
        opened: AtomicBool::new(false),
    });
    let state = StateBag::new();
    state.put_ui(ui.clone());
    let opener = tokio::spawn(async move {
        open.send(()).ok();
    });

    AskPause
        .pause(PausePoint::AfterCleanup, "stop_machine", &state)
        .await;

    opener.await.expect("opener task joins");
    assert!(ui.opened.load(Ordering::SeqCst));
}

#[tokio::test]
async fn ask_pause_continues_when_prompting_is_unsupported() {
    let journal = Journal::new();
    let runner = Runner::new(vec![ScriptedStep::new("A", journal.clone()).boxed()])
        .with_pause(Arc::new(AskPause));
    let (state, _ui) = state_with_ui();

    let outcome = runner.run(&state, &CancellationToken::new()).await;

    assert!(outcome.is_completed());
    assert_eq!(journal.entries(), vec!["run:A", "cleanup:A"]);
}

#[test]
fn new_runner_is_idle() {
    let runner = Runner::new(Vec::new());
    assert_eq!(runner.phase(), RunnerPhase::Idle);
    assert!(runner.step_names().is_empty());
}
