//! The unit of work executed by the [`crate::runner::Runner`].
//!
//! A step pairs a forward action with a compensating cleanup. Both operate on
//! the shared [`StateBag`]; steps keep no state of their own between runs.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::driver::DriverError;
use crate::hook::HookError;
use crate::state::{StateBag, StateError};

/// Signal returned by [`Step::run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop forward progress and start compensation.
    Halt,
}

/// Failures recorded by steps.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepError {
    /// Raised when a required state value is absent or mistyped.
    #[error("{step}: {source}")]
    State {
        /// Name of the failing step.
        step: String,
        /// Underlying lookup failure.
        #[source]
        source: StateError,
    },
    /// Raised when a driver call fails.
    #[error("{step}: {source}")]
    Driver {
        /// Name of the failing step.
        step: String,
        /// Provider failure.
        #[source]
        source: DriverError,
    },
    /// Raised when a hook fails.
    #[error("{step}: {source}")]
    Hook {
        /// Name of the failing step.
        step: String,
        /// Hook failure.
        #[source]
        source: HookError,
    },
    /// Raised when the machine cannot be reached.
    #[error("{step}: could not connect to {address}: {message}")]
    Connect {
        /// Name of the failing step.
        step: String,
        /// Address that was probed.
        address: String,
        /// Last connection error observed.
        message: String,
    },
    /// Raised for failures that carry only a message.
    #[error("{step}: {message}")]
    Failed {
        /// Name of the failing step.
        step: String,
        /// Description of the failure.
        message: String,
    },
}

impl StepError {
    /// Wraps a state lookup failure.
    #[must_use]
    pub fn state(step: &str, source: StateError) -> Self {
        Self::State {
            step: step.to_owned(),
            source,
        }
    }

    /// Wraps a driver failure.
    #[must_use]
    pub fn driver(step: &str, source: DriverError) -> Self {
        Self::Driver {
            step: step.to_owned(),
            source,
        }
    }

    /// Wraps a hook failure.
    #[must_use]
    pub fn hook(step: &str, source: HookError) -> Self {
        Self::Hook {
            step: step.to_owned(),
            source,
        }
    }

    /// Builds a message-only failure.
    #[must_use]
    pub fn failed(step: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            step: step.to_owned(),
            message: message.into(),
        }
    }
}

/// Future returned by step operations.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A forward action with its compensating cleanup.
pub trait Step: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &str;

    /// Performs the forward action.
    ///
    /// Unrecoverable failures are recorded with [`halt_with`] and signalled by
    /// returning [`StepAction::Halt`]. Long waits must observe `cancel`.
    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction>;

    /// Releases whatever `run` allocated.
    ///
    /// Called once for every step whose `run` was entered, even when `run`
    /// failed early, so implementations must check the bag for evidence of
    /// their resource before releasing it.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the release fails; the runner reports it
    /// and keeps unwinding.
    fn cleanup<'a>(&'a self, state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>>;
}

/// Records `error`, reports it to the operator, and asks the runner to halt.
pub fn halt_with(state: &StateBag, error: StepError) -> StepAction {
    if let Ok(ui) = state.ui() {
        ui.error(&error.to_string());
    }
    state.record_error(error);
    StepAction::Halt
}

/// Maps a driver failure onto a step outcome.
///
/// Cancellation surfaces as a plain halt since it is not a failure.
pub fn halt_on_driver_error(state: &StateBag, step: &str, error: DriverError) -> StepAction {
    if error.is_cancelled() {
        tracing::info!(step, %error, "driver wait cancelled");
        return StepAction::Halt;
    }
    halt_with(state, StepError::driver(step, error))
}
