//! Runs the provisioning hooks.

use tokio_util::sync::CancellationToken;

use super::say;
use crate::hook::{HOOK_POST_PROVISION, HOOK_PRE_PROVISION, HOOK_PROVISION};
use crate::state::StateBag;
use crate::step::{Step, StepAction, StepError, StepFuture, halt_with};

/// Invokes `pre_provision`, `provision` and `post_provision` in order.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepProvision;

impl StepProvision {
    const NAME: &'static str = "provision";
}

impl Step for StepProvision {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let hook = match state.hook() {
                Ok(hook) => hook,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };

            say(state, "Provisioning...");
            for name in [HOOK_PRE_PROVISION, HOOK_PROVISION, HOOK_POST_PROVISION] {
                if cancel.is_cancelled() {
                    return StepAction::Halt;
                }
                match hook.run(name, state, cancel).await {
                    Ok(()) => tracing::debug!(hook = name, "hook finished"),
                    Err(err) if err.is_cancelled() => {
                        tracing::info!(hook = name, "hook cancelled");
                        return StepAction::Halt;
                    }
                    Err(err) => return halt_with(state, StepError::hook(Self::NAME, err)),
                }
            }
            StepAction::Continue
        })
    }

    fn cleanup<'a>(&'a self, _state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }
}
