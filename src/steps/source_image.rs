//! Resolves the image the build machine boots from.

use tokio_util::sync::CancellationToken;

use super::{SOURCE_IMAGE, message, prerequisites, say};
use crate::state::StateBag;
use crate::step::{Step, StepAction, StepError, StepFuture, halt_on_driver_error, halt_with};

/// Looks up the configured source image and stores its metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepSourceImage;

impl StepSourceImage {
    const NAME: &'static str = "source_image";
}

impl Step for StepSourceImage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        _cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let (driver, settings) = match prerequisites(state, Self::NAME) {
                Ok(found) => found,
                Err(err) => return halt_with(state, err),
            };

            say(
                state,
                &format!("Resolving source image '{}'...", settings.source.label),
            );
            match driver.source_image(&settings.source).await {
                Ok(image) => {
                    message(state, &format!("Source image: {} ({})", image.id, image.name));
                    state.put(SOURCE_IMAGE, image);
                    StepAction::Continue
                }
                Err(err) => halt_on_driver_error(state, Self::NAME, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, _state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }
}
