//! Image capture and tagging.

use tokio_util::sync::CancellationToken;

use super::{IMAGE, MACHINE, message, prerequisites, say};
use crate::driver::{ImageHandle, MachineHandle};
use crate::state::StateBag;
use crate::step::{Step, StepAction, StepError, StepFuture, halt_on_driver_error, halt_with};

/// Snapshots the stopped machine into an image.
///
/// The image is published under `image` as soon as the provider accepts the
/// request. Cleanup deletes it only when the build did not complete, so a
/// half-made image never outlives a failed or cancelled run.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepCreateImage;

impl StepCreateImage {
    const NAME: &'static str = "create_image";
}

impl Step for StepCreateImage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let (driver, settings) = match prerequisites(state, Self::NAME) {
                Ok(found) => found,
                Err(err) => return halt_with(state, err),
            };
            let handle: MachineHandle = match state.require(MACHINE) {
                Ok(handle) => handle,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };

            say(state, &format!("Creating image '{}'...", settings.image.name));
            let image = match driver
                .create_image_from_machine(&handle, &settings.image)
                .await
            {
                Ok(image) => image,
                Err(err) => return halt_on_driver_error(state, Self::NAME, err),
            };
            state.put(IMAGE, image.clone());

            message(state, "Waiting for image to become available...");
            match driver
                .wait_for_image_creation(&image, settings.timeouts.image, cancel)
                .await
            {
                Ok(()) => {
                    message(state, &format!("Image ID: {}", image.id));
                    tracing::info!(image = %image.id, zone = %image.zone, "image available");
                    StepAction::Continue
                }
                Err(err) => halt_on_driver_error(state, Self::NAME, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            let unfinished = state.is_halted() || state.is_cancelled() || state.error().is_some();
            if !unfinished {
                return Ok(());
            }
            let Some(image) = state.get::<ImageHandle>(IMAGE) else {
                return Ok(());
            };
            let (driver, _) = prerequisites(state, Self::NAME)?;

            say(state, "Deleting image from unfinished build...");
            driver
                .delete_image(&image)
                .await
                .map_err(|err| StepError::driver(Self::NAME, err))?;
            state.delete(IMAGE);
            tracing::info!(image = %image.id, "image deleted");
            Ok(())
        })
    }
}

/// Applies the configured tags to the finished image.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepTagImage;

impl StepTagImage {
    const NAME: &'static str = "tag_image";
}

impl Step for StepTagImage {
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
            let tags = &settings.image.tags;
            if tags.is_empty() {
                return StepAction::Continue;
            }
            let image: ImageHandle = match state.require(IMAGE) {
                Ok(image) => image,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };

            say(state, &format!("Tagging image with {}...", tags.join(", ")));
            match driver.tag_image(&image, tags).await {
                Ok(()) => StepAction::Continue,
                Err(err) => halt_on_driver_error(state, Self::NAME, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, _state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }
}
