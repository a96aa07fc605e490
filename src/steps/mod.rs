//! Canonical steps of an image build.
//!
//! Steps talk to the provider through the [`Driver`] stored in the bag and
//! publish what they create under the keys below so later steps, and their
//! own cleanup, can find it.

use std::sync::Arc;

use crate::config::BuildSettings;
use crate::driver::Driver;
use crate::state::StateBag;
use crate::step::StepError;

mod connect;
mod image;
mod machine;
mod provision;
mod source_image;

pub use connect::StepConnect;
pub use image::{StepCreateImage, StepTagImage};
pub use machine::{StepCreateMachine, StepStopMachine, StepWaitForRunning};
pub use provision::StepProvision;
pub use source_image::StepSourceImage;

/// Key holding the resolved [`crate::driver::ImageMetadata`] of the source image.
pub const SOURCE_IMAGE: &str = "source_image";
/// Key holding the [`crate::driver::MachineHandle`] of the build machine.
pub const MACHINE: &str = "machine";
/// Key holding the [`crate::driver::MachineNetworking`] of the build machine.
pub const MACHINE_NETWORKING: &str = "machine_networking";
/// Key holding the [`crate::remote::Connection`] to the build machine.
pub const CONNECTION: &str = "connection";
/// Key holding the [`crate::driver::ImageHandle`] of the produced image.
pub const IMAGE: &str = "image";

fn prerequisites(
    state: &StateBag,
    step: &str,
) -> Result<(Arc<dyn Driver>, BuildSettings), StepError> {
    let driver = state.driver().map_err(|err| StepError::state(step, err))?;
    let settings = state
        .config::<BuildSettings>()
        .map_err(|err| StepError::state(step, err))?;
    Ok((driver, settings))
}

fn say(state: &StateBag, message: &str) {
    if let Ok(ui) = state.ui() {
        ui.say(message);
    }
}

fn message(state: &StateBag, message: &str) {
    if let Ok(ui) = state.ui() {
        ui.message(message);
    }
}

#[cfg(test)]
mod tests;
