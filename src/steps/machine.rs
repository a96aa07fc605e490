//! Machine lifecycle steps: create, wait for boot, stop.

use tokio_util::sync::CancellationToken;

use super::{MACHINE, MACHINE_NETWORKING, SOURCE_IMAGE, message, prerequisites, say};
use crate::driver::{ImageMetadata, MachineHandle, MachineState};
use crate::state::StateBag;
use crate::step::{Step, StepAction, StepError, StepFuture, halt_on_driver_error, halt_with};

/// Creates the build machine from the resolved source image.
///
/// Cleanup deletes the machine and waits until the provider reports it gone.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepCreateMachine;

impl StepCreateMachine {
    const NAME: &'static str = "create_machine";
}

impl Step for StepCreateMachine {
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
            let source: ImageMetadata = match state.require(SOURCE_IMAGE) {
                Ok(source) => source,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };
            let request = match settings.machine_request(&source.id) {
                Ok(request) => request,
                Err(err) => return halt_with(state, StepError::driver(Self::NAME, err)),
            };

            say(state, "Creating machine...");
            match driver.create_machine(&request).await {
                Ok(handle) => {
                    message(state, &format!("Machine ID: {}", handle.id));
                    tracing::info!(machine = %handle.id, zone = %handle.zone, "machine created");
                    state.put(MACHINE, handle);
                    StepAction::Continue
                }
                Err(err) => halt_on_driver_error(state, Self::NAME, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            let Some(handle) = state.get::<MachineHandle>(MACHINE) else {
                return Ok(());
            };
            let (driver, settings) = prerequisites(state, Self::NAME)?;

            say(state, "Deleting machine...");
            driver
                .delete_machine(&handle)
                .await
                .map_err(|err| StepError::driver(Self::NAME, err))?;
            // Cleanup runs after cancellation, so its wait gets a fresh token.
            driver
                .wait_for_machine_deletion(
                    &handle,
                    settings.timeouts.machine_state,
                    &CancellationToken::new(),
                )
                .await
                .map_err(|err| StepError::driver(Self::NAME, err))?;
            state.delete(MACHINE);
            tracing::info!(machine = %handle.id, "machine deleted");
            Ok(())
        })
    }
}

/// Waits for the machine to boot and records its networking.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepWaitForRunning;

impl StepWaitForRunning {
    const NAME: &'static str = "wait_for_running";
}

impl Step for StepWaitForRunning {
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

            say(state, "Waiting for machine to become running...");
            if let Err(err) = driver
                .wait_for_machine_state(
                    &handle,
                    MachineState::Running,
                    settings.timeouts.machine_state,
                    cancel,
                )
                .await
            {
                return halt_on_driver_error(state, Self::NAME, err);
            }

            match driver.machine_networking(&handle).await {
                Ok(networking) => {
                    message(state, &format!("Public IP: {}", networking.public_ip));
                    state.put(MACHINE_NETWORKING, networking);
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

/// Powers the machine off before it is imaged.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepStopMachine;

impl StepStopMachine {
    const NAME: &'static str = "stop_machine";
}

impl Step for StepStopMachine {
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

            say(state, "Stopping machine...");
            if let Err(err) = driver.stop_machine(&handle).await {
                return halt_on_driver_error(state, Self::NAME, err);
            }
            match driver
                .wait_for_machine_state(
                    &handle,
                    MachineState::Stopped,
                    settings.timeouts.machine_state,
                    cancel,
                )
                .await
            {
                Ok(()) => StepAction::Continue,
                Err(err) => halt_on_driver_error(state, Self::NAME, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, _state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }
}
