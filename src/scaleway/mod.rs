//! Scaleway driver implementation of the machine and image lifecycle.

mod error;
mod lifecycle;
mod types;

use std::time::Duration;

use scaleway_rs::ScalewayApi;

use crate::config::ScalewayConfig;
use crate::driver::{
    Driver, DriverFuture, ImageHandle, ImageMetadata, ImageRequest, ImageState,
    MachineHandle, MachineNetworking, MachineRequest, MachineState, SourceImageQuery,
};

const DEFAULT_SSH_PORT: u16 = 22;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub use error::ScalewayDriverError;

/// Driver that builds images through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayDriver {
    api: ScalewayApi,
    secret_key: String,
    ssh_port: u16,
    poll_interval: Duration,
}

impl ScalewayDriver {
    /// Constructs a new driver from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayDriverError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: &ScalewayConfig) -> Result<Self, ScalewayDriverError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            secret_key: config.secret_key.clone(),
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
        })
    }
}

impl std::fmt::Debug for ScalewayDriver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ScalewayDriver")
            .field("ssh_port", &self.ssh_port)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Driver for ScalewayDriver {
    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn source_image<'a>(&'a self, query: &'a SourceImageQuery) -> DriverFuture<'a, ImageMetadata> {
        Box::pin(async move { Ok(self.resolve_image(query).await?) })
    }

    fn create_machine<'a>(
        &'a self,
        request: &'a MachineRequest,
    ) -> DriverFuture<'a, MachineHandle> {
        Box::pin(async move {
            request.validate()?;
            let snapshot = self.create_server(request).await?;
            let handle = MachineHandle {
                id: snapshot.id.as_str().to_owned(),
                zone: request.zone.clone(),
            };
            Self::power_on_or_release(
                &snapshot,
                || self.power_on_if_needed(&request.zone, &snapshot),
                || self.remove_instance(&handle),
            )
            .await?;
            Ok(handle)
        })
    }

    fn machine_state<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, Option<MachineState>> {
        Box::pin(async move {
            let snapshot = self.fetch_instance(handle).await?;
            Ok(snapshot.map(|server| server.state.to_machine_state()))
        })
    }

    fn machine_networking<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, MachineNetworking> {
        Box::pin(async move { Ok(self.networking(handle).await?) })
    }

    fn stop_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.api
                .perform_instance_action_async(&handle.zone, &handle.id, "poweroff")
                .await
                .map_err(ScalewayDriverError::from)?;
            Ok(())
        })
    }

    fn delete_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move { Ok(self.remove_instance(handle).await?) })
    }

    fn create_image_from_machine<'a>(
        &'a self,
        handle: &'a MachineHandle,
        request: &'a ImageRequest,
    ) -> DriverFuture<'a, ImageHandle> {
        Box::pin(async move {
            let id = self.backup_server(handle, &request.name).await?;
            Ok(ImageHandle {
                id,
                zone: handle.zone.clone(),
            })
        })
    }

    fn image_state<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, Option<ImageState>> {
        Box::pin(async move {
            let found = self.fetch_image(image).await?;
            Ok(found.map(|details| types::image_state(&details.state)))
        })
    }

    fn tag_image<'a>(&'a self, image: &'a ImageHandle, tags: &'a [String]) -> DriverFuture<'a, ()> {
        Box::pin(async move { Ok(self.update_image_tags(image, tags).await?) })
    }

    fn delete_image<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move { Ok(self.remove_image(image).await?) })
    }
}
