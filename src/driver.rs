//! Driver abstraction over a compute provider's machine and image lifecycle.
//!
//! Steps only ever talk to a provider through [`Driver`]. Polling, backoff and
//! timeouts belong to the driver: the provided `wait_*` methods implement the
//! shared polling policy on top of the required describe operations and check
//! the cancellation token on every iteration.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Parameters required to create a new machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineRequest {
    /// Name given to the machine.
    pub name: String,
    /// Provider identifier of the boot image.
    pub image_id: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// Tags applied to the machine.
    pub tags: Vec<String>,
}

impl MachineRequest {
    /// Starts a builder for a [`MachineRequest`].
    #[must_use]
    pub fn builder() -> MachineRequestBuilder {
        MachineRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Validation`] when any required field is empty.
    pub fn validate(&self) -> Result<(), DriverError> {
        for (field, value) in [
            ("name", &self.name),
            ("image_id", &self.image_id),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
        ] {
            if value.is_empty() {
                return Err(DriverError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`MachineRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachineRequestBuilder {
    name: String,
    image_id: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    tags: Vec<String>,
}

impl MachineRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the machine name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the boot image identifier.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.image_id = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the machine tags.
    #[must_use]
    pub fn tags(mut self, value: Vec<String>) -> Self {
        self.tags = value;
        self
    }

    /// Builds and validates the [`MachineRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<MachineRequest, DriverError> {
        let request = MachineRequest {
            name: self.name.trim().to_owned(),
            image_id: self.image_id.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self
                .organisation_id
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty()),
            tags: self
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Query used to resolve the source image a machine boots from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceImageQuery {
    /// Human readable image label (for example `Ubuntu 24.04 Noble Numbat`).
    pub label: String,
    /// CPU architecture of the image.
    pub architecture: String,
    /// Zone in which the image must be available.
    pub zone: String,
    /// Project searched before public images.
    pub project_id: String,
    /// Optional organisation scoping the project search.
    pub organisation_id: Option<String>,
}

/// Metadata describing a provider image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageMetadata {
    /// Provider image identifier.
    pub id: String,
    /// Image name.
    pub name: String,
    /// CPU architecture.
    pub architecture: String,
    /// Creation timestamp as reported by the provider.
    pub creation_date: String,
}

/// Handle returned by a driver once a machine has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineHandle {
    /// Provider specific identifier for the machine.
    pub id: String,
    /// Zone in which the machine was created.
    pub zone: String,
}

/// Connection details for reaching a running machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MachineNetworking {
    /// Public address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH.
    pub ssh_port: u16,
}

/// Lifecycle state reported for a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MachineState {
    /// Booting.
    Starting,
    /// Powered on.
    Running,
    /// Shutting down.
    Stopping,
    /// Powered off.
    Stopped,
    /// Locked by the provider.
    Locked,
    /// Any other provider specific state.
    Other(String),
}

impl fmt::Display for MachineState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => formatter.write_str("starting"),
            Self::Running => formatter.write_str("running"),
            Self::Stopping => formatter.write_str("stopping"),
            Self::Stopped => formatter.write_str("stopped"),
            Self::Locked => formatter.write_str("locked"),
            Self::Other(state) => formatter.write_str(state),
        }
    }
}

/// Parameters for capturing an image from a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRequest {
    /// Name given to the new image.
    pub name: String,
    /// Tags applied once the image is available.
    pub tags: Vec<String>,
}

/// Handle identifying an image produced by a build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageHandle {
    /// Provider image identifier.
    pub id: String,
    /// Zone holding the image.
    pub zone: String,
}

/// Lifecycle state reported for an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageState {
    /// Snapshot still in progress.
    Creating,
    /// Ready for use.
    Available,
    /// Provider reported a failure.
    Error,
    /// Any other provider specific state.
    Other(String),
}

/// Errors raised by drivers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when a wait exceeds its timeout.
    #[error("timeout waiting for {action} on {resource}")]
    Timeout {
        /// Condition being waited on.
        action: String,
        /// Resource identifier.
        resource: String,
    },
    /// Raised when a wait observes cancellation.
    #[error("cancelled while waiting for {action}")]
    Cancelled {
        /// Condition being waited on.
        action: String,
    },
    /// Raised when a resource disappears or cannot be found.
    #[error("{resource} not found")]
    NotFound {
        /// Resource description.
        resource: String,
    },
    /// Raised when the provider reports an image in an error state.
    #[error("image {image_id} entered an error state")]
    ImageFailed {
        /// Provider image identifier.
        image_id: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider.
        message: String,
    },
}

impl DriverError {
    /// Reports whether the error represents cancellation rather than failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Interface implemented by compute providers.
pub trait Driver: Send + Sync {
    /// Interval between two polls of a wait loop.
    fn poll_interval(&self) -> Duration;

    /// Resolves the image a new machine boots from.
    fn source_image<'a>(&'a self, query: &'a SourceImageQuery) -> DriverFuture<'a, ImageMetadata>;

    /// Creates a machine and returns a handle used for subsequent calls.
    fn create_machine<'a>(&'a self, request: &'a MachineRequest)
    -> DriverFuture<'a, MachineHandle>;

    /// Describes the machine; `None` once it no longer exists.
    fn machine_state<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, Option<MachineState>>;

    /// Returns the networking details of a running machine.
    fn machine_networking<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, MachineNetworking>;

    /// Requests the machine to power off.
    fn stop_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()>;

    /// Requests deletion of the machine and its root volume.
    fn delete_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()>;

    /// Starts capturing an image from the machine.
    fn create_image_from_machine<'a>(
        &'a self,
        handle: &'a MachineHandle,
        request: &'a ImageRequest,
    ) -> DriverFuture<'a, ImageHandle>;

    /// Describes the image; `None` when it does not exist.
    fn image_state<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, Option<ImageState>>;

    /// Replaces the tags on an image.
    fn tag_image<'a>(&'a self, image: &'a ImageHandle, tags: &'a [String]) -> DriverFuture<'a, ()>;

    /// Deletes an image.
    fn delete_image<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, ()>;

    /// Polls until the machine reports `target`.
    fn wait_for_machine_state<'a>(
        &'a self,
        handle: &'a MachineHandle,
        target: MachineState,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let action = format!("machine state {target}");
            let wanted = &target;
            let wait = PollWait::new(self.poll_interval(), timeout, cancel, &action, &handle.id);
            wait.run(|| async move {
                match self.machine_state(handle).await? {
                    Some(state) => Ok(&state == wanted),
                    None => Err(DriverError::NotFound {
                        resource: format!("machine {}", handle.id),
                    }),
                }
            })
            .await
        })
    }

    /// Polls until the machine is gone.
    fn wait_for_machine_deletion<'a>(
        &'a self,
        handle: &'a MachineHandle,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let wait = PollWait::new(
                self.poll_interval(),
                timeout,
                cancel,
                "machine deletion",
                &handle.id,
            );
            wait.run(|| async move { Ok(self.machine_state(handle).await?.is_none()) })
                .await
        })
    }

    /// Polls until the image is available.
    fn wait_for_image_creation<'a>(
        &'a self,
        image: &'a ImageHandle,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let wait = PollWait::new(
                self.poll_interval(),
                timeout,
                cancel,
                "image creation",
                &image.id,
            );
            wait.run(|| async move {
                match self.image_state(image).await? {
                    Some(ImageState::Available) => Ok(true),
                    Some(ImageState::Error) => Err(DriverError::ImageFailed {
                        image_id: image.id.clone(),
                    }),
                    Some(ImageState::Creating | ImageState::Other(_)) => Ok(false),
                    None => Err(DriverError::NotFound {
                        resource: format!("image {}", image.id),
                    }),
                }
            })
            .await
        })
    }
}

/// Returns the instant `limit` from now, or `None` when it lies beyond what
/// the clock can represent.
pub(crate) fn deadline_after(limit: Duration) -> Option<Instant> {
    Instant::now().checked_add(limit)
}

/// Reports whether `deadline` has passed. A missing deadline never expires.
pub(crate) fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

/// Bounded, cancellable polling loop shared by the provided waits.
struct PollWait<'a> {
    interval: Duration,
    timeout: Duration,
    cancel: &'a CancellationToken,
    action: &'a str,
    resource: &'a str,
}

impl<'a> PollWait<'a> {
    const fn new(
        interval: Duration,
        timeout: Duration,
        cancel: &'a CancellationToken,
        action: &'a str,
        resource: &'a str,
    ) -> Self {
        Self {
            interval,
            timeout,
            cancel,
            action,
            resource,
        }
    }

    async fn run<F, Fut>(&self, mut probe: F) -> Result<(), DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, DriverError>>,
    {
        let deadline = deadline_after(self.timeout);
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            if probe().await? {
                return Ok(());
            }
            if deadline_passed(deadline) {
                return Err(DriverError::Timeout {
                    action: self.action.to_owned(),
                    resource: self.resource.to_owned(),
                });
            }
            tracing::trace!(action = self.action, resource = self.resource, "polling");
            tokio::select! {
                () = self.cancel.cancelled() => return Err(self.cancelled()),
                () = sleep(self.interval) => {}
            }
        }
    }

    fn cancelled(&self) -> DriverError {
        DriverError::Cancelled {
            action: self.action.to_owned(),
        }
    }
}
